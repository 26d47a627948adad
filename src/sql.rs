use chrono::NaiveDate;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::StayRange;

#[derive(Debug, PartialEq, Eq)]
pub enum RoomFilter {
    All,
    ById(Ulid),
    ByName(String),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReservationFilter {
    All,
    OnlyNew,
    ById(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom {
        id: Ulid,
        name: String,
    },
    RenameRoom {
        id: Ulid,
        name: String,
    },
    DeleteRoom {
        id: Ulid,
    },
    SelectRooms {
        filter: RoomFilter,
    },
    InsertRestriction {
        id: Ulid,
        room_id: Ulid,
        stay: StayRange,
    },
    DeleteRestriction {
        id: Ulid,
    },
    SelectRestrictions {
        room_id: Ulid,
        window: StayRange,
    },
    /// The one-shot booking commit: room + stay + guest form in one row.
    InsertBooking {
        id: Ulid,
        room_id: Ulid,
        stay: StayRange,
        first_name: String,
        last_name: String,
        email: String,
        phone: String,
    },
    DeleteReservation {
        id: Ulid,
    },
    SetProcessed {
        id: Ulid,
        processed: bool,
    },
    UpdateGuest {
        id: Ulid,
        first_name: String,
        last_name: String,
        email: String,
        phone: String,
    },
    SelectReservations {
        filter: ReservationFilter,
    },
    /// Which rooms are free for the stay.
    SearchAvailability {
        stay: StayRange,
    },
    /// Is this one room free for the stay.
    CheckAvailability {
        room_id: Ulid,
        stay: StayRange,
    },
    SelectNotification {
        reservation_id: Ulid,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "rooms" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("rooms", 2, values.len()));
            }
            Ok(Command::InsertRoom {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
            })
        }
        "restrictions" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("restrictions", 4, values.len()));
            }
            Ok(Command::InsertRestriction {
                id: parse_ulid(&values[0])?,
                room_id: parse_ulid(&values[1])?,
                stay: make_stay(parse_date(&values[2])?, parse_date(&values[3])?)?,
            })
        }
        "bookings" => {
            if values.len() < 8 {
                return Err(SqlError::WrongArity("bookings", 8, values.len()));
            }
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                room_id: parse_ulid(&values[1])?,
                stay: make_stay(parse_date(&values[2])?, parse_date(&values[3])?)?,
                first_name: parse_string(&values[4])?,
                last_name: parse_string(&values[5])?,
                email: parse_string(&values[6])?,
                phone: parse_string(&values[7])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection, "id")?;

    let mut set: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = assignment_column(a).ok_or_else(|| SqlError::Parse("bad SET target".into()))?;
        set.push((col, &a.value));
    }
    let find = |col: &str| set.iter().find(|(c, _)| c == col).map(|(_, e)| *e);

    match table.as_str() {
        "rooms" => {
            let name = find("name").ok_or(SqlError::MissingFilter("name"))?;
            Ok(Command::RenameRoom {
                id,
                name: parse_string(name)?,
            })
        }
        "reservations" => {
            if let Some(expr) = find("processed") {
                if set.len() != 1 {
                    return Err(SqlError::Unsupported(
                        "mixing processed with other columns".into(),
                    ));
                }
                return Ok(Command::SetProcessed {
                    id,
                    processed: parse_bool(expr)?,
                });
            }
            let first_name = find("first_name").ok_or(SqlError::MissingFilter("first_name"))?;
            let last_name = find("last_name").ok_or(SqlError::MissingFilter("last_name"))?;
            let email = find("email").ok_or(SqlError::MissingFilter("email"))?;
            let phone = find("phone").ok_or(SqlError::MissingFilter("phone"))?;
            Ok(Command::UpdateGuest {
                id,
                first_name: parse_string(first_name)?,
                last_name: parse_string(last_name)?,
                email: parse_string(email)?,
                phone: parse_string(phone)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection, "id")?;

    match table.as_str() {
        "rooms" => Ok(Command::DeleteRoom { id }),
        "restrictions" => Ok(Command::DeleteRestriction { id }),
        "reservations" => Ok(Command::DeleteReservation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "rooms" => parse_select_rooms(&select.selection),
        "reservations" => parse_select_reservations(&select.selection),
        "restrictions" => parse_select_restrictions(&select.selection),
        "availability" => parse_select_availability(&select.selection),
        "notifications" => {
            let reservation_id = extract_where_id(&select.selection, "reservation_id")?;
            Ok(Command::SelectNotification { reservation_id })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select_rooms(selection: &Option<Expr>) -> Result<Command, SqlError> {
    let Some(selection) = selection else {
        return Ok(Command::SelectRooms {
            filter: RoomFilter::All,
        });
    };
    match selection {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => match expr_column_name(left).as_deref() {
            Some("id") => Ok(Command::SelectRooms {
                filter: RoomFilter::ById(parse_ulid(right)?),
            }),
            Some("name") => Ok(Command::SelectRooms {
                filter: RoomFilter::ByName(parse_string(right)?),
            }),
            _ => Err(SqlError::Unsupported("rooms filter".into())),
        },
        _ => Err(SqlError::Unsupported("rooms filter".into())),
    }
}

fn parse_select_reservations(selection: &Option<Expr>) -> Result<Command, SqlError> {
    let Some(selection) = selection else {
        return Ok(Command::SelectReservations {
            filter: ReservationFilter::All,
        });
    };
    match selection {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => match expr_column_name(left).as_deref() {
            Some("id") => Ok(Command::SelectReservations {
                filter: ReservationFilter::ById(parse_ulid(right)?),
            }),
            Some("processed") => {
                if parse_bool(right)? {
                    Err(SqlError::Unsupported("processed = true filter".into()))
                } else {
                    Ok(Command::SelectReservations {
                        filter: ReservationFilter::OnlyNew,
                    })
                }
            }
            _ => Err(SqlError::Unsupported("reservations filter".into())),
        },
        _ => Err(SqlError::Unsupported("reservations filter".into())),
    }
}

fn parse_select_restrictions(selection: &Option<Expr>) -> Result<Command, SqlError> {
    let (mut room_id, mut start, mut end) = (None, None, None);
    if let Some(selection) = selection {
        extract_window_filters(selection, &mut room_id, &mut start, &mut end)?;
    }
    Ok(Command::SelectRestrictions {
        room_id: room_id.ok_or(SqlError::MissingFilter("room_id"))?,
        window: make_stay(
            start.ok_or(SqlError::MissingFilter("start_date"))?,
            end.ok_or(SqlError::MissingFilter("end_date"))?,
        )?,
    })
}

fn parse_select_availability(selection: &Option<Expr>) -> Result<Command, SqlError> {
    let (mut room_id, mut start, mut end) = (None, None, None);
    if let Some(selection) = selection {
        extract_window_filters(selection, &mut room_id, &mut start, &mut end)?;
    }
    let stay = make_stay(
        start.ok_or(SqlError::MissingFilter("start_date"))?,
        end.ok_or(SqlError::MissingFilter("end_date"))?,
    )?;
    match room_id {
        Some(room_id) => Ok(Command::CheckAvailability { room_id, stay }),
        None => Ok(Command::SearchAvailability { stay }),
    }
}

/// Walk an AND-tree of filters collecting `room_id`, `start_date`,
/// `end_date`. Both `=` and the range operators (`>=` for start, `<=` for
/// end) are accepted on the date columns.
fn extract_window_filters(
    expr: &Expr,
    room_id: &mut Option<Ulid>,
    start: &mut Option<NaiveDate>,
    end: &mut Option<NaiveDate>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_window_filters(left, room_id, start, end)?;
                extract_window_filters(right, room_id, start, end)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("room_id") => *room_id = Some(parse_ulid(right)?),
                Some("start_date") => *start = Some(parse_date(right)?),
                Some("end_date") => *end = Some(parse_date(right)?),
                _ => {}
            },
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start_date") {
                    *start = Some(parse_date(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end_date") {
                    *end = Some(parse_date(right)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

fn make_stay(start: NaiveDate, end: NaiveDate) -> Result<StayRange, SqlError> {
    if start >= end {
        return Err(SqlError::Parse(format!(
            "start_date {start} must be before end_date {end}"
        )));
    }
    Ok(StayRange::new(start, end))
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn assignment_column(assignment: &ast::Assignment) -> Option<String> {
    match &assignment.target {
        ast::AssignmentTarget::ColumnName(name) => object_name_last(name),
        _ => None,
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>, column: &'static str) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter(column))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some(column) {
                parse_ulid(right)
            } else {
                Err(SqlError::MissingFilter(column))
            }
        }
        _ => Err(SqlError::MissingFilter(column)),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?} (want YYYY-MM-DD): {e}")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
