use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use serde::Serialize;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::InnkeepAuthSource;
use crate::booking::{BookingDesk, BookingError, GuestForm};
use crate::model::*;
use crate::sql::{self, Command, ReservationFilter, RoomFilter};

/// The machine-facing availability check row. `ok` reflects availability
/// only when `message` is empty; a populated message means the query itself
/// failed.
#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub ok: bool,
    pub message: String,
    pub start_date: String,
    pub end_date: String,
    pub room_id: String,
}

pub struct InnkeepHandler {
    desk: Arc<BookingDesk>,
    query_parser: Arc<InnkeepQueryParser>,
}

impl InnkeepHandler {
    pub fn new(desk: Arc<BookingDesk>) -> Self {
        Self {
            desk,
            query_parser: Arc::new(InnkeepQueryParser),
        }
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = crate::observability::command_label(&cmd);
        let start = std::time::Instant::now();
        let result = self.dispatch_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(
            crate::observability::QUERIES_TOTAL,
            "command" => label, "status" => status
        )
        .increment(1);
        metrics::histogram!(
            crate::observability::QUERY_DURATION_SECONDS,
            "command" => label
        )
        .record(start.elapsed().as_secs_f64());
        result
    }

    async fn dispatch_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = self.desk.engine();
        match cmd {
            Command::InsertRoom { id, name } => {
                engine.create_room(id, &name).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::RenameRoom { id, name } => {
                engine.rename_room(id, &name).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteRoom { id } => {
                engine.delete_room(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectRooms { filter } => {
                let rooms = match filter {
                    RoomFilter::All => engine.list_rooms().await,
                    RoomFilter::ById(id) => engine.room_info(id).await.into_iter().collect(),
                    RoomFilter::ByName(name) => {
                        engine.find_room_by_name(&name).await.into_iter().collect()
                    }
                };
                Ok(vec![rooms_response(&rooms)])
            }
            Command::InsertRestriction { id, room_id, stay } => {
                engine
                    .add_restriction(id, room_id, stay)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteRestriction { id } => {
                engine.remove_restriction(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectRestrictions { room_id, window } => {
                let restrictions = engine
                    .restrictions_for_room(room_id, window)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![restrictions_response(&restrictions)?])
            }
            Command::InsertBooking {
                id,
                room_id,
                stay,
                first_name,
                last_name,
                email,
                phone,
            } => {
                let form = GuestForm {
                    first_name,
                    last_name,
                    email,
                    phone,
                };
                self.desk
                    .book_room(id, room_id, stay, &form)
                    .await
                    .map_err(booking_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteReservation { id } => {
                engine.cancel_reservation(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SetProcessed { id, processed } => {
                engine
                    .set_processed(id, processed)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::UpdateGuest {
                id,
                first_name,
                last_name,
                email,
                phone,
            } => {
                crate::validate::validate_guest(&first_name, &last_name, &email, &phone)
                    .map_err(|e| booking_err(BookingError::Input(e)))?;
                let guest = crate::engine::GuestDetails {
                    first_name,
                    last_name,
                    email,
                    phone,
                };
                engine.update_guest(id, &guest).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectReservations { filter } => {
                let views = match filter {
                    ReservationFilter::All => engine.list_reservations().await,
                    ReservationFilter::OnlyNew => engine.new_reservations().await,
                    ReservationFilter::ById(id) => {
                        engine.get_reservation(id).await.into_iter().collect()
                    }
                };
                Ok(vec![reservations_response(&views)?])
            }
            Command::SearchAvailability { stay } => {
                let rooms = engine.find_available_rooms(stay).await.map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let rows: Vec<PgWireResult<_>> = rooms
                    .iter()
                    .map(|room| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&room.id.to_string())?;
                        encoder.encode_field(&room.name)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::CheckAvailability { room_id, stay } => {
                let check = match engine.is_available(room_id, stay).await {
                    Ok(available) => CheckResponse {
                        ok: available,
                        message: String::new(),
                        start_date: stay.start.to_string(),
                        end_date: stay.end.to_string(),
                        room_id: room_id.to_string(),
                    },
                    Err(e) => CheckResponse {
                        ok: false,
                        message: e.to_string(),
                        start_date: stay.start.to_string(),
                        end_date: stay.end.to_string(),
                        room_id: room_id.to_string(),
                    },
                };

                let schema = Arc::new(check_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&check.ok)?;
                encoder.encode_field(&check.message)?;
                encoder.encode_field(&check.start_date)?;
                encoder.encode_field(&check.end_date)?;
                encoder.encode_field(&check.room_id)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectNotification { reservation_id } => {
                let status = self.desk.mailer().status(&reservation_id);

                let schema = Arc::new(notifications_schema());
                let rows: Vec<PgWireResult<_>> = status
                    .into_iter()
                    .map(|status| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&reservation_id.to_string())?;
                        encoder.encode_field(&status.as_str())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
        }
    }
}

// ── Row schemas ──────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn rooms_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        text_field("created_at"),
        text_field("updated_at"),
    ]
}

fn restrictions_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("room_id"),
        text_field("start_date"),
        text_field("end_date"),
        text_field("reservation_id"),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("first_name"),
        text_field("last_name"),
        text_field("email"),
        text_field("phone"),
        text_field("start_date"),
        text_field("end_date"),
        text_field("room_id"),
        text_field("room_name"),
        FieldInfo::new("processed".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text_field("room_id"), text_field("name")]
}

fn check_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("ok".into(), None, None, Type::BOOL, FieldFormat::Text),
        text_field("message"),
        text_field("start_date"),
        text_field("end_date"),
        text_field("room_id"),
    ]
}

fn notifications_schema() -> Vec<FieldInfo> {
    vec![text_field("reservation_id"), text_field("status")]
}

fn rooms_response(rooms: &[RoomInfo]) -> Response {
    let schema = Arc::new(rooms_schema());
    let rows: Vec<PgWireResult<_>> = rooms
        .iter()
        .map(|room| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&room.id.to_string())?;
            encoder.encode_field(&room.name)?;
            encoder.encode_field(&room.created_at.to_rfc3339())?;
            encoder.encode_field(&room.updated_at.to_rfc3339())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn restrictions_response(restrictions: &[Restriction]) -> PgWireResult<Response> {
    let schema = Arc::new(restrictions_schema());
    let rows: Vec<PgWireResult<_>> = restrictions
        .iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.room_id.to_string())?;
            encoder.encode_field(&r.stay.start.to_string())?;
            encoder.encode_field(&r.stay.end.to_string())?;
            encoder.encode_field(&r.reservation_id.map(|id| id.to_string()))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn reservations_response(views: &[ReservationView]) -> PgWireResult<Response> {
    let schema = Arc::new(reservations_schema());
    let rows: Vec<PgWireResult<_>> = views
        .iter()
        .map(|view| {
            let r = &view.reservation;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.first_name)?;
            encoder.encode_field(&r.last_name)?;
            encoder.encode_field(&r.email)?;
            encoder.encode_field(&r.phone)?;
            encoder.encode_field(&r.stay.start.to_string())?;
            encoder.encode_field(&r.stay.end.to_string())?;
            encoder.encode_field(&r.room_id.to_string())?;
            encoder.encode_field(&view.room_name)?;
            encoder.encode_field(&r.processed)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for InnkeepHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.execute_command(cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct InnkeepQueryParser;

#[async_trait]
impl QueryParser for InnkeepQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt))
    }
}

/// Best-effort schema for Describe before parameters are bound. The parsed
/// command is not available yet, so key off table names in the SQL text.
fn statement_schema(stmt: &str) -> Vec<FieldInfo> {
    let upper = stmt.to_uppercase();
    if !upper.contains("SELECT") {
        return vec![];
    }
    if upper.contains("AVAILABILITY") {
        if upper.contains("ROOM_ID") {
            check_schema()
        } else {
            availability_schema()
        }
    } else if upper.contains("NOTIFICATIONS") {
        notifications_schema()
    } else if upper.contains("RESERVATIONS") {
        reservations_schema()
    } else if upper.contains("RESTRICTIONS") {
        restrictions_schema()
    } else if upper.contains("ROOMS") {
        rooms_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl ExtendedQueryHandler for InnkeepHandler {
    type Statement = String;
    type QueryParser = InnkeepQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_command(cmd).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            statement_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct InnkeepFactory {
    handler: Arc<InnkeepHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<InnkeepAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl InnkeepFactory {
    pub fn new(desk: Arc<BookingDesk>, password: String) -> Self {
        let auth_source = InnkeepAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(InnkeepHandler::new(desk)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for InnkeepFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Run the pgwire protocol over one accepted socket until the client hangs up.
pub async fn process_connection(
    socket: TcpStream,
    desk: Arc<BookingDesk>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let factory = Arc::new(InnkeepFactory::new(desk, password));
    pgwire::tokio::process_socket(socket, tls, factory).await?;
    Ok(())
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    use crate::engine::EngineError;
    let code = match &e {
        EngineError::Conflict(_) => "40001",
        EngineError::NotFound(_) => "P0002",
        _ => "P0001",
    };
    let message = match &e {
        EngineError::Conflict(_) => "room is no longer available for those dates".to_string(),
        other => other.to_string(),
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn booking_err(e: BookingError) -> PgWireError {
    let code = match &e {
        BookingError::Input(_) => "23514",
        BookingError::Conflict => "40001",
        BookingError::RoomVanished(_) => "P0002",
        _ => "P0001",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_response_field_names() {
        let check = CheckResponse {
            ok: true,
            message: String::new(),
            start_date: "2024-06-10".into(),
            end_date: "2024-06-15".into(),
            room_id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".into(),
        };
        let json = serde_json::to_value(&check).unwrap();
        let obj = json.as_object().unwrap();
        for key in ["ok", "message", "start_date", "end_date", "room_id"] {
            assert!(obj.contains_key(key), "missing field {key}");
        }
        assert_eq!(obj.len(), 5);
    }

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM rooms"), 0);
        assert_eq!(count_params("SELECT * FROM rooms WHERE id = $1"), 1);
        assert_eq!(
            count_params("INSERT INTO rooms (id, name) VALUES ($1, $2)"),
            2
        );
    }

    #[test]
    fn statement_schema_picks_table() {
        assert_eq!(statement_schema("SELECT * FROM rooms").len(), 4);
        assert_eq!(statement_schema("SELECT * FROM reservations").len(), 10);
        assert_eq!(
            statement_schema(
                "SELECT * FROM availability WHERE start_date = '2024-06-10' AND end_date = '2024-06-15'"
            )
            .len(),
            2
        );
        assert_eq!(
            statement_schema(
                "SELECT * FROM availability WHERE room_id = 'x' AND start_date = 'a' AND end_date = 'b'"
            )
            .len(),
            5
        );
        assert!(statement_schema("DELETE FROM rooms WHERE id = 'x'").is_empty());
    }
}
