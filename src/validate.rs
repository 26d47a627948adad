//! Guest form validation. Failures are per-field messages suitable for
//! echoing straight back to the client; nothing is written on failure.

use std::collections::BTreeMap;

/// Field name → human-readable message. BTreeMap keeps the output stable.
pub type FieldErrors = BTreeMap<&'static str, String>;

const MIN_NAME_LEN: usize = 3;

pub fn validate_guest(
    first_name: &str,
    last_name: &str,
    email: &str,
    phone: &str,
) -> Result<(), FieldErrors> {
    let mut errors = FieldErrors::new();

    check_name(&mut errors, "first_name", first_name);
    check_name(&mut errors, "last_name", last_name);

    if email.trim().is_empty() {
        errors.insert("email", "this field cannot be blank".into());
    } else if !plausible_email(email) {
        errors.insert("email", "invalid email address".into());
    }

    if phone.trim().is_empty() {
        errors.insert("phone", "this field cannot be blank".into());
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

fn check_name(errors: &mut FieldErrors, field: &'static str, value: &str) {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        errors.insert(field, "this field cannot be blank".into());
    } else if trimmed.chars().count() < MIN_NAME_LEN {
        errors.insert(field, format!("must be at least {MIN_NAME_LEN} characters"));
    }
}

/// Shape check only: one `@`, non-empty local part, domain with an interior
/// dot. Deliverability is the transport's problem.
fn plausible_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.is_empty() {
        return false;
    }
    if domain.starts_with('.') || domain.ends_with('.') {
        return false;
    }
    domain.contains('.') && !email.contains(char::is_whitespace)
}
