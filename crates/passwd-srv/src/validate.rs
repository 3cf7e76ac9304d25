//! Input validation for account operations.
//!
//! All validation is pure and returns Ok(()) or Err(String) with a
//! human-readable message.

/// Maximum username length accepted for account creation and deletion.
pub const USER_NAME_MAX_LENGTH: usize = 32;

/// Validate a username before it is handed to `useradd`/`userdel`.
///
/// Rules:
/// - Not empty
/// - Max 32 characters
/// - Starts with a lowercase letter or underscore
/// - Only lowercase ascii, digits, underscore, hyphen
pub fn validate_username(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("username is empty".into());
    }
    if name.len() > USER_NAME_MAX_LENGTH {
        return Err(format!(
            "username too long ({} > {USER_NAME_MAX_LENGTH})",
            name.len()
        ));
    }
    if !name.starts_with(|c: char| c.is_ascii_lowercase() || c == '_') {
        return Err(format!(
            "username '{name}' must start with a lowercase letter or '_'"
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err("username contains invalid characters (allowed: a-z, 0-9, _, -)".into());
    }
    Ok(())
}
