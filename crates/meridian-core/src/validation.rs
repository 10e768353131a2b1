//! # Validation Module
//!
//! Credential checks performed before a login request leaves the client.

use crate::error::ValidationError;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Maximum accepted email length.
pub const MAX_EMAIL_LENGTH: usize = 254;

/// Validates an email address.
///
/// ## Rules
/// - Must not be empty (after trimming)
/// - At most 254 characters
/// - Exactly one `@` with text on both sides
///
/// ## Example
/// ```rust
/// use meridian_core::validation::validate_email;
///
/// assert!(validate_email("ops@meridian.io").is_ok());
/// assert!(validate_email("nope").is_err());
/// ```
pub fn validate_email(email: &str) -> ValidationResult<()> {
    let email = email.trim();

    if email.is_empty() {
        return Err(ValidationError::Required {
            field: "email".to_string(),
        });
    }

    if email.len() > MAX_EMAIL_LENGTH {
        return Err(ValidationError::TooLong {
            field: "email".to_string(),
            max: MAX_EMAIL_LENGTH,
        });
    }

    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !domain.contains('@') => {
            Ok(())
        }
        _ => Err(ValidationError::InvalidFormat {
            field: "email".to_string(),
            reason: "expected name@domain".to_string(),
        }),
    }
}

/// Validates that a password was supplied.
pub fn validate_password(password: &str) -> ValidationResult<()> {
    if password.is_empty() {
        return Err(ValidationError::Required {
            field: "password".to_string(),
        });
    }
    Ok(())
}

/// Validates a login form.
pub fn validate_credentials(email: &str, password: &str) -> ValidationResult<()> {
    validate_email(email)?;
    validate_password(password)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_email() {
        assert!(validate_email("a@b.com").is_ok());
        assert!(validate_email("  a@b.com  ").is_ok());
        assert_eq!(
            validate_email(""),
            Err(ValidationError::Required {
                field: "email".into()
            })
        );
        assert!(validate_email("@b.com").is_err());
        assert!(validate_email("a@").is_err());
        assert!(validate_email("a@b@c").is_err());
        assert!(validate_email(&format!("{}@x.io", "a".repeat(260))).is_err());
    }

    #[test]
    fn test_validate_credentials() {
        assert!(validate_credentials("a@b.com", "secret").is_ok());
        assert_eq!(
            validate_credentials("a@b.com", "").unwrap_err().to_string(),
            "password is required"
        );
    }
}
