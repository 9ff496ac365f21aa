//! Namespaces scope topics and engine objects

use crate::error::{MeterflowError, Result};

/// Namespace used when the caller does not name one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Maximum namespace length
pub const MAX_NAMESPACE_LEN: usize = 64;

/// Characters allowed in namespaces and meter slugs.
///
/// Engine object names are the uppercased name, so the set excludes
/// uppercase letters and `-` to keep that mapping one to one.
pub fn is_name_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'
}

/// Validate a namespace name
pub fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() || namespace.len() > MAX_NAMESPACE_LEN {
        return Err(MeterflowError::Validation(format!(
            "namespace must be 1 to {} characters",
            MAX_NAMESPACE_LEN
        )));
    }

    if !namespace.chars().all(is_name_char) {
        return Err(MeterflowError::Validation(format!(
            "namespace {:?} may only contain lowercase letters, digits and '_'",
            namespace
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_namespace() {
        assert!(validate_namespace(DEFAULT_NAMESPACE).is_ok());
        assert!(validate_namespace("team_a01").is_ok());
        assert!(validate_namespace("team-a").is_err());
        assert!(validate_namespace("Team").is_err());
        assert!(validate_namespace("").is_err());
        assert!(validate_namespace("a b").is_err());
        assert!(validate_namespace("x'; DROP").is_err());
        assert!(validate_namespace(&"n".repeat(65)).is_err());
    }
}
