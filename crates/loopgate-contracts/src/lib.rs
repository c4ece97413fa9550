//! Shared validation contract for the Loopgate engines.
//!
//! Every engine input implements [`Validate`]; callers run it before any rule
//! evaluation so a malformed request never yields a partially computed result.

/// Shared error type for contract validation routines.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ContractError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("field {field} must be finite (got {value})")]
    NotFinite { field: &'static str, value: f64 },
    #[error("field {field} out of range: {reason}")]
    OutOfRange {
        field: &'static str,
        reason: &'static str,
    },
    #[error("assertion failed: {0}")]
    AssertionFailed(String),
}

/// Lightweight semantic validation layered on top of serde deserialization.
pub trait Validate {
    fn validate(&self) -> Result<(), ContractError>;
}

impl<T: Validate> Validate for Option<T> {
    fn validate(&self) -> Result<(), ContractError> {
        match self {
            Some(inner) => inner.validate(),
            None => Ok(()),
        }
    }
}

impl<T: Validate> Validate for Vec<T> {
    fn validate(&self) -> Result<(), ContractError> {
        self.iter().try_for_each(Validate::validate)
    }
}

pub fn require_non_empty(field: &'static str, value: &str) -> Result<(), ContractError> {
    if value.trim().is_empty() {
        return Err(ContractError::MissingField(field));
    }
    Ok(())
}

pub fn require_finite(field: &'static str, value: f64) -> Result<(), ContractError> {
    if !value.is_finite() {
        return Err(ContractError::NotFinite { field, value });
    }
    Ok(())
}

pub fn require_non_negative(field: &'static str, value: f64) -> Result<(), ContractError> {
    require_finite(field, value)?;
    if value < 0.0 {
        return Err(ContractError::OutOfRange {
            field,
            reason: "must be >= 0",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Level(f64);

    impl Validate for Level {
        fn validate(&self) -> Result<(), ContractError> {
            require_non_negative("level", self.0)
        }
    }

    #[test]
    fn non_finite_values_are_rejected() {
        assert_eq!(
            require_finite("severity", f64::NAN).unwrap_err().to_string(),
            "field severity must be finite (got NaN)"
        );
        assert!(require_finite("severity", f64::INFINITY).is_err());
        assert!(require_finite("severity", 1.5).is_ok());
    }

    #[test]
    fn blank_strings_count_as_missing() {
        assert_eq!(
            require_non_empty("loop_id", "  "),
            Err(ContractError::MissingField("loop_id"))
        );
    }

    #[test]
    fn collections_validate_every_item() {
        assert!(vec![Level(0.0), Level(1.0)].validate().is_ok());
        assert!(vec![Level(0.0), Level(-1.0)].validate().is_err());
        assert!(None::<Level>.validate().is_ok());
    }
}
