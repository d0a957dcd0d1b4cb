//! Field-path aware validation for test plans.
//!
//! Validators return a [`ValidationError`] naming a bare field. A
//! [`ValidationContext`] tracks where in the plan we are
//! (`stages.[2].duration`) and collects every error so a plan with several
//! problems is reported in one go.

use thiserror::Error;
use tokio::time::Duration;

use crate::utils::parse_duration_string;

/// Validation error with context about which field failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Field '{field}': {message}")]
    FieldError { field: String, message: String },

    #[error("Field '{field}': value {value} is out of range ({min} to {max})")]
    OutOfRange {
        field: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Field '{field}': invalid format - {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Field '{field}': invalid enum value '{value}'. Expected one of: {expected}")]
    InvalidEnum {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Multiple validation errors: {0}")]
    Multiple(String),
}

impl ValidationError {
    /// Replace the field name, e.g. with a full path from a [`ValidationContext`].
    pub fn at(self, path: &str) -> Self {
        let path = path.to_string();
        match self {
            ValidationError::FieldError { message, .. } => ValidationError::FieldError { field: path, message },
            ValidationError::OutOfRange { value, min, max, .. } => ValidationError::OutOfRange {
                field: path,
                value,
                min,
                max,
            },
            ValidationError::InvalidFormat { message, .. } => {
                ValidationError::InvalidFormat { field: path, message }
            }
            ValidationError::InvalidEnum { value, expected, .. } => ValidationError::InvalidEnum {
                field: path,
                value,
                expected,
            },
            multiple @ ValidationError::Multiple(_) => multiple,
        }
    }
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation context for building error messages.
#[derive(Debug, Default)]
pub struct ValidationContext {
    field_path: Vec<String>,
    errors: Vec<ValidationError>,
}

impl ValidationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a nested field context.
    pub fn enter(&mut self, field: &str) {
        self.field_path.push(field.to_string());
    }

    /// Exit the current field context.
    pub fn exit(&mut self) {
        self.field_path.pop();
    }

    /// Get the current field path as a string.
    pub fn current_path(&self) -> String {
        self.field_path.join(".")
    }

    /// Add a validation error as-is.
    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    /// Add a field error at the current path.
    pub fn field_error(&mut self, message: String) {
        self.add_error(ValidationError::FieldError {
            field: self.current_path(),
            message,
        });
    }

    /// Record the error of `result` at the current path, passing the value through.
    pub fn check<T>(&mut self, result: ValidationResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                let path = self.current_path();
                self.add_error(e.at(&path));
                None
            }
        }
    }

    /// Like [`check`](Self::check) but inside `field`.
    pub fn check_field<T>(&mut self, field: &str, result: ValidationResult<T>) -> Option<T> {
        self.enter(field);
        let value = self.check(result);
        self.exit();
        value
    }

    /// Get all collected errors.
    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Consume the context and return a result.
    pub fn into_result(self) -> Result<(), ValidationError> {
        let mut errors = self.errors;
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => {
                let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                Err(ValidationError::Multiple(messages.join("; ")))
            }
        }
    }
}

/// Validator for request URLs.
pub struct UrlValidator;

impl UrlValidator {
    pub fn validate(url: &str) -> ValidationResult<()> {
        if url.is_empty() {
            return Err(ValidationError::InvalidFormat {
                field: "url".to_string(),
                message: "URL cannot be empty".to_string(),
            });
        }

        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ValidationError::InvalidFormat {
                field: "url".to_string(),
                message: format!("URL must start with http:// or https://, got: {}", url),
            });
        }

        if url.contains(' ') {
            return Err(ValidationError::InvalidFormat {
                field: "url".to_string(),
                message: "URL cannot contain spaces".to_string(),
            });
        }

        Ok(())
    }
}

/// Validator for duration strings.
pub struct DurationValidator;

impl DurationValidator {
    pub fn parse(duration_str: &str) -> ValidationResult<Duration> {
        parse_duration_string(duration_str).map_err(|e| ValidationError::InvalidFormat {
            field: "duration".to_string(),
            message: format!("Invalid duration format '{}': {}", duration_str, e),
        })
    }

    pub fn require_positive(duration: Duration) -> ValidationResult<Duration> {
        if duration.is_zero() {
            return Err(ValidationError::OutOfRange {
                field: "duration".to_string(),
                value: "0s".to_string(),
                min: "1ms".to_string(),
                max: "unlimited".to_string(),
            });
        }
        Ok(duration)
    }
}

/// Validator for numeric ranges.
pub struct RangeValidator;

impl RangeValidator {
    pub fn validate_u64(value: u64, min: u64, max: u64, field: &str) -> ValidationResult<()> {
        if value < min || value > max {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: value.to_string(),
                min: min.to_string(),
                max: max.to_string(),
            });
        }
        Ok(())
    }

    pub fn validate_u16(value: u16, min: u16, max: u16, field: &str) -> ValidationResult<()> {
        Self::validate_u64(value as u64, min as u64, max as u64, field)
    }
}

/// Validator for HTTP methods.
pub struct HttpMethodValidator;

impl HttpMethodValidator {
    const VALID_METHODS: &'static [&'static str] =
        &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

    /// Validate and normalise to upper case.
    pub fn validate(method: &str) -> ValidationResult<String> {
        let method_upper = method.to_uppercase();
        if !Self::VALID_METHODS.contains(&method_upper.as_str()) {
            return Err(ValidationError::InvalidEnum {
                field: "method".to_string(),
                value: method.to_string(),
                expected: Self::VALID_METHODS.join(", "),
            });
        }
        Ok(method_upper)
    }
}
