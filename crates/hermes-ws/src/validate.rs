//! Three-tier payload validation.
//!
//! Inbound payloads arrive as raw bytes with no schema attached. A
//! [`Validator`] is offered the payload in up to three shapes, cheapest
//! first:
//!
//! 1. [`RawValue::Bytes`]: the untouched byte buffer
//! 2. [`RawValue::Text`]: the buffer decoded as UTF-8 (lossily)
//! 3. [`RawValue::Json`]: the text parsed as JSON
//!
//! The first shape the validator accepts wins. A validator that only
//! understands one shape simply rejects the others; [`parse_with`] keeps
//! escalating until it runs out of tiers.

use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Why a payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("validation failed at `{path}`: {message}")]
pub struct ValidationError {
    /// Dotted path into the payload where validation failed. Empty for
    /// top-level failures.
    pub path: String,
    /// What went wrong.
    pub message: String,
}

impl ValidationError {
    /// Create a validation error for the given path.
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A payload in one of the three shapes offered to validators.
#[derive(Debug, Clone)]
pub enum RawValue<'a> {
    /// The raw byte buffer as received.
    Bytes(&'a [u8]),
    /// The buffer decoded as UTF-8.
    Text(&'a str),
    /// The text parsed as JSON.
    Json(serde_json::Value),
}

/// Checks a payload shape and produces a typed value.
///
/// Any `Fn(RawValue<'_>, &str) -> Result<T, ValidationError>` closure is a
/// validator, so ad-hoc checks do not need a named type.
pub trait Validator<T>: Send + Sync {
    /// Validate `value`, reporting failures under `path`.
    fn validate(&self, value: RawValue<'_>, path: &str) -> Result<T, ValidationError>;
}

impl<T, F> Validator<T> for F
where
    F: Fn(RawValue<'_>, &str) -> Result<T, ValidationError> + Send + Sync,
{
    fn validate(&self, value: RawValue<'_>, path: &str) -> Result<T, ValidationError> {
        self(value, path)
    }
}

/// Run a payload through the three tiers against `validator`.
///
/// Returns the first accepted value. If all tiers are rejected, the error
/// from the final tier is returned; when the payload is not valid JSON the
/// parse failure itself becomes the error.
pub fn parse_with<T>(data: &[u8], validator: &dyn Validator<T>) -> Result<T, ValidationError> {
    if let Ok(value) = validator.validate(RawValue::Bytes(data), "") {
        return Ok(value);
    }
    let text = String::from_utf8_lossy(data);
    if let Ok(value) = validator.validate(RawValue::Text(&text), "") {
        return Ok(value);
    }
    let json: serde_json::Value = serde_json::from_str(&text)
        .map_err(|err| ValidationError::new("", format!("payload is not valid JSON: {err}")))?;
    validator.validate(RawValue::Json(json), "")
}

/// Accepts only the raw byte tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesValidator;

impl Validator<Bytes> for BytesValidator {
    fn validate(&self, value: RawValue<'_>, path: &str) -> Result<Bytes, ValidationError> {
        match value {
            RawValue::Bytes(data) => Ok(Bytes::copy_from_slice(data)),
            _ => Err(ValidationError::new(path, "expected a raw byte buffer")),
        }
    }
}

/// Accepts only the text tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextValidator;

impl Validator<String> for TextValidator {
    fn validate(&self, value: RawValue<'_>, path: &str) -> Result<String, ValidationError> {
        match value {
            RawValue::Text(text) => Ok(text.to_owned()),
            _ => Err(ValidationError::new(path, "expected text")),
        }
    }
}

/// Accepts only the JSON tier, deserializing into `T`.
#[derive(Debug)]
pub struct JsonValidator<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonValidator<T> {
    /// Create a JSON validator for `T`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonValidator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonValidator<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Validator<T> for JsonValidator<T> {
    fn validate(&self, value: RawValue<'_>, path: &str) -> Result<T, ValidationError> {
        match value {
            RawValue::Json(json) => serde_json::from_value(json)
                .map_err(|err| ValidationError::new(path, err.to_string())),
            _ => Err(ValidationError::new(path, "expected JSON")),
        }
    }
}
