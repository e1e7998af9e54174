//! Thrown values and error normalization.
//!
//! Work functions fail by returning a [`Thrown`] value. The engine never
//! forwards a thrown value as-is: it projects it onto a [`NormalizedError`],
//! a small record holding at most four string fields (`name`, `message`,
//! `stack`, `code`). Anything else found on the thrown value is dropped, so
//! the record is always serializable and can never recurse.
//!
//! # Sources of thrown values
//!
//! | constructor | normalized as |
//! |---|---|
//! | any `std::error::Error` (via `?` or [`Thrown::error`]) | `name` = `"Error"` (or [`Thrown::with_name`]), `message` = `Display`, `stack` = cause chain + backtrace |
//! | [`Thrown::value`] with a JSON object | the allow-listed keys found on the object |
//! | [`Thrown::value`] with anything else | empty record |
//! | [`Thrown::named`] | `name` + `message` |
//! | a panic inside the work task | `name` = `"Panic"`, `message` = panic payload |
//!
//! An operation may replace all of this with a custom serializer, in which
//! case the error payload is [`SerializedError::Custom`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error as StdError;
use std::fmt::{self, Write as _};
use thiserror::Error;

/// Error name used for aborted invocations
pub const ABORT_ERROR_NAME: &str = "AbortError";

/// Message used when `abort` is called without a reason
pub const DEFAULT_ABORT_MESSAGE: &str = "Aborted";

/// Error name used when the gating predicate vetoes an invocation
pub const CONDITION_ERROR_NAME: &str = "ConditionError";

/// Message carried by the condition error
pub const CONDITION_ERROR_MESSAGE: &str = "Aborted due to condition callback returning false.";

/// Error name used for panics in the work task
pub const PANIC_ERROR_NAME: &str = "Panic";

/// Error name used when a `std::error::Error` carries no explicit name
pub const DEFAULT_ERROR_NAME: &str = "Error";

/// Keys copied from thrown JSON objects, in output order
const ALLOWED_KEYS: [&str; 4] = ["name", "message", "stack", "code"];

/// Minimal, serializable description of a thrown value
///
/// All fields are optional; a thrown value exposing none of them normalizes
/// to the empty record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NormalizedError {
    /// Error class name (e.g. `"Error"`, `"AbortError"`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Human readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Rendered stack / cause chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// Application specific error code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl NormalizedError {
    /// Build a record with only `name` and `message` set
    #[must_use]
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            message: Some(message.into()),
            stack: None,
            code: None,
        }
    }

    /// `true` when no field is set
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.name.is_none() && self.message.is_none() && self.stack.is_none() && self.code.is_none()
    }

    /// Drop the `stack` field
    #[must_use]
    pub fn without_stack(mut self) -> Self {
        self.stack = None;
        self
    }
}

impl fmt::Display for NormalizedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, &self.message) {
            (Some(name), Some(message)) => write!(f, "{name}: {message}"),
            (Some(name), None) => f.write_str(name),
            (None, Some(message)) => f.write_str(message),
            (None, None) => f.write_str("unknown error"),
        }
    }
}

impl StdError for NormalizedError {}

/// Error payload carried by a failed lifecycle event
///
/// Serializes untagged: the normalized record appears as an object with its
/// set fields, a custom payload appears exactly as the serializer produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SerializedError {
    /// Produced by the built-in normalizer
    Normalized(NormalizedError),

    /// Produced by an operation's custom serializer, used verbatim
    Custom(Value),
}

impl SerializedError {
    /// The normalized record, if the built-in normalizer produced this payload
    #[must_use]
    pub const fn as_normalized(&self) -> Option<&NormalizedError> {
        match self {
            Self::Normalized(error) => Some(error),
            Self::Custom(_) => None,
        }
    }

    /// The custom payload, if a custom serializer produced this payload
    #[must_use]
    pub const fn as_custom(&self) -> Option<&Value> {
        match self {
            Self::Normalized(_) => None,
            Self::Custom(value) => Some(value),
        }
    }

    /// Error name, looked up on either representation
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Normalized(error) => error.name.as_deref(),
            Self::Custom(value) => value.get("name").and_then(Value::as_str),
        }
    }

    /// Error message, looked up on either representation
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Normalized(error) => error.message.as_deref(),
            Self::Custom(value) => value.get("message").and_then(Value::as_str),
        }
    }
}

impl From<NormalizedError> for SerializedError {
    fn from(error: NormalizedError) -> Self {
        Self::Normalized(error)
    }
}

impl fmt::Display for SerializedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normalized(error) => error.fmt(f),
            Self::Custom(value) => write!(f, "{value}"),
        }
    }
}

impl StdError for SerializedError {}

/// Internal representation of a thrown value
enum Repr {
    Error {
        source: Box<dyn StdError + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    Value(Value),
    Panic(Option<String>),
}

/// A value "thrown" by a work function or gating predicate
///
/// Any `std::error::Error + Send + Sync + 'static` converts into `Thrown`, so
/// `?` works inside work functions:
///
/// ```
/// use composable_ops_core::error::{mini_serialize_error, Thrown};
///
/// fn parse(input: &str) -> Result<u32, Thrown> {
///     Ok(input.parse::<u32>()?)
/// }
///
/// let thrown = parse("nope").unwrap_err();
/// let normalized = mini_serialize_error(&thrown);
/// assert_eq!(normalized.name.as_deref(), Some("Error"));
/// ```
///
/// `Thrown` intentionally does not implement `std::error::Error` itself,
/// which is what allows the blanket conversion.
pub struct Thrown {
    repr: Repr,
    name: Option<String>,
    code: Option<String>,
}

impl Thrown {
    /// Wrap a `std::error::Error`, capturing a backtrace if enabled
    pub fn error<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::boxed(Box::new(error))
    }

    /// Wrap an already boxed error
    #[must_use]
    pub fn boxed(source: Box<dyn StdError + Send + Sync + 'static>) -> Self {
        Self {
            repr: Repr::Error {
                source,
                backtrace: Backtrace::capture(),
            },
            name: None,
            code: None,
        }
    }

    /// Throw arbitrary data
    ///
    /// Objects are inspected for the allow-listed keys; primitives, arrays
    /// and `null` normalize to the empty record.
    pub fn value(value: impl Into<Value>) -> Self {
        Self {
            repr: Repr::Value(value.into()),
            name: None,
            code: None,
        }
    }

    /// Throw an error-like object with the given name and message
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::value(serde_json::json!({
            "name": name.into(),
            "message": message.into(),
        }))
    }

    /// Build a thrown value from a caught panic payload
    #[must_use]
    pub fn panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned());

        Self {
            repr: Repr::Panic(message),
            name: None,
            code: None,
        }
    }

    /// Override the error name reported by the normalizer
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attach an error code reported by the normalizer
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Downcast the wrapped `std::error::Error`, if any
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        match &self.repr {
            Repr::Error { source, .. } => source.downcast_ref::<E>(),
            Repr::Value(_) | Repr::Panic(_) => None,
        }
    }

    /// The thrown data, if this was thrown with [`Thrown::value`]
    #[must_use]
    pub const fn as_value(&self) -> Option<&Value> {
        match &self.repr {
            Repr::Value(value) => Some(value),
            Repr::Error { .. } | Repr::Panic(_) => None,
        }
    }

    /// `true` if this value came from a panic in the work task
    #[must_use]
    pub const fn is_panic(&self) -> bool {
        matches!(self.repr, Repr::Panic(_))
    }
}

impl<E> From<E> for Thrown
where
    E: StdError + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::error(error)
    }
}

impl fmt::Debug for Thrown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Thrown");
        match &self.repr {
            Repr::Error { source, .. } => debug.field("error", source),
            Repr::Value(value) => debug.field("value", value),
            Repr::Panic(message) => debug.field("panic", message),
        };
        debug
            .field("name", &self.name)
            .field("code", &self.code)
            .finish()
    }
}

impl fmt::Display for Thrown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        mini_serialize_error(self).fmt(f)
    }
}

/// Projects thrown values onto [`NormalizedError`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorNormalizer {
    strip_stack: bool,
}

impl ErrorNormalizer {
    /// Normalizer that keeps stack traces
    #[must_use]
    pub const fn new() -> Self {
        Self { strip_stack: false }
    }

    /// Enable or disable the strip-stack-traces policy
    #[must_use]
    pub const fn with_strip_stack(mut self, strip: bool) -> Self {
        self.strip_stack = strip;
        self
    }

    /// Whether stack traces are omitted
    #[must_use]
    pub const fn strips_stack(&self) -> bool {
        self.strip_stack
    }

    /// Normalize a thrown value. Never fails.
    #[must_use]
    pub fn normalize(&self, thrown: &Thrown) -> NormalizedError {
        let mut normalized = match &thrown.repr {
            Repr::Error { source, backtrace } => {
                let name = thrown
                    .name
                    .clone()
                    .unwrap_or_else(|| DEFAULT_ERROR_NAME.to_owned());
                let message = source.to_string();
                let stack = render_stack(&name, &message, source.as_ref(), backtrace);
                NormalizedError {
                    name: Some(name),
                    message: Some(message),
                    stack: Some(stack),
                    code: thrown.code.clone(),
                }
            },
            Repr::Value(value) => {
                let mut normalized = project_value(value);
                if thrown.name.is_some() {
                    normalized.name.clone_from(&thrown.name);
                }
                if thrown.code.is_some() {
                    normalized.code.clone_from(&thrown.code);
                }
                normalized
            },
            Repr::Panic(message) => NormalizedError {
                name: Some(
                    thrown
                        .name
                        .clone()
                        .unwrap_or_else(|| PANIC_ERROR_NAME.to_owned()),
                ),
                message: message.clone(),
                stack: None,
                code: thrown.code.clone(),
            },
        };

        if self.strip_stack {
            normalized.stack = None;
        }
        normalized
    }
}

/// Normalize with the default policy (stack traces kept)
#[must_use]
pub fn mini_serialize_error(thrown: &Thrown) -> NormalizedError {
    ErrorNormalizer::new().normalize(thrown)
}

/// Copy the allow-listed keys of a JSON object
fn project_value(value: &Value) -> NormalizedError {
    let Value::Object(object) = value else {
        return NormalizedError::default();
    };

    let mut fields = ALLOWED_KEYS
        .iter()
        .map(|key| object.get(*key).and_then(coerce_to_string));

    NormalizedError {
        name: fields.next().flatten(),
        message: fields.next().flatten(),
        stack: fields.next().flatten(),
        code: fields.next().flatten(),
    }
}

/// Scalars become strings; null and structured values are skipped
fn coerce_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn render_stack(
    name: &str,
    message: &str,
    error: &(dyn StdError + 'static),
    backtrace: &Backtrace,
) -> String {
    let mut stack = format!("{name}: {message}");
    let mut cause = error.source();
    while let Some(err) = cause {
        let _ = write!(stack, "\n    caused by: {err}");
        cause = err.source();
    }
    if backtrace.status() == BacktraceStatus::Captured {
        let _ = write!(stack, "\n{backtrace}");
    }
    stack
}

/// Error returned by `unwrap()` on an operation handle
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UnwrapError<R> {
    /// The work function returned `reject_with(value)`; the value is carried verbatim
    #[error("operation rejected with a value")]
    Rejected(R),

    /// The work function failed, was aborted, or was vetoed by its condition
    #[error("operation failed: {0}")]
    Failed(SerializedError),
}

impl<R> UnwrapError<R> {
    /// The rejection value, if this is a deliberate rejection
    #[must_use]
    pub const fn rejected_value(&self) -> Option<&R> {
        match self {
            Self::Rejected(value) => Some(value),
            Self::Failed(_) => None,
        }
    }

    /// The error payload, if this is a failure
    #[must_use]
    pub const fn error(&self) -> Option<&SerializedError> {
        match self {
            Self::Rejected(_) => None,
            Self::Failed(error) => Some(error),
        }
    }

    /// `true` when the failure is the fixed abort error
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.error().and_then(SerializedError::name) == Some(ABORT_ERROR_NAME)
    }

    /// `true` when the failure is the fixed condition error
    #[must_use]
    pub fn is_condition_failed(&self) -> bool {
        self.error().and_then(SerializedError::name) == Some(CONDITION_ERROR_NAME)
    }
}
