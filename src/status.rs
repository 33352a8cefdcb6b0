//! # Status and Error Reporting
//!
//! Every failure in the bus API is reported as a [`Status`]: an error
//! class identifying the offending subsystem, a code from a closed
//! enumeration, an optional middleware-native custom code for support
//! diagnostics, and free text. The crate-wide [`Result`] alias carries a
//! `Status` as its error type.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Subsystem classification for an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusClass {
    NoError,
    ConnectionError,
    ConfigError,
    MiddlewareError,
    MsgError,
    FieldError,
    PolicyError,
    MistError,
    OtherError,
}

impl StatusClass {
    /// Stable numeric value used in the rendered form.
    pub fn value(&self) -> u8 {
        match self {
            StatusClass::NoError => 0,
            StatusClass::ConnectionError => 1,
            StatusClass::ConfigError => 2,
            StatusClass::MiddlewareError => 3,
            StatusClass::MsgError => 4,
            StatusClass::FieldError => 5,
            StatusClass::PolicyError => 6,
            StatusClass::MistError => 7,
            StatusClass::OtherError => 99,
        }
    }
}

/// Closed enumeration of error codes.
///
/// `CustomErrorCode` carries a middleware-specific condition; the native
/// error number rides in [`Status::custom_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    NoErrorCode,
    InvalidConnection,
    ConnectionConnected,
    ConnectionLost,
    ConnectionReconnect,
    InvalidSubjectName,
    InvalidMsg,
    InvalidCallback,
    InvalidField,
    InvalidFieldName,
    InvalidFieldValue,
    InvalidTypeConversion,
    ValueOutOfRange,
    UnknownFieldType,
    UnknownMsgType,
    BadMsgFormat,
    FieldTemplateNotFound,
    FeatureNotSupported,
    AutodispatchExclusive,
    TimeoutOccurred,
    RequestDispatchFailure,
    SubscribeNotAuthorized,
    PublishNotAuthorized,
    UserAccessInvalid,
    CustomErrorCode,
    OtherErrorCode,
}

impl StatusCode {
    pub fn value(&self) -> u16 {
        match self {
            StatusCode::NoErrorCode => 0,
            StatusCode::InvalidConnection => 1,
            StatusCode::ConnectionConnected => 2,
            StatusCode::ConnectionLost => 3,
            StatusCode::ConnectionReconnect => 4,
            StatusCode::InvalidSubjectName => 5,
            StatusCode::InvalidMsg => 6,
            StatusCode::InvalidCallback => 7,
            StatusCode::InvalidField => 8,
            StatusCode::InvalidFieldName => 9,
            StatusCode::InvalidFieldValue => 10,
            StatusCode::InvalidTypeConversion => 11,
            StatusCode::ValueOutOfRange => 12,
            StatusCode::UnknownFieldType => 13,
            StatusCode::UnknownMsgType => 14,
            StatusCode::BadMsgFormat => 15,
            StatusCode::FieldTemplateNotFound => 16,
            StatusCode::FeatureNotSupported => 17,
            StatusCode::AutodispatchExclusive => 18,
            StatusCode::TimeoutOccurred => 19,
            StatusCode::RequestDispatchFailure => 20,
            StatusCode::SubscribeNotAuthorized => 21,
            StatusCode::PublishNotAuthorized => 22,
            StatusCode::UserAccessInvalid => 23,
            StatusCode::CustomErrorCode => 49,
            StatusCode::OtherErrorCode => 50,
        }
    }
}

impl fmt::Display for StatusClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// A structured error: `(class, code, custom code, text)`.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("[{class},{code},{custom_code}] : {text}")]
pub struct Status {
    class: StatusClass,
    code: StatusCode,
    custom_code: i32,
    text: String,
}

impl Status {
    pub fn new(class: StatusClass, code: StatusCode, text: impl Into<String>) -> Self {
        Self {
            class,
            code,
            custom_code: 0,
            text: text.into(),
        }
    }

    /// Attach the middleware's native error number.
    pub fn with_custom_code(mut self, custom_code: i32) -> Self {
        self.custom_code = custom_code;
        self
    }

    pub fn class(&self) -> StatusClass {
        self.class
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn custom_code(&self) -> i32 {
        self.custom_code
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn has_error(&self) -> bool {
        self.class != StatusClass::NoError
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::new(StatusClass::NoError, StatusCode::NoErrorCode, "")
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Status>;

// Shorthand constructors for the handful of statuses minted all over the
// runtime.
impl Status {
    pub(crate) fn not_connected() -> Self {
        Status::new(
            StatusClass::ConnectionError,
            StatusCode::InvalidConnection,
            "Connection has not been initialized",
        )
    }

    pub(crate) fn timeout(text: impl Into<String>) -> Self {
        Status::new(StatusClass::ConnectionError, StatusCode::TimeoutOccurred, text)
    }

    pub(crate) fn invalid_msg(text: impl Into<String>) -> Self {
        Status::new(StatusClass::ConnectionError, StatusCode::InvalidMsg, text)
    }

    pub(crate) fn field_error(code: StatusCode, text: impl Into<String>) -> Self {
        Status::new(StatusClass::FieldError, code, text)
    }

    pub(crate) fn msg_error(code: StatusCode, text: impl Into<String>) -> Self {
        Status::new(StatusClass::MsgError, code, text)
    }

    pub(crate) fn middleware(text: impl Into<String>) -> Self {
        Status::new(StatusClass::MiddlewareError, StatusCode::CustomErrorCode, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_renders_class_code_custom_and_text() {
        let status = Status::new(
            StatusClass::ConnectionError,
            StatusCode::TimeoutOccurred,
            "Request timed out",
        )
        .with_custom_code(2033);

        assert_eq!(status.to_string(), "[1,19,2033] : Request timed out");
        assert!(status.has_error());
        assert_eq!(status.custom_code(), 2033);
    }

    #[test]
    fn default_status_is_no_error() {
        let status = Status::default();
        assert!(!status.has_error());
        assert_eq!(status.class(), StatusClass::NoError);
        assert_eq!(status.code(), StatusCode::NoErrorCode);
    }
}
