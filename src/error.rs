use thiserror::Error;

use crate::types::DeviceId;

#[derive(Debug, Error)]
pub enum Error {
    /// Credential exchange rejected. Never retried automatically.
    #[error("authentication failed: {message}")]
    Auth { message: String },

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Normalization(#[from] NormalizationError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("client closed")]
    Closed,
}

impl Error {
    /// True when the server rejected the session token.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Error::Api(ApiError::Unauthorized))
    }

    /// True for failures the coordinator should absorb with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Api(ApiError::Status { status, .. }) => *status >= 500 || *status == 429,
            Error::Api(ApiError::Transport(_) | ApiError::Timeout) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    /// The session token was refused (HTTP 401).
    #[error("session token rejected")]
    Unauthorized,

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(reqwest::Error),

    #[error("request timed out")]
    Timeout,

    #[error("unexpected response: {message}")]
    Decode { message: String },
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else if e.is_decode() {
            ApiError::Decode {
                message: e.to_string(),
            }
        } else {
            ApiError::Transport(e)
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Api(e.into())
    }
}

/// A raw state payload that could not be mapped onto `DeviceState`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizationError {
    #[error("missing field {field}")]
    MissingField { field: &'static str },

    #[error("unrecognized value for {field}: {raw}")]
    Unrecognized { field: &'static str, raw: String },

    #[error("state payload is not an object")]
    NotAnObject,
}

/// A command rejected before anything was sent.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("fan speed {0} outside 1..=7")]
    FanSpeed(i64),

    #[error("unknown mode: {0}")]
    Mode(String),

    #[error("target temperature {0} outside 10..=30 C")]
    Temperature(f64),

    #[error("humidifier level {0} outside 0..=100 percent")]
    HumidifierLevel(f64),

    #[error("invalid value for {attribute}: {value}")]
    Value { attribute: String, value: String },

    #[error("unknown attribute: {0}")]
    Attribute(String),

    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("device {0} has no humidifier")]
    NoHumidifier(DeviceId),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outages_are_transient_but_rejections_are_not() {
        let busy: Error = ApiError::Status {
            status: 503,
            body: String::new(),
        }
        .into();
        assert!(busy.is_transient());
        assert!(Error::from(ApiError::Timeout).is_transient());

        let bad_request: Error = ApiError::Status {
            status: 400,
            body: String::new(),
        }
        .into();
        assert!(!bad_request.is_transient());
        assert!(
            !Error::Auth {
                message: "HTTP 403".to_string()
            }
            .is_transient()
        );
    }
}
