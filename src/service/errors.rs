//! Request errors returned to clients.

use std::fmt;

use serde::Serialize;

use crate::security::KeyError;

/// Failure of a client request, carrying an HTTP-style status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    BadRequest,
    Unauthorized,
    PaymentRequired,
    Forbidden,
    NotFound,
    ServerError,
    NotImplemented,
    TargetInvalid,
    TargetTooLong,
}

impl Error {
    pub fn status(&self) -> u16 {
        match self {
            Error::BadRequest | Error::TargetInvalid | Error::TargetTooLong => 400,
            Error::Unauthorized => 401,
            Error::PaymentRequired => 402,
            Error::Forbidden => 403,
            Error::NotFound => 404,
            Error::ServerError => 500,
            Error::NotImplemented => 501,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Error::BadRequest => "the request was invalid or cannot be otherwise served",
            Error::Unauthorized => "the security key provided is not authorized to perform this operation",
            Error::PaymentRequired => "the contract is not active or has been refused",
            Error::Forbidden => "the request is understood but has been refused",
            Error::NotFound => "the resource requested could not be found",
            Error::ServerError => "an unexpected condition was encountered",
            Error::NotImplemented => "the server does not recognize the request",
            Error::TargetInvalid => "channel should end with '/' for strict types or '/#/' for wildcards",
            Error::TargetTooLong => "channel can not have more than 23 parts",
        }
    }

    /// JSON error reply echoing the request id.
    pub fn to_reply(&self, req: u16) -> Vec<u8> {
        serde_json::to_vec(&ErrorReply {
            req,
            status: self.status(),
            message: self.message(),
        })
        .unwrap_or_default()
    }
}

#[derive(Serialize)]
struct ErrorReply {
    req: u16,
    status: u16,
    message: &'static str,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.status())
    }
}

impl std::error::Error for Error {}

impl From<KeyError> for Error {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::TargetInvalid => Error::TargetInvalid,
            KeyError::TargetTooLong => Error::TargetTooLong,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_shape() {
        let reply: serde_json::Value = serde_json::from_slice(&Error::Forbidden.to_reply(7)).unwrap();
        assert_eq!(reply["req"], 7);
        assert_eq!(reply["status"], 403);
        assert!(reply["message"].as_str().unwrap().contains("refused"));
    }

    #[test]
    fn test_key_errors() {
        assert_eq!(Error::from(KeyError::TargetTooLong).status(), 400);
        assert_eq!(Error::from(KeyError::TargetTooLong), Error::TargetTooLong);
        assert_eq!(Error::from(KeyError::TargetInvalid), Error::TargetInvalid);
    }
}
