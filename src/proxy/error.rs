//! Proxy error taxonomy.
//!
//! Every failure maps to an [`ErrorKind`]. Before the response status is
//! committed, an error becomes an HTTP error page; afterwards it can only be
//! logged while the connection is torn down.

use std::io;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Boxed error produced by caller-supplied hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Coarse classification used for status mapping and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The environment violates an invariant the proxy depends on.
    Configuration,
    /// The backend could not be reached.
    Dial,
    /// The backend exchange failed before a usable response head arrived.
    Protocol,
    /// The response hook rejected the backend response.
    Hook,
    /// Relaying bytes failed after the response was committed.
    Stream,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0}")]
    Configuration(String),

    #[error("failed to dial backend {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to establish HTTP session with backend: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("failed to write request to backend: {0}")]
    Write(#[source] hyper::Error),

    #[error("malformed backend response: {0}")]
    MalformedResponse(#[source] hyper::Error),

    #[error("response hook failed: {0}")]
    Hook(#[source] BoxError),

    #[error("connection takeover failed: {0}")]
    Upgrade(#[source] hyper::Error),

    #[error("stream relay failed: {0}")]
    Stream(#[from] io::Error),
}

impl ProxyError {
    /// Classify a failure of the backend request/response exchange.
    pub fn from_exchange(err: hyper::Error) -> Self {
        if err.is_parse() || err.is_incomplete_message() || err.is_parse_status() {
            ProxyError::MalformedResponse(err)
        } else {
            ProxyError::Write(err)
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::Configuration(_) => ErrorKind::Configuration,
            ProxyError::Dial { .. } => ErrorKind::Dial,
            ProxyError::Handshake(_) | ProxyError::Write(_) | ProxyError::MalformedResponse(_) => {
                ErrorKind::Protocol
            }
            ProxyError::Hook(_) => ErrorKind::Hook,
            ProxyError::Upgrade(_) | ProxyError::Stream(_) => ErrorKind::Stream,
        }
    }

    /// Status reported to the client when the error happens before commit.
    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Dial | ErrorKind::Protocol | ErrorKind::Hook => StatusCode::BAD_GATEWAY,
            ErrorKind::Configuration | ErrorKind::Stream => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (
            status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            format!("{self}\n"),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_errors_are_bad_gateway() {
        let err = ProxyError::Dial {
            address: "/run/backend.sock".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        };
        assert_eq!(err.kind(), ErrorKind::Dial);
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            err.to_string(),
            "failed to dial backend /run/backend.sock: no such file"
        );
    }

    #[test]
    fn hook_errors_are_bad_gateway() {
        let err = ProxyError::Hook("rejected".into());
        assert_eq!(err.kind(), ErrorKind::Hook);
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn configuration_errors_are_internal() {
        let err = ProxyError::Configuration("backend connection does not support half-close".into());
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn error_page_carries_message() {
        let response = ProxyError::Hook("bad header".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"response hook failed: bad header\n");
    }
}
