//! Caller-supplied mutation points.
//!
//! Both hooks are plain function values fixed when the forwarder is built.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};
use hyper::body::Incoming;

use crate::proxy::error::BoxError;

/// Rewrites the outbound request before it is written to the backend.
///
/// Runs after the target has been rewritten to the synthetic authority and
/// has no way to fail the request.
pub type Director = Arc<dyn Fn(&mut Request<Body>) + Send + Sync>;

/// Inspects or rewrites the backend response before it reaches the client.
///
/// An error aborts the request with 502 Bad Gateway.
pub type ModifyResponse = Arc<dyn Fn(&mut Response<Incoming>) -> Result<(), BoxError> + Send + Sync>;
