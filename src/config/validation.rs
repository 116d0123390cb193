//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate addresses against their transport
//! - Validate value ranges (intervals, buffer sizes, timeouts > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use axum::http::uri::Authority;
use thiserror::Error;

use crate::config::schema::{ProxyConfig, Transport};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} is not a valid socket address: {value}")]
    InvalidSocketAddr { field: &'static str, value: String },

    #[error("forwarding.synthetic_host is not a valid authority: {0}")]
    InvalidHost(String),

    #[error("forwarding.synthetic_scheme must be \"http\", got {0:?}")]
    UnsupportedScheme(String),

    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },
}

/// Check a configuration, collecting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address(
        &mut errors,
        "listener.address",
        config.listener.transport,
        &config.listener.address,
    );
    check_address(
        &mut errors,
        "backend.address",
        config.backend.transport,
        &config.backend.address,
    );

    if config.listener.max_connections == 0 {
        errors.push(ValidationError::NotPositive {
            field: "listener.max_connections",
        });
    }

    let forwarding = &config.forwarding;
    if forwarding.synthetic_host.parse::<Authority>().is_err() {
        errors.push(ValidationError::InvalidHost(forwarding.synthetic_host.clone()));
    }
    if forwarding.synthetic_scheme != "http" {
        errors.push(ValidationError::UnsupportedScheme(
            forwarding.synthetic_scheme.clone(),
        ));
    }
    if forwarding.flush_interval_ms == 0 {
        errors.push(ValidationError::NotPositive {
            field: "forwarding.flush_interval_ms",
        });
    }
    if forwarding.write_buffer_bytes == 0 {
        errors.push(ValidationError::NotPositive {
            field: "forwarding.write_buffer_bytes",
        });
    }

    if config.timeouts.connect_secs == 0 {
        errors.push(ValidationError::NotPositive {
            field: "timeouts.connect_secs",
        });
    }

    let observability = &config.observability;
    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidSocketAddr {
            field: "observability.metrics_address",
            value: observability.metrics_address.clone(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(
    errors: &mut Vec<ValidationError>,
    field: &'static str,
    transport: Transport,
    address: &str,
) {
    if address.is_empty() {
        errors.push(ValidationError::Empty { field });
        return;
    }
    if transport == Transport::Tcp && address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidSocketAddr {
            field,
            value: address.to_string(),
        });
    }
}
