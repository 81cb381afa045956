//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, capacities > 0)
//! - Check that every address parses
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RelayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::RelayConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field}: invalid address '{value}'")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field}: path must not be empty")]
    EmptyPath { field: &'static str },

    #[error("unknown log level '{0}'")]
    LogLevel(String),
}

/// Check every semantic rule and collect the failures.
pub fn validate_config(config: &RelayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_socket_addr(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::Zero { field: "listener.max_connections" });
    }
    if let Some(tls) = &config.listener.tls {
        if tls.cert_path.trim().is_empty() {
            errors.push(ValidationError::EmptyPath { field: "listener.tls.cert_path" });
        }
        if tls.key_path.trim().is_empty() {
            errors.push(ValidationError::EmptyPath { field: "listener.tls.key_path" });
        }
    }
    if let Some(ca) = &config.peers.ca_path {
        if ca.trim().is_empty() {
            errors.push(ValidationError::EmptyPath { field: "peers.ca_path" });
        }
    }

    if config.peers.connect_timeout_secs == 0 {
        errors.push(ValidationError::Zero { field: "peers.connect_timeout_secs" });
    }
    if config.timeouts.idle_secs == 0 {
        errors.push(ValidationError::Zero { field: "timeouts.idle_secs" });
    }
    if config.timeouts.worker_connect_secs == 0 {
        errors.push(ValidationError::Zero { field: "timeouts.worker_connect_secs" });
    }
    if config.limits.max_frame_bytes == 0 {
        errors.push(ValidationError::Zero { field: "limits.max_frame_bytes" });
    }
    if config.cache.capacity == 0 {
        errors.push(ValidationError::Zero { field: "cache.capacity" });
    }

    for worker in &config.workers {
        check_host_port(&mut errors, "workers.address", &worker.address);
    }

    if config.http.enabled {
        check_socket_addr(&mut errors, "http.bind_address", &config.http.bind_address);
    }
    if config.observability.metrics_enabled {
        check_socket_addr(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    let level = config.observability.log_level.to_ascii_lowercase();
    if !matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
        errors.push(ValidationError::LogLevel(config.observability.log_level.clone()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_socket_addr(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}

// Worker addresses may be hostnames; only the host:port shape is checked here.
fn check_host_port(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    let well_formed = match value.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    };
    if !well_formed {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::WorkerConfig;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&RelayConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = RelayConfig::default();
        config.listener.bind_address = "not-an-address".into();
        config.timeouts.idle_secs = 0;
        config.cache.capacity = 0;
        config.workers.push(WorkerConfig { address: "missing-port".into() });
        config.observability.log_level = "loud".into();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 5);
        assert!(errors.contains(&ValidationError::Zero { field: "timeouts.idle_secs" }));
        assert!(errors.contains(&ValidationError::LogLevel("loud".into())));
    }

    #[test]
    fn hostname_workers_are_accepted() {
        let mut config = RelayConfig::default();
        config.workers.push(WorkerConfig { address: "worker.internal:6000".into() });
        assert!(validate_config(&config).is_ok());
    }
}
