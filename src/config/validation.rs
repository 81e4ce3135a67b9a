//! Configuration validation.
//!
//! Returns every problem found, not just the first.

use std::net::SocketAddr;

use crate::config::schema::SidecarConfig;

/// A single semantic problem with a config value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn check_url(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    match url::Url::parse(value) {
        Ok(u) if u.scheme() == "http" || u.scheme() == "https" => {}
        Ok(u) => errors.push(ValidationError::new(
            field,
            format!("unsupported scheme '{}'", u.scheme()),
        )),
        Err(e) => errors.push(ValidationError::new(field, format!("invalid URL: {}", e))),
    }
}

fn check_socket_addr(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            field,
            format!("'{}' is not a socket address", value),
        ));
    }
}

pub fn validate_config(config: &SidecarConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.service_id.trim().is_empty() {
        errors.push(ValidationError::new("service_id", "must be set"));
    }

    check_url(&mut errors, "consul.address", &config.consul.address);
    check_url(&mut errors, "dataplane.address", &config.dataplane.address);

    if config.dataplane.request_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "dataplane.request_timeout_secs",
            "must be greater than 0",
        ));
    }

    if config.haproxy.log_socket.is_empty() {
        errors.push(ValidationError::new("haproxy.log_socket", "must be set"));
    }
    if config.haproxy.enable_intentions && config.haproxy.spoe_config.is_empty() {
        errors.push(ValidationError::new(
            "haproxy.spoe_config",
            "required when enable_intentions is set",
        ));
    }

    if config.observability.metrics_enabled {
        check_socket_addr(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }
    if config.admin.enabled {
        check_socket_addr(&mut errors, "admin.bind_address", &config.admin.bind_address);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> SidecarConfig {
        SidecarConfig {
            service_id: "web-1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_with_service_are_valid() {
        assert!(validate_config(&valid()).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = SidecarConfig::default();
        config.consul.address = "not a url".to_string();
        config.dataplane.request_timeout_secs = 0;
        config.haproxy.enable_intentions = true;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "service_id",
                "consul.address",
                "dataplane.request_timeout_secs",
                "haproxy.spoe_config",
            ]
        );
    }

    #[test]
    fn test_addresses_checked_only_when_enabled() {
        let mut config = valid();
        config.admin.bind_address = "nowhere".to_string();
        assert!(validate_config(&config).is_ok());

        config.admin.enabled = true;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "admin.bind_address");
    }
}
