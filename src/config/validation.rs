//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (waterline, ceiling, timeouts, watermarks)
//! - Check that origin names are present and unique
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system, including on reload

use std::collections::HashSet;
use std::net::SocketAddr;
use crate::config::schema::{PoolConfig, ProxyConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("origin name must not be empty")]
    EmptyOriginName,
    #[error("duplicate origin '{0}'")]
    DuplicateOrigin(String),
    #[error("origin '{origin}': invalid server address '{address}'")]
    InvalidServerAddress { origin: String, address: String },
    #[error("origin '{origin}': {field} must be greater than zero")]
    NotPositive { origin: String, field: &'static str },
    #[error("origin '{origin}': write buffer low water mark exceeds high water mark")]
    WatermarkOrder { origin: String },
}

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for origin in &config.origins {
        if origin.name.is_empty() {
            errors.push(ValidationError::EmptyOriginName);
        } else if !seen.insert(origin.name.as_str()) {
            errors.push(ValidationError::DuplicateOrigin(origin.name.clone()));
        }

        for address in &origin.servers {
            if address.parse::<SocketAddr>().is_err() {
                errors.push(ValidationError::InvalidServerAddress {
                    origin: origin.name.clone(),
                    address: address.clone(),
                });
            }
        }

        validate_pool(&origin.name, &origin.pool, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_pool(origin: &str, pool: &PoolConfig, errors: &mut Vec<ValidationError>) {
    let positive = [
        ("per_server_waterline", pool.per_server_waterline as u64),
        ("max_connections_per_host", pool.max_connections_per_host as u64),
        ("max_requests_per_connection", pool.max_requests_per_connection),
        ("connect_timeout_ms", pool.connect_timeout_ms),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::NotPositive {
                origin: origin.to_string(),
                field,
            });
        }
    }

    if pool.write_buffer_low_water_mark > pool.write_buffer_high_water_mark {
        errors.push(ValidationError::WatermarkOrder {
            origin: origin.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::OriginConfig;

    fn origin(name: &str) -> OriginConfig {
        OriginConfig {
            name: name.to_string(),
            servers: vec!["127.0.0.1:3000".to_string()],
            load_balancing: Default::default(),
            pool: PoolConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let mut config = ProxyConfig::default();
        config.origins.push(origin("api"));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_duplicate_and_watermarks() {
        let mut config = ProxyConfig::default();
        config.origins.push(origin("api"));
        let mut dup = origin("api");
        dup.pool.write_buffer_low_water_mark = dup.pool.write_buffer_high_water_mark + 1;
        config.origins.push(dup);

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::DuplicateOrigin("api".into())));
        assert!(errors.contains(&ValidationError::WatermarkOrder { origin: "api".into() }));
    }
}
