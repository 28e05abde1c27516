//! Configuration module for booking-service.

use secrecy::{ExposeSecret, Secret};
use service_core::config as core_config;
use service_core::error::AppError;
use service_core::utils::signature::SignType;
use std::env;
use std::time::Duration;

/// Upper bound on any single gateway round trip.
pub const MAX_GATEWAY_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone)]
pub struct BookingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub wechat: WechatPayConfig,
    pub payment: PaymentConfig,
    pub internal: InternalConfig,
    pub coupons: CouponConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct WechatPayConfig {
    pub app_id: String,
    pub mch_id: String,
    pub api_key: Secret<String>,
    pub notify_url: String,
    pub api_base_url: String,
    pub sign_type: SignType,
    /// PEM client certificate and key, required by the refund endpoint.
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

impl WechatPayConfig {
    pub fn is_configured(&self) -> bool {
        !self.app_id.is_empty()
            && !self.mch_id.is_empty()
            && !self.api_key.expose_secret().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PaymentConfig {
    /// Bypass the gateway entirely. Rejected in production.
    pub simulate: bool,
    pub gateway_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct InternalConfig {
    /// Shared token for operator routes. Empty disables those routes.
    pub api_token: Secret<String>,
}

#[derive(Debug, Clone)]
pub struct CouponConfig {
    pub expiry_sweep_interval: Duration,
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

impl BookingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let sign_type = match env::var("WECHAT_SIGN_TYPE") {
            Ok(value) => value.parse().map_err(AppError::ConfigError)?,
            Err(_) => SignType::Md5,
        };

        let gateway_timeout_secs = env::var("PAYMENT_GATEWAY_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(MAX_GATEWAY_TIMEOUT_SECS);

        let config = Self {
            common,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "booking-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: Secret::new(env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            wechat: WechatPayConfig {
                app_id: env::var("WECHAT_APP_ID").unwrap_or_default(),
                mch_id: env::var("WECHAT_MCH_ID").unwrap_or_default(),
                api_key: Secret::new(env::var("WECHAT_API_KEY").unwrap_or_default()),
                notify_url: env::var("WECHAT_NOTIFY_URL").unwrap_or_default(),
                api_base_url: env::var("WECHAT_API_BASE_URL")
                    .unwrap_or_else(|_| "https://api.mch.weixin.qq.com".to_string()),
                sign_type,
                cert_path: env::var("WECHAT_CERT_PATH").ok(),
                key_path: env::var("WECHAT_KEY_PATH").ok(),
            },
            payment: PaymentConfig {
                simulate: env_flag("PAYMENT_SIMULATE"),
                gateway_timeout: Duration::from_secs(gateway_timeout_secs),
            },
            internal: InternalConfig {
                api_token: Secret::new(env::var("INTERNAL_API_TOKEN").unwrap_or_default()),
            },
            coupons: CouponConfig {
                expiry_sweep_interval: Duration::from_secs(
                    env::var("COUPON_EXPIRY_SWEEP_SECS")
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(300),
                ),
            },
        };

        config.validated()
    }

    /// Enforces cross-field rules. Applied by `from_env` and by `Application::build`.
    pub fn validated(mut self) -> Result<Self, AppError> {
        if self.payment.simulate && self.common.is_production() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PAYMENT_SIMULATE cannot be enabled in a production environment"
            )));
        }

        let max = Duration::from_secs(MAX_GATEWAY_TIMEOUT_SECS);
        if self.payment.gateway_timeout.is_zero() || self.payment.gateway_timeout > max {
            self.payment.gateway_timeout = max;
        }

        if self.coupons.expiry_sweep_interval.is_zero() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "COUPON_EXPIRY_SWEEP_SECS must be greater than zero"
            )));
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::config::{Config as CommonConfig, Environment};

    fn config(environment: Environment, simulate: bool, timeout_secs: u64) -> BookingConfig {
        BookingConfig {
            common: CommonConfig {
                port: 0,
                environment,
            },
            service_name: "booking-service".to_string(),
            log_level: "info".to_string(),
            otlp_endpoint: None,
            database: DatabaseConfig {
                url: Secret::new("postgres://localhost/booking".to_string()),
                max_connections: 1,
                min_connections: 1,
            },
            wechat: WechatPayConfig {
                app_id: String::new(),
                mch_id: String::new(),
                api_key: Secret::new(String::new()),
                notify_url: String::new(),
                api_base_url: "https://api.mch.weixin.qq.com".to_string(),
                sign_type: SignType::Md5,
                cert_path: None,
                key_path: None,
            },
            payment: PaymentConfig {
                simulate,
                gateway_timeout: Duration::from_secs(timeout_secs),
            },
            internal: InternalConfig {
                api_token: Secret::new(String::new()),
            },
            coupons: CouponConfig {
                expiry_sweep_interval: Duration::from_secs(300),
            },
        }
    }

    #[test]
    fn simulate_is_rejected_in_production() {
        let result = config(Environment::Production, true, 15).validated();
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[test]
    fn simulate_is_allowed_in_development() {
        assert!(config(Environment::Development, true, 15).validated().is_ok());
    }

    #[test]
    fn gateway_timeout_is_clamped() {
        let cfg = config(Environment::Development, false, 120).validated().unwrap();
        assert_eq!(cfg.payment.gateway_timeout, Duration::from_secs(15));

        let cfg = config(Environment::Development, false, 5).validated().unwrap();
        assert_eq!(cfg.payment.gateway_timeout, Duration::from_secs(5));
    }

    #[test]
    fn unconfigured_gateway_is_detected() {
        let cfg = config(Environment::Development, false, 15);
        assert!(!cfg.wechat.is_configured());
    }
}
