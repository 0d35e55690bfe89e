//! Process configuration from the environment (a `.env` file is loaded once
//! first, if present).

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use thiserror::Error;

use sizeflow_sizing::Gender;

use crate::dispatcher::{DispatchMode, DispatcherConfig};
use crate::engine::EngineConfig;
use crate::vendor::cloud_api::DEFAULT_API_BASE;
use crate::vendor::{CloudApiClient, CloudApiConfig, VendorError};

static DOTENV_LOADED: Lazy<()> = Lazy::new(|| {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
});

pub fn init_dotenv() {
    Lazy::force(&DOTENV_LOADED);
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Vendor(#[from] VendorError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database_url: String,
    pub http_addr: String,
    pub dry_run: bool,
    pub outbox_dir: PathBuf,
    pub api_base: String,
    pub token: Option<String>,
    pub phone_number_id: Option<String>,
    pub session_template: String,
    pub template_language: String,
    pub send_timeout: Duration,
    pub max_concurrent: usize,
    pub max_send_failures: u32,
    pub default_gender: Gender,
    pub default_product: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        init_dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| non_empty(&lookup, key);
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());
        let sizing = SizingDefaults::from_lookup(&lookup)?;

        let config = Self {
            database_url: or("DATABASE_URL", "sqlite://db/erp.db?mode=rwc"),
            http_addr: or("HTTP_ADDR", "0.0.0.0:8080"),
            dry_run: parse_bool("WA_DRY_RUN", get("WA_DRY_RUN"), true)?,
            outbox_dir: PathBuf::from(or("WA_OUTBOX_DIR", "outbox/api_calls")),
            api_base: or("WA_API_BASE", DEFAULT_API_BASE),
            token: get("WA_TOKEN"),
            phone_number_id: get("WA_PHONE_NUMBER_ID"),
            session_template: or("WA_SESSION_TEMPLATE", "size_check_reopen"),
            template_language: or("WA_TEMPLATE_LANG", "ru"),
            send_timeout: Duration::from_secs(parse("WA_SEND_TIMEOUT_SECS", get("WA_SEND_TIMEOUT_SECS"), 30u64)?),
            max_concurrent: parse("WORKFLOW_MAX_CONCURRENT", get("WORKFLOW_MAX_CONCURRENT"), 4usize)?,
            max_send_failures: parse(
                "WORKFLOW_MAX_SEND_FAILURES",
                get("WORKFLOW_MAX_SEND_FAILURES"),
                5u32,
            )?,
            default_gender: sizing.gender,
            default_product: sizing.product,
        };

        if config.send_timeout.is_zero() {
            return Err(invalid("WA_SEND_TIMEOUT_SECS", "0", "must be positive"));
        }
        if config.max_concurrent == 0 {
            return Err(invalid("WORKFLOW_MAX_CONCURRENT", "0", "must be positive"));
        }
        if config.max_send_failures == 0 {
            return Err(invalid("WORKFLOW_MAX_SEND_FAILURES", "0", "must be positive"));
        }
        if !config.dry_run {
            if config.token.is_none() {
                return Err(ConfigError::Missing("WA_TOKEN"));
            }
            if config.phone_number_id.is_none() {
                return Err(ConfigError::Missing("WA_PHONE_NUMBER_ID"));
            }
        }
        Ok(config)
    }

    /// Dry-run artifacts, or the live Cloud API client.
    pub fn dispatch_mode(&self) -> Result<DispatchMode, ConfigError> {
        if self.dry_run {
            return Ok(DispatchMode::dry_run(&self.outbox_dir));
        }
        let token = self.token.clone().ok_or(ConfigError::Missing("WA_TOKEN"))?;
        let phone_number_id = self
            .phone_number_id
            .clone()
            .ok_or(ConfigError::Missing("WA_PHONE_NUMBER_ID"))?;
        let client = CloudApiClient::new(
            CloudApiConfig::new(token, phone_number_id)
                .with_api_base(&self.api_base)
                .with_request_timeout(self.send_timeout),
        )?;
        Ok(DispatchMode::live(Arc::new(client)))
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_session_template(&self.session_template)
            .with_template_language(&self.template_language)
            .with_send_timeout(self.send_timeout)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_max_concurrent(self.max_concurrent)
            .with_max_send_failures(self.max_send_failures)
            .with_default_gender(self.default_gender)
            .with_default_product(&self.default_product)
    }
}

/// Chart selection for orders without a size profile. Needs no database or
/// vendor settings, so offline commands can load just this.
#[derive(Debug, Clone, PartialEq)]
pub struct SizingDefaults {
    pub gender: Gender,
    pub product: String,
}

impl SizingDefaults {
    pub fn from_env() -> Result<Self, ConfigError> {
        init_dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            gender: parse(
                "SIZING_DEFAULT_GENDER",
                non_empty(&lookup, "SIZING_DEFAULT_GENDER"),
                Gender::Men,
            )?,
            product: non_empty(&lookup, "SIZING_DEFAULT_PRODUCT").unwrap_or_else(|| "CL".to_string()),
        })
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(v) => v.parse().map_err(|e: T::Err| invalid(key, &v, e.to_string())),
    }
}

fn parse_bool(key: &'static str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(_) => Err(invalid(key, raw.as_deref().unwrap_or_default(), "expected true or false")),
    }
}
