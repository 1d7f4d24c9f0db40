//! Pipeline configuration.

use crate::batch_processor::BatchConfig;
use crate::client::{RetryConfig, DEFAULT_REQUEST_TIMEOUT};
use crate::dsn::{Dsn, DsnError};
use crate::metric_reader::ReaderConfig;
use crate::span::{KeyValue, Resource};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Environment variable that supplies the DSN when none is set explicitly.
pub const DSN_ENV: &str = "UPTRACE_DSN";
/// Environment variable that disables the pipeline when present, whatever its value.
pub const DISABLED_ENV: &str = "UPTRACE_DISABLED";
/// Standard OpenTelemetry service name variable.
pub const SERVICE_NAME_ENV: &str = "OTEL_SERVICE_NAME";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("DSN is required (set it explicitly or via UPTRACE_DSN)")]
    MissingDsn,

    #[error(transparent)]
    InvalidDsn(#[from] DsnError),

    #[error("failed to create HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Configuration for the export pipeline.
#[derive(Clone)]
pub struct Config {
    /// Connection string. Falls back to `UPTRACE_DSN` when unset.
    pub dsn: Option<String>,
    /// Install the no-op pipeline.
    pub disabled: bool,
    pub service_name: Option<String>,
    pub service_version: Option<String>,
    pub deployment_environment: Option<String>,
    /// Extra resource attributes, appended after the service attributes.
    pub resource_attributes: Vec<KeyValue>,
    /// Span batching
    pub batch: BatchConfig,
    /// Metric collection
    pub metrics: ReaderConfig,
    /// Delivery retries
    pub retry: RetryConfig,
    /// Per-request HTTP timeout
    pub request_timeout: Duration,
    /// Gate capacity shared by span and metric exports.
    /// `None` sizes it to the available parallelism.
    pub max_concurrent_exports: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dsn: None,
            disabled: false,
            service_name: None,
            service_version: None,
            deployment_environment: None,
            resource_attributes: Vec::new(),
            batch: BatchConfig::default(),
            metrics: ReaderConfig::default(),
            retry: RetryConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_concurrent_exports: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("dsn", &self.dsn.as_ref().map(|_| "<redacted>"))
            .field("disabled", &self.disabled)
            .field("service_name", &self.service_name)
            .field("service_version", &self.service_version)
            .field("deployment_environment", &self.deployment_environment)
            .field("batch", &self.batch)
            .field("metrics", &self.metrics)
            .field("retry", &self.retry)
            .field("request_timeout", &self.request_timeout)
            .field("max_concurrent_exports", &self.max_concurrent_exports)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Defaults overridden by `UPTRACE_DSN`, `UPTRACE_DISABLED` and `OTEL_SERVICE_NAME`.
    pub fn from_env() -> Self {
        Self::default().merge_env(|key| std::env::var(key).ok())
    }

    fn merge_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if self.dsn.is_none() {
            self.dsn = lookup(DSN_ENV).filter(|dsn| !dsn.trim().is_empty());
        }
        if lookup(DISABLED_ENV).is_some() {
            self.disabled = true;
        }
        if self.service_name.is_none() {
            self.service_name = lookup(SERVICE_NAME_ENV).filter(|name| !name.is_empty());
        }
        self
    }

    pub fn with_dsn(mut self, dsn: impl Into<String>) -> Self {
        self.dsn = Some(dsn.into());
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    pub fn with_service_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = Some(version.into());
        self
    }

    pub fn with_deployment_environment(mut self, env: impl Into<String>) -> Self {
        self.deployment_environment = Some(env.into());
        self
    }

    pub fn with_resource_attributes(mut self, attributes: impl IntoIterator<Item = KeyValue>) -> Self {
        self.resource_attributes.extend(attributes);
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_metrics(mut self, metrics: ReaderConfig) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_exports(mut self, n: usize) -> Self {
        self.max_concurrent_exports = Some(n);
        self
    }

    /// `true` when disabled explicitly or through `UPTRACE_DISABLED`.
    pub fn is_disabled(&self) -> bool {
        self.disabled || std::env::var_os(DISABLED_ENV).is_some()
    }

    /// Parses the explicit DSN, falling back to `UPTRACE_DSN`.
    pub fn resolve_dsn(&self) -> Result<Dsn, ConfigError> {
        self.resolve_dsn_with(|key| std::env::var(key).ok())
    }

    fn resolve_dsn_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<Dsn, ConfigError> {
        let dsn = match &self.dsn {
            Some(dsn) => dsn.clone(),
            None => lookup(DSN_ENV).ok_or(ConfigError::MissingDsn)?,
        };
        if dsn.trim().is_empty() {
            return Err(ConfigError::MissingDsn);
        }
        Ok(Dsn::parse(&dsn)?)
    }

    /// Resource describing this process.
    pub fn resource(&self) -> Resource {
        let mut attributes = vec![
            KeyValue::new("telemetry.sdk.language", "rust"),
            KeyValue::new("telemetry.sdk.name", env!("CARGO_PKG_NAME")),
            KeyValue::new("telemetry.sdk.version", env!("CARGO_PKG_VERSION")),
        ];
        if let Some(name) = &self.service_name {
            attributes.push(KeyValue::new("service.name", name.as_str()));
        }
        if let Some(version) = &self.service_version {
            attributes.push(KeyValue::new("service.version", version.as_str()));
        }
        if let Some(env) = &self.deployment_environment {
            attributes.push(KeyValue::new("deployment.environment", env.as_str()));
        }
        Resource::new(attributes).with_attributes(self.resource_attributes.iter().cloned())
    }
}
