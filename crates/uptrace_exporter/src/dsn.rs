//! Connection string (DSN) parsing and endpoint derivation.
//!
//! A DSN carries everything needed to reach a project in one URL:
//!
//! ```text
//! https://<token>@uptrace.dev/<project_id>
//! ```
//!
//! Parsing is pure: no I/O happens here, and every derived endpoint is a
//! string function of the parsed fields.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

/// Canonical host of the hosted (cloud) installation.
const CLOUD_HOST: &str = "uptrace.dev";
/// gRPC OTLP address of the hosted installation.
const CLOUD_OTLP_GRPC: &str = "otlp.uptrace.dev:4317";
/// HTTP OTLP address of the hosted installation.
const CLOUD_OTLP_HTTP: &str = "https://otlp.uptrace.dev";
/// UI address of the hosted installation.
const CLOUD_SITE: &str = "https://app.uptrace.dev";
/// Label that marks the API alias of a host (`api.uptrace.dev`).
const API_LABEL: &str = "api.";

/// Errors produced while parsing a DSN. Each variant names the missing part.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DsnError {
    /// The connection string is empty.
    #[error("DSN is empty (pass one explicitly or set UPTRACE_DSN)")]
    Empty,

    /// The connection string is not a URL.
    #[error("can't parse DSN={dsn:?}: {reason}")]
    Invalid { dsn: String, reason: String },

    #[error("DSN={0:?} does not have a scheme")]
    MissingScheme(String),

    #[error("DSN={dsn:?} has unsupported scheme {scheme:?} (expected http or https)")]
    UnsupportedScheme { dsn: String, scheme: String },

    #[error("DSN={0:?} does not have a host")]
    MissingHost(String),

    #[error("DSN={0:?} does not have a project id")]
    MissingProjectId(String),

    /// The path has more than one segment.
    #[error("DSN={dsn:?} has invalid project id {project_id:?} (expected a single path segment)")]
    InvalidProjectId { dsn: String, project_id: String },

    #[error("DSN={0:?} does not have a token")]
    MissingToken(String),
}

/// A parsed connection string.
///
/// All four components are guaranteed non-empty. The value is immutable once
/// constructed; `Debug` never prints the token.
#[derive(Clone, PartialEq, Eq)]
pub struct Dsn {
    original: String,
    scheme: String,
    host: String,
    project_id: String,
    token: String,
}

impl Dsn {
    /// Parses `scheme://token@host[:port]/project-id`.
    pub fn parse(dsn: &str) -> Result<Self, DsnError> {
        let dsn = dsn.trim();
        if dsn.is_empty() {
            return Err(DsnError::Empty);
        }

        let url = Url::parse(dsn).map_err(|err| match err {
            url::ParseError::RelativeUrlWithoutBase => DsnError::MissingScheme(dsn.to_string()),
            url::ParseError::EmptyHost => DsnError::MissingHost(dsn.to_string()),
            other => DsnError::Invalid {
                dsn: dsn.to_string(),
                reason: other.to_string(),
            },
        })?;

        let scheme = url.scheme();
        if scheme.is_empty() {
            return Err(DsnError::MissingScheme(dsn.to_string()));
        }
        if scheme != "http" && scheme != "https" {
            return Err(DsnError::UnsupportedScheme {
                dsn: dsn.to_string(),
                scheme: scheme.to_string(),
            });
        }

        let host = match url.host_str() {
            Some(host) if !host.is_empty() => canonical_host(host),
            _ => return Err(DsnError::MissingHost(dsn.to_string())),
        };
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };

        let project_id = url.path().trim_matches('/');
        if project_id.is_empty() {
            return Err(DsnError::MissingProjectId(dsn.to_string()));
        }
        if project_id.contains('/') {
            return Err(DsnError::InvalidProjectId {
                dsn: dsn.to_string(),
                project_id: project_id.to_string(),
            });
        }

        let token = url.username();
        if token.is_empty() {
            return Err(DsnError::MissingToken(dsn.to_string()));
        }

        Ok(Self {
            original: dsn.to_string(),
            scheme: scheme.to_string(),
            host,
            project_id: project_id.to_string(),
            token: token.to_string(),
        })
    }

    /// The connection string as it was supplied.
    pub fn original(&self) -> &str {
        &self.original
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Canonical host, including the port when one was given.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Returns `true` for the hosted installation.
    pub fn is_cloud(&self) -> bool {
        self.host == CLOUD_HOST
    }

    /// Address of the web UI.
    pub fn site_url(&self) -> String {
        if self.is_cloud() {
            CLOUD_SITE.to_string()
        } else {
            self.base_url()
        }
    }

    /// gRPC OTLP address (`host:port`, no scheme).
    pub fn otlp_endpoint(&self) -> String {
        if self.is_cloud() {
            CLOUD_OTLP_GRPC.to_string()
        } else {
            self.host.clone()
        }
    }

    /// HTTP OTLP base URL.
    pub fn otlp_http_endpoint(&self) -> String {
        if self.is_cloud() {
            CLOUD_OTLP_HTTP.to_string()
        } else {
            self.base_url()
        }
    }

    /// Endpoint accepting span batches.
    pub fn traces_endpoint(&self) -> String {
        format!(
            "{}/api/v1/tracing/{}/spans",
            self.base_url(),
            self.project_id
        )
    }

    /// Endpoint accepting metric batches.
    pub fn metrics_endpoint(&self) -> String {
        format!(
            "{}/api/v1/metrics/{}/measures",
            self.base_url(),
            self.project_id
        )
    }

    /// Link to a trace in the UI.
    pub fn trace_url(&self, trace_id: u128) -> String {
        format!("{}/traces/{:032x}", self.site_url(), trace_id)
    }

    fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }
}

/// Strips the `api.` alias so `api.example.dev` and `example.dev` route the same.
fn canonical_host(host: &str) -> String {
    match host.strip_prefix(API_LABEL) {
        Some(rest) if rest.contains('.') => rest.to_string(),
        _ => host.to_string(),
    }
}

impl FromStr for Dsn {
    type Err = DsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://<redacted>@{}/{}",
            self.scheme, self.host, self.project_id
        )
    }
}

impl fmt::Debug for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dsn")
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("project_id", &self.project_id)
            .field("token", &"<redacted>")
            .finish()
    }
}
