//! Upstream and backend value types.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Opaque, unique upstream identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpstreamId(pub String);

/// Backend identity, unique across the whole system.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(pub String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(UpstreamId);
string_id!(BackendId);

/// Protocols an upstream accepts traffic on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

/// A logical service with routing keys and a timeout policy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Upstream {
    pub id: UpstreamId,
    pub name: String,
    pub protocols: BTreeSet<Protocol>,
    /// Exact-match host routing keys.
    pub hostnames: Vec<String>,
    /// First-path-segment routing keys, e.g. `/api`.
    pub prefixes: Vec<String>,
    /// Per-upstream call deadline; 0 means "use the system default".
    pub timeout_ms: u64,
}

impl Upstream {
    pub fn new(id: impl Into<UpstreamId>) -> Self {
        let id = id.into();
        Self {
            name: id.0.clone(),
            id,
            ..Self::default()
        }
    }

    pub fn with_hostname(mut self, host: impl Into<String>) -> Self {
        self.hostnames.push(host.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefixes.push(prefix.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Declared timeout, `None` when the system default applies.
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.timeout_ms))
        }
    }

    /// Canonical form of the routing keys: lowercase hostnames without port,
    /// prefixes with a single leading slash and no trailing slash.
    pub fn normalized(mut self) -> Self {
        self.hostnames = self
            .hostnames
            .iter()
            .map(|h| crate::routing::matcher::normalize_host(h))
            .filter(|h| !h.is_empty())
            .collect();
        self.prefixes = self
            .prefixes
            .iter()
            .map(|p| format!("/{}", p.trim_matches('/')))
            .filter(|p| p != "/")
            .collect();
        self
    }
}

/// Optional active health-check descriptor carried with a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub path: String,
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
}

fn default_health_interval_ms() -> u64 {
    10_000
}

/// One network-addressable instance serving an upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    pub id: BackendId,
    pub address: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

/// Reasons a backend address is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("{0}")]
    Parse(#[from] url::ParseError),
    #[error("unsupported scheme '{0}'")]
    Scheme(String),
    #[error("missing host")]
    MissingHost,
}

impl Backend {
    /// Create a backend; the address must parse as an absolute http(s) URL.
    pub fn new(id: impl Into<BackendId>, address: &str) -> Result<Self, AddressError> {
        let address = Url::parse(address)?;
        Self::check_address(&address)?;
        Ok(Self {
            id: id.into(),
            address,
            health_check: None,
        })
    }

    pub fn with_health_check(mut self, check: HealthCheck) -> Self {
        self.health_check = Some(check);
        self
    }

    /// Checks a parsed address is usable as a proxy target.
    pub fn check_address(address: &Url) -> Result<(), AddressError> {
        match address.scheme() {
            "http" | "https" => {}
            other => return Err(AddressError::Scheme(other.to_string())),
        }
        if address.host_str().is_none() {
            return Err(AddressError::MissingHost);
        }
        Ok(())
    }
}
