//! Best-effort IP geolocation through a ranked list of lookup providers.
//!
//! Each provider maps its own response shape to a [`GeoLocation`]. The chain
//! tries providers in rank order and keeps the first one that returns a
//! non-empty address. Exhausting the chain is not an error: the visitor is
//! recorded with an unknown location.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::config::{GeoConfig, GeoProviderConfig};
use crate::error::{AnalyticsError, Result};

/// Address recorded when no provider answered.
pub const UNKNOWN_IP: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub ip: String,
    pub country: String,
    pub city: String,
}

impl GeoLocation {
    pub fn unknown() -> Self {
        Self {
            ip: UNKNOWN_IP.to_string(),
            country: String::new(),
            city: String::new(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.ip == UNKNOWN_IP
    }
}

/// A single geolocation source.
#[async_trait]
pub trait GeoProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Look up the caller's address.
    async fn lookup(&self) -> Result<GeoLocation>;
}

/// Response shapes of the supported lookup services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// `{"ip", "country_name", "city"}`
    IpapiCo,
    /// `{"status", "query", "country", "city"}`
    IpApiCom,
    /// `{"ip", "country", "city"}`
    Ipinfo,
    /// `{"ip"}`
    Ipify,
}

impl ProviderKind {
    /// Map a response body to a location. `None` when the body carries no
    /// usable address.
    pub fn adapt(&self, body: &Value) -> Option<GeoLocation> {
        let field = |name: &str| {
            body.get(name)
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .unwrap_or_default()
        };

        let location = match self {
            ProviderKind::IpapiCo => {
                if body.get("error").and_then(Value::as_bool) == Some(true) {
                    return None;
                }
                GeoLocation {
                    ip: field("ip"),
                    country: field("country_name"),
                    city: field("city"),
                }
            }
            ProviderKind::IpApiCom => {
                if field("status") != "success" {
                    return None;
                }
                GeoLocation {
                    ip: field("query"),
                    country: field("country"),
                    city: field("city"),
                }
            }
            ProviderKind::Ipinfo => GeoLocation {
                ip: field("ip"),
                country: field("country"),
                city: field("city"),
            },
            ProviderKind::Ipify => GeoLocation {
                ip: field("ip"),
                country: String::new(),
                city: String::new(),
            },
        };

        if location.ip.is_empty() {
            None
        } else {
            Some(location)
        }
    }
}

/// JSON-over-HTTP lookup provider.
pub struct HttpGeoProvider {
    name: String,
    url: Url,
    kind: ProviderKind,
    client: reqwest::Client,
}

impl HttpGeoProvider {
    pub fn new(name: impl Into<String>, url: &str, kind: ProviderKind, timeout: Duration) -> Result<Self> {
        let name = name.into();
        let url = Url::parse(url)
            .map_err(|e| AnalyticsError::Config(format!("Invalid URL for provider '{}': {}", name, e)))?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(AnalyticsError::Config(format!(
                    "Provider '{}' uses unsupported scheme '{}'",
                    name, other
                )));
            }
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("visitor-pulse/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            name,
            url,
            kind,
            client,
        })
    }

    pub fn from_config(entry: &GeoProviderConfig, timeout: Duration) -> Result<Self> {
        Self::new(entry.name.clone(), &entry.url, entry.kind, timeout)
    }
}

#[async_trait]
impl GeoProvider for HttpGeoProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self) -> Result<GeoLocation> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| AnalyticsError::lookup(&self.name, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AnalyticsError::lookup(&self.name, format!("HTTP {}", status)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AnalyticsError::lookup(&self.name, format!("malformed body: {}", e)))?;

        self.kind
            .adapt(&body)
            .ok_or_else(|| AnalyticsError::lookup(&self.name, "no usable address in response"))
    }
}

/// Ranked provider list.
#[derive(Clone, Default)]
pub struct GeoChain {
    providers: Vec<Arc<dyn GeoProvider>>,
    timeout: Option<Duration>,
}

impl GeoChain {
    pub fn new(providers: Vec<Arc<dyn GeoProvider>>) -> Self {
        Self {
            providers,
            timeout: None,
        }
    }

    /// Chain that never looks anything up.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Bound each provider call, on top of any timeout the provider applies.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the chain from config. Entries with invalid URLs are logged and
    /// skipped.
    pub fn from_config(config: &GeoConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        let timeout = Duration::from_millis(config.timeout_ms);
        let providers = config
            .providers
            .iter()
            .filter_map(|entry| match HttpGeoProvider::from_config(entry, timeout) {
                Ok(p) => Some(Arc::new(p) as Arc<dyn GeoProvider>),
                Err(e) => {
                    warn!("Skipping geolocation provider '{}': {}", entry.name, e);
                    None
                }
            })
            .collect();
        Self::new(providers).with_timeout(timeout)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Resolve the caller's location, trying providers in order.
    pub async fn resolve(&self) -> GeoLocation {
        for provider in &self.providers {
            debug!("Trying geolocation provider: {}", provider.name());

            let result = match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, provider.lookup()).await {
                    Ok(result) => result,
                    Err(_) => Err(AnalyticsError::lookup(provider.name(), "timed out")),
                },
                None => provider.lookup().await,
            };

            match result {
                Ok(location) if !location.ip.trim().is_empty() => {
                    debug!("Resolved {} via {}", location.ip, provider.name());
                    return location;
                }
                Ok(_) => {
                    warn!("Provider {} returned an empty address", provider.name());
                }
                Err(e) => {
                    warn!("Geolocation lookup failed: {}", e);
                }
            }
        }

        if !self.providers.is_empty() {
            warn!("All geolocation providers failed, recording unknown location");
        }
        GeoLocation::unknown()
    }
}
