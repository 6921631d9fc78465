//! Operator and cluster level settings that are read once and then passed by reference into
//! every reconcile.

use std::collections::BTreeMap;

use log_forwarder_crd::{CollectorType, TlsSecurityProfile};
use strum::IntoEnumIterator;

use crate::{collector, pod::WorkloadDefaults};

pub const HTTP_PROXY_ENV: &str = "HTTP_PROXY";
pub const HTTPS_PROXY_ENV: &str = "HTTPS_PROXY";
pub const NO_PROXY_ENV: &str = "NO_PROXY";

/// The cluster-wide proxy the collector has to use for outbound connections.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProxyConfig {
    pub http_proxy: String,
    pub https_proxy: String,
    pub no_proxy: String,
}

impl ProxyConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            http_proxy: lookup(HTTP_PROXY_ENV).unwrap_or_default(),
            https_proxy: lookup(HTTPS_PROXY_ENV).unwrap_or_default(),
            no_proxy: lookup(NO_PROXY_ENV).unwrap_or_default(),
        }
    }
}

/// Facts about the cluster a forwarder is reconciled in.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClusterInfo {
    pub cluster_id: String,
    pub schema_version: String,
    /// Cluster-wide TLS profile, used unless the forwarder declares its own.
    pub tls_security_profile: TlsSecurityProfile,
    pub proxy: ProxyConfig,
}

impl ClusterInfo {
    pub fn effective_tls_profile<'a>(
        &'a self,
        forwarder_profile: Option<&'a TlsSecurityProfile>,
    ) -> &'a TlsSecurityProfile {
        forwarder_profile.unwrap_or(&self.tls_security_profile)
    }
}

/// Immutable operator configuration, built once at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    pub images: BTreeMap<CollectorType, String>,
    pub workload: WorkloadDefaults,
    pub proxy: ProxyConfig,
}

impl OperatorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Collector images come from `RELATED_IMAGE_<TYPE>` and fall back to the built-in
    /// defaults of each collector type.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let images = CollectorType::iter()
            .map(|collector_type| {
                let strategy = collector::strategy(collector_type);
                let image = lookup(strategy.image_env_var())
                    .filter(|image| !image.is_empty())
                    .unwrap_or_else(|| strategy.default_image().to_string());
                (collector_type, image)
            })
            .collect();
        let config = Self {
            images,
            workload: WorkloadDefaults::default(),
            proxy: ProxyConfig::from_lookup(lookup),
        };
        tracing::debug!(images = ?config.images, "Loaded operator config");
        config
    }

    pub fn image(&self, collector_type: CollectorType) -> &str {
        self.images
            .get(&collector_type)
            .map(String::as_str)
            .unwrap_or_else(|| collector::strategy(collector_type).default_image())
    }
}
