//! Derives the per-connection TLS settings of the generated configuration from the TLS
//! material declared on an output or receiver and the effective TLS security profile.

use k8s_openapi::api::core::v1::Secret;
use log_forwarder_crd::{OutputTlsSpec, TlsSecurityProfile};
use strum::Display;
use url::Url;

use crate::secrets;

const SECURE_SCHEMES: [&str; 3] = ["https", "tls", "wss"];

/// The configuration section a TLS block belongs to.
#[derive(Clone, Copy, Debug, Default, Display, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum ComponentScope {
    #[default]
    Sinks,
    Sources,
}

/// TLS settings for a single component, ready for rendering.
///
/// Paths are mount paths inside the collector container; an empty string means the setting
/// is omitted from the rendered block.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TlsConfig {
    pub scope: ComponentScope,
    pub id: String,
    /// Only set for components that require TLS to be switched on explicitly.
    pub enabled: Option<bool>,
    pub needs_rendering: bool,
    pub insecure_skip_verify: bool,
    pub min_tls_version: String,
    pub cipher_suites: String,
    pub ca_file: String,
    pub cert_file: String,
    pub key_file: String,
    pub key_passphrase: String,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TlsOptions {
    pub scope: ComponentScope,
    /// Emit `enabled = true` when TLS material is declared.
    pub include_enabled: bool,
}

impl TlsConfig {
    pub fn disabled(scope: ComponentScope, id: &str) -> Self {
        Self {
            scope,
            id: id.to_string(),
            ..Self::default()
        }
    }

    /// `url` gates the whole block: plaintext destinations never get TLS settings, whatever
    /// the spec says. An empty URL stands for a provider default endpoint, which is always
    /// TLS, and is therefore not gated.
    pub fn new(
        id: &str,
        spec: Option<&OutputTlsSpec>,
        url: &str,
        profile: &TlsSecurityProfile,
        options: TlsOptions,
        secret: Option<&Secret>,
    ) -> Self {
        if !url.is_empty() && !is_secure(url) {
            return Self::disabled(options.scope, id);
        }

        let mut conf = Self {
            scope: options.scope,
            id: id.to_string(),
            min_tls_version: profile.min_tls_version().to_string(),
            cipher_suites: profile.cipher_suites(),
            ..Self::default()
        };

        if let Some(spec) = spec {
            if options.include_enabled {
                conf.enabled = Some(true);
            }
            conf.ca_file = secrets::config_map_or_secret_path(spec.ca.as_ref());
            conf.cert_file = secrets::config_map_or_secret_path(spec.certificate.as_ref());
            conf.key_file = secrets::secret_key_path(spec.key.as_ref());
            conf.key_passphrase = spec
                .key_passphrase
                .as_ref()
                .zip(secret)
                .filter(|(reference, secret)| {
                    secret.metadata.name.as_deref() == Some(reference.secret_name.as_str())
                })
                .and_then(|(reference, secret)| secrets::value(secret, &reference.key))
                .unwrap_or_default();
            conf.insecure_skip_verify = spec.insecure_skip_verify;
        }

        conf.needs_rendering =
            !conf.cipher_suites.is_empty() || !conf.min_tls_version.is_empty() || spec.is_some();
        conf
    }

    /// A client certificate is only usable together with its key.
    pub fn has_client_certificate(&self) -> bool {
        !self.key_file.is_empty() && !self.cert_file.is_empty()
    }
}

pub fn is_secure(url: &str) -> bool {
    Url::parse(url).is_ok_and(|url| SECURE_SCHEMES.contains(&url.scheme()))
}

/// Translates Go-style version names (`VersionTLS12`) into the `TLSv1_2` form.
pub fn openssl_version_name(version: &str) -> String {
    match version.strip_prefix("VersionTLS") {
        Some(digits) if digits.len() == 2 => {
            let (major, minor) = digits.split_at(1);
            format!("TLSv{major}_{minor}")
        }
        _ => version.to_string(),
    }
}
