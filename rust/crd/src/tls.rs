use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// TLS material for a connection. Protocol parameters (minimum version, ciphers) are
/// governed separately by the [`TlsSecurityProfile`].
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputTlsSpec {
    /// CA bundle used to verify the peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<ConfigMapOrSecretKey>,

    /// Client certificate, used together with `key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<ConfigMapOrSecretKey>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<SecretKey>,

    /// Passphrase protecting `key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_passphrase: Option<SecretKey>,

    /// Disables certificate and hostname verification. Not recommended.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// A key within either a ConfigMap or a Secret. The Secret wins if both are named.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapOrSecretKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    pub key: String,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretKey {
    pub secret_name: String,
    pub key: String,
}

/// Protocol parameters applied to every TLS connection of the collector.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSecurityProfile {
    /// Go-style version name, e.g. `VersionTLS12`.
    #[serde(
        default,
        rename = "minTLSVersion",
        skip_serializing_if = "Option::is_none"
    )]
    pub min_tls_version: Option<String>,

    /// OpenSSL cipher names.
    #[serde(default)]
    pub ciphers: Vec<String>,
}

impl TlsSecurityProfile {
    pub fn min_tls_version(&self) -> &str {
        self.min_tls_version.as_deref().unwrap_or_default()
    }

    pub fn cipher_suites(&self) -> String {
        self.ciphers.join(",")
    }
}
