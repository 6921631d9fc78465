use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::tls::OutputTlsSpec;

/// A named destination for log records.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Output {
    /// Unique name, referenced from `pipelines[].outputRefs`.
    pub name: String,

    #[serde(rename = "type")]
    pub type_: OutputType,

    /// Destination URL. Required for every type except `cloudwatch`, which uses the regional
    /// AWS endpoint when unset. TLS settings are only applied to secure schemes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Secret holding credentials and TLS material for this output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<OutputSecretSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<OutputTlsSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elasticsearch: Option<Elasticsearch>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloudwatch: Option<Cloudwatch>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syslog: Option<Syslog>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<Http>,
}

impl Output {
    pub fn url(&self) -> &str {
        self.url.as_deref().unwrap_or_default()
    }

    pub fn secret_name(&self) -> Option<&str> {
        self.secret
            .as_ref()
            .map(|secret| secret.name.as_str())
            .filter(|name| !name.is_empty())
    }
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum OutputType {
    #[default]
    Elasticsearch,
    Cloudwatch,
    Syslog,
    Http,
}

impl OutputType {
    /// Outputs of this type authenticate with cloud provider credentials.
    pub fn requires_cloud_credentials(&self) -> bool {
        matches!(self, Self::Cloudwatch)
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSecretSpec {
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Elasticsearch {
    /// Index to write to, may use record field templates. Defaults to `{log_type}-write`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,

    /// Major version of the Elasticsearch API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u8>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cloudwatch {
    pub region: String,

    #[serde(default)]
    pub group_by: CloudwatchGroupBy,

    /// Prepended to every log group name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_prefix: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CloudwatchGroupBy {
    #[default]
    LogType,
    NamespaceName,
    NamespaceUuid,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Syslog {
    #[serde(default)]
    pub rfc: SyslogRfc,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facility: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proc_id: Option<String>,
    /// RFC3164 tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Record field to send as the message payload instead of the whole record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_key: Option<String>,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum SyslogRfc {
    #[serde(rename = "RFC3164")]
    #[strum(serialize = "rfc3164")]
    Rfc3164,
    #[default]
    #[serde(rename = "RFC5424")]
    #[strum(serialize = "rfc5424")]
    Rfc5424,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Http {
    /// Defaults to `post`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Request timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
}
