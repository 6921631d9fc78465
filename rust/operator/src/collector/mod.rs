//! Everything that differs between the supported collector agents lives behind
//! [`CollectorStrategy`]: images, default resources, file locations, how federated cloud
//! credentials are delivered, and the configuration dialect.

use std::collections::BTreeMap;

use const_format::concatcp;
use k8s_openapi::{
    api::core::v1::ResourceRequirements, apimachinery::pkg::api::resource::Quantity,
};
use log_forwarder_crd::CollectorType;

use crate::config::{Document, Element, Error};

pub mod fluentd;
pub mod vector;

pub use fluentd::FluentdStrategy;
pub use vector::VectorStrategy;

const LOG_LEVEL: &str = "warn";

pub const WEB_IDENTITY_TOKEN_DIR: &str = "/var/run/ocp-collector/serviceaccount";
pub const WEB_IDENTITY_TOKEN_FILE_NAME: &str = "token";
pub const WEB_IDENTITY_TOKEN_FILE: &str =
    concatcp!(WEB_IDENTITY_TOKEN_DIR, "/", WEB_IDENTITY_TOKEN_FILE_NAME);
pub const ROLE_SESSION_NAME: &str = "cluster-logging";

/// How a collector learns about STS (web identity) credentials for cloud outputs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CredentialDelivery {
    /// Role ARN and token file are injected as `AWS_*` environment variables.
    Environment,
    /// The generated configuration declares the role itself.
    Configuration,
}

pub trait CollectorStrategy: Send + Sync {
    fn collector_type(&self) -> CollectorType;

    fn default_image(&self) -> &'static str;

    /// Environment variable the operator reads an image override from.
    fn image_env_var(&self) -> &'static str;

    fn default_resources(&self) -> ResourceRequirements;

    fn credential_delivery(&self) -> CredentialDelivery;

    fn config_dir(&self) -> &'static str;

    fn config_file_name(&self) -> &'static str;

    fn config_path(&self) -> String {
        format!("{}/{}", self.config_dir(), self.config_file_name())
    }

    fn data_dir(&self) -> &'static str;

    fn command(&self) -> Vec<String>;

    /// Name of the environment variable that sets the agent log level.
    fn log_level_env_var(&self) -> &'static str;

    fn log_level(&self) -> &'static str {
        LOG_LEVEL
    }

    /// Document-wide prologue, rendered before the first element.
    fn preamble(&self, document: &Document) -> String;

    /// Renders a single element. An empty fragment is left out of the document.
    fn render_element(&self, element: &Element, document: &Document) -> Result<String, Error>;

    fn render(&self, document: &Document) -> Result<String, Error> {
        let mut config = self.preamble(document);
        for element in &document.elements {
            let fragment = self.render_element(element, document)?;
            if !fragment.is_empty() {
                config.push('\n');
                config.push_str(&fragment);
            }
        }
        Ok(config)
    }
}

pub fn strategy(collector_type: CollectorType) -> &'static dyn CollectorStrategy {
    match collector_type {
        CollectorType::Vector => &VectorStrategy,
        CollectorType::Fluentd => &FluentdStrategy,
    }
}

/// Double-quotes a string. Backslashes, quotes and control characters are escaped, so user
/// supplied values always stay a single basic string.
pub(crate) fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            c if c.is_control() => quoted.push_str(&format!("\\u{:04X}", u32::from(c))),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

pub(crate) fn quantities(entries: &[(&str, &str)]) -> Option<BTreeMap<String, Quantity>> {
    (!entries.is_empty()).then(|| {
        entries
            .iter()
            .map(|(name, value)| (name.to_string(), Quantity(value.to_string())))
            .collect()
    })
}
