pub mod component;
pub mod output;
pub mod tls;
pub mod validation;

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{ResourceRequirements, Toleration},
    apimachinery::pkg::apis::meta::v1::Time,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

pub use crate::{
    output::{Output, OutputType},
    tls::{ConfigMapOrSecretKey, OutputTlsSpec, SecretKey, TlsSecurityProfile},
    validation::ValidationError,
};

pub const APP_NAME: &str = "log-forwarder";

pub const INPUT_NAME_APPLICATION: &str = "application";
pub const INPUT_NAME_INFRASTRUCTURE: &str = "infrastructure";
pub const INPUT_NAME_AUDIT: &str = "audit";

/// The inputs every forwarder can reference without declaring them.
pub const RESERVED_INPUT_NAMES: [&str; 3] = [
    INPUT_NAME_APPLICATION,
    INPUT_NAME_INFRASTRUCTURE,
    INPUT_NAME_AUDIT,
];

pub const CONDITION_TYPE_READY: &str = "Ready";
pub const CONDITION_TYPE_COLLECTOR_DEAD_END: &str = "CollectorDeadEnd";
pub const CONDITION_REASON_INVALID: &str = "Invalid";

/// A LogForwarder routes log streams from a set of inputs through optional filters to a set
/// of outputs. The operator renders the routing into the configuration of a log collector
/// agent and builds the workload running that agent.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "logging.forwarder.dev",
    version = "v1",
    kind = "LogForwarder",
    shortname = "lf",
    status = "LogForwarderStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LogForwarderSpec {
    /// Routes connecting inputs to outputs. Only outputs referenced by at least one pipeline
    /// end up in the generated configuration.
    #[serde(default)]
    pub pipelines: Vec<Pipeline>,

    /// Custom named inputs. `application`, `infrastructure` and `audit` are always available.
    #[serde(default)]
    pub inputs: Vec<Input>,

    // no doc - docs in Output struct.
    #[serde(default)]
    pub outputs: Vec<Output>,

    /// Named filters that pipelines can apply in order.
    #[serde(default)]
    pub filters: Vec<Filter>,

    // no doc - docs in CollectorSpec struct.
    #[serde(default)]
    pub collector: CollectorSpec,

    /// TLS protocol parameters for all outputs. Overrides the cluster-wide profile when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_security_profile: Option<TlsSecurityProfile>,
}

impl LogForwarderSpec {
    pub fn output(&self, name: &str) -> Option<&Output> {
        self.outputs.iter().find(|output| output.name == name)
    }

    pub fn filter(&self, name: &str) -> Option<&Filter> {
        self.filters.iter().find(|filter| filter.name == name)
    }

    /// Looks up an input by name, materializing the reserved inputs on demand.
    pub fn input(&self, name: &str) -> Option<Input> {
        self.inputs
            .iter()
            .find(|input| input.name == name)
            .cloned()
            .or_else(|| Input::reserved(name))
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    /// Defaults to `pipeline_<index>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub input_refs: Vec<String>,
    pub output_refs: Vec<String>,
    #[serde(default)]
    pub filter_refs: Vec<String>,
}

impl Pipeline {
    pub fn name_or_default(&self, index: usize) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("pipeline_{index}"),
        }
    }
}

/// A named log source. Exactly one of the kinds must be set.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Input {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<ApplicationInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure: Option<InfrastructureInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit: Option<AuditInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<ReceiverInput>,
}

impl Input {
    pub fn reserved(name: &str) -> Option<Self> {
        let mut input = Input {
            name: name.to_string(),
            ..Input::default()
        };
        match name {
            INPUT_NAME_APPLICATION => input.application = Some(ApplicationInput::default()),
            INPUT_NAME_INFRASTRUCTURE => input.infrastructure = Some(InfrastructureInput {}),
            INPUT_NAME_AUDIT => input.audit = Some(AuditInput {}),
            _ => return None,
        }
        Some(input)
    }

    pub fn declared_kinds(&self) -> usize {
        [
            self.application.is_some(),
            self.infrastructure.is_some(),
            self.audit.is_some(),
            self.receiver.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationInput {
    /// Only collect container logs from these namespaces. All non-infrastructure namespaces
    /// when empty.
    #[serde(default)]
    pub namespaces: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct InfrastructureInput {}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct AuditInput {}

/// Receives logs pushed to the collector over HTTP.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverInput {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<OutputTlsSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: FilterType,
    /// Labels added to every record, only used by `labels` filters.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum FilterType {
    #[default]
    DetectMultilineException,
    ParseJson,
    Labels,
}

/// The collector agent implementation and its workload overrides.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorSpec {
    #[serde(default, rename = "type")]
    pub type_: CollectorType,

    /// Replaces the collector type's default resource requirements as a whole.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Appended to the default tolerations.
    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    /// Overlaid on the default node selector.
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum CollectorType {
    #[default]
    Vector,
    Fluentd,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogForwarderStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// A typed status entry describing one aspect of the reconcile outcome.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: Time,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Some(now),
        }
    }

    pub fn ready(now: Time) -> Self {
        Self::new(CONDITION_TYPE_READY, ConditionStatus::True, "", "", now)
    }

    pub fn invalid(message: impl Into<String>, now: Time) -> Self {
        Self::new(
            CONDITION_TYPE_READY,
            ConditionStatus::False,
            CONDITION_REASON_INVALID,
            message,
            now,
        )
    }

    pub fn dead_end(message: impl Into<String>, now: Time) -> Self {
        Self::new(
            CONDITION_TYPE_COLLECTOR_DEAD_END,
            ConditionStatus::True,
            CONDITION_REASON_INVALID,
            message,
            now,
        )
    }

    pub fn no_dead_end(now: Time) -> Self {
        Self::new(
            CONDITION_TYPE_COLLECTOR_DEAD_END,
            ConditionStatus::False,
            "",
            "",
            now,
        )
    }
}

impl LogForwarder {
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|status| status.conditions.as_slice())
            .unwrap_or_default()
    }
}
