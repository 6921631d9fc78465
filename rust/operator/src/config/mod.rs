//! Compiles a forwarder spec into the configuration document of its collector.
//!
//! Compilation runs in two steps. [`assemble`] walks the pipelines and produces a
//! collector-agnostic [`Document`], an ordered list of [`Element`]s. The collector strategy then
//! renders each element into its own configuration fragment.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use log_forwarder_crd::{
    component,
    output::{CloudwatchGroupBy, Syslog},
    CollectorType, FilterType, Input, LogForwarderSpec, Output, OutputType, TlsSecurityProfile,
    ValidationError,
};
use snafu::{OptionExt, ResultExt, Snafu};
use url::Url;

use crate::{
    cluster::ClusterInfo,
    collector,
    secrets::{self, OutputSecrets},
    tls::{ComponentScope, TlsConfig, TlsOptions},
};

pub const SOURCE_CONTAINER_LOGS: &str = "raw_container_logs";
pub const SOURCE_JOURNAL_LOGS: &str = "raw_journal_logs";
pub const SOURCE_HOST_AUDIT_LOGS: &str = "raw_host_audit_logs";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("invalid forwarder spec"))]
    InvalidSpec { source: ValidationError },

    #[snafu(display("{collector_type} does not support outputs of type {type_} (output [{output}])"))]
    UnsupportedOutput {
        collector_type: CollectorType,
        output: String,
        type_: OutputType,
    },

    #[snafu(display("{collector_type} does not support receiver inputs (input [{input}])"))]
    UnsupportedReceiver {
        collector_type: CollectorType,
        input: String,
    },

    #[snafu(display("failed to parse URL of output [{output}]"))]
    ParseOutputUrl {
        source: url::ParseError,
        output: String,
    },

    #[snafu(display("URL of output [{output}] has no host"))]
    MissingHost { output: String },

    #[snafu(display("URL of output [{output}] has no port and its scheme has no default"))]
    MissingPort { output: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// The ordered, collector-agnostic intermediate form of a forwarder.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub collector_type: CollectorType,
    pub elements: Vec<Element>,
}

/// A single unit of the generated configuration.
#[derive(Clone, Debug, PartialEq)]
pub enum Element {
    ContainerSource,
    JournalSource,
    AuditSource,
    HttpReceiver(ReceiverElement),
    Input(InputElement),
    Pipeline(PipelineElement),
    Filter(FilterElement),
    Output(OutputElement),
}

impl Element {
    /// Unique within a document.
    pub fn id(&self) -> &str {
        match self {
            Element::ContainerSource => SOURCE_CONTAINER_LOGS,
            Element::JournalSource => SOURCE_JOURNAL_LOGS,
            Element::AuditSource => SOURCE_HOST_AUDIT_LOGS,
            Element::HttpReceiver(receiver) => &receiver.id,
            Element::Input(input) => &input.id,
            Element::Pipeline(pipeline) => &pipeline.id,
            Element::Filter(filter) => &filter.id,
            Element::Output(output) => &output.id,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReceiverElement {
    pub id: String,
    /// Name of the input the receiver belongs to.
    pub input: String,
    pub port: u16,
    pub tls: TlsConfig,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InputElement {
    pub id: String,
    pub name: String,
    pub kind: InputKind,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InputKind {
    /// Container logs outside the infrastructure namespaces, optionally narrowed down.
    Application { namespaces: Vec<String> },
    Infrastructure,
    Audit,
    Receiver { source: String },
}

impl InputKind {
    pub fn log_type(&self) -> &'static str {
        match self {
            InputKind::Application { .. } => "application",
            InputKind::Infrastructure => "infrastructure",
            InputKind::Audit | InputKind::Receiver { .. } => "audit",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineElement {
    pub id: String,
    pub name: String,
    /// IDs of the input elements, in reference order.
    pub inputs: Vec<String>,
    /// Stamped onto every record when non-empty.
    pub cluster_id: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FilterElement {
    pub id: String,
    pub pipeline: String,
    pub kind: FilterKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FilterKind {
    DetectMultilineException,
    ParseJson,
    Labels(BTreeMap<String, String>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutputElement {
    pub id: String,
    pub name: String,
    /// IDs of the pipelines feeding this output, in first reference order.
    pub pipelines: Vec<String>,
    pub sink: Sink,
    pub tls: TlsConfig,
    pub auth: Option<Auth>,
}

impl OutputElement {
    pub fn output_type(&self) -> OutputType {
        match self.sink {
            Sink::Elasticsearch { .. } => OutputType::Elasticsearch,
            Sink::Cloudwatch { .. } => OutputType::Cloudwatch,
            Sink::Syslog { .. } => OutputType::Syslog,
            Sink::Http { .. } => OutputType::Http,
        }
    }
}

/// A parsed destination URL.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    pub url: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    fn parse(output: &Output, default_port: Option<u16>) -> Result<Self> {
        let url = Url::parse(output.url()).context(ParseOutputUrlSnafu {
            output: &output.name,
        })?;
        let host = url.host_str().context(MissingHostSnafu {
            output: &output.name,
        })?;
        let port = url
            .port_or_known_default()
            .or(default_port)
            .context(MissingPortSnafu {
                output: &output.name,
            })?;
        Ok(Self {
            url: output.url().to_string(),
            scheme: url.scheme().to_string(),
            host: host.to_string(),
            port,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Sink {
    Elasticsearch {
        endpoint: Endpoint,
        index: Option<String>,
        version: Option<u8>,
    },
    Cloudwatch {
        region: String,
        group_by: CloudwatchGroupBy,
        group_prefix: Option<String>,
        /// Empty for the regional AWS endpoint.
        endpoint: String,
    },
    Syslog {
        endpoint: Endpoint,
        settings: Syslog,
    },
    Http {
        endpoint: Endpoint,
        method: String,
        headers: BTreeMap<String, String>,
        timeout_secs: Option<u32>,
    },
}

impl Sink {
    /// The cloud region of sinks that write to a cloud provider.
    pub fn region(&self) -> Option<&str> {
        match self {
            Sink::Cloudwatch { region, .. } => Some(region),
            _ => None,
        }
    }
}

/// A secret value together with the path the secret key is mounted at.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SecretValue {
    pub path: String,
    pub value: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Auth {
    Basic {
        username: SecretValue,
        password: SecretValue,
    },
    Bearer {
        token: SecretValue,
    },
    AwsAccessKey {
        key_id: SecretValue,
        secret_key: SecretValue,
    },
    /// Assume a role with the projected service account token.
    AwsWebIdentity {
        role_arn: String,
    },
}

impl Document {
    pub fn inputs(&self) -> impl Iterator<Item = &InputElement> {
        self.elements.iter().filter_map(|element| match element {
            Element::Input(input) => Some(input),
            _ => None,
        })
    }

    pub fn pipelines(&self) -> impl Iterator<Item = &PipelineElement> {
        self.elements.iter().filter_map(|element| match element {
            Element::Pipeline(pipeline) => Some(pipeline),
            _ => None,
        })
    }

    pub fn filters(&self) -> impl Iterator<Item = &FilterElement> {
        self.elements.iter().filter_map(|element| match element {
            Element::Filter(filter) => Some(filter),
            _ => None,
        })
    }

    pub fn outputs(&self) -> impl Iterator<Item = &OutputElement> {
        self.elements.iter().filter_map(|element| match element {
            Element::Output(output) => Some(output),
            _ => None,
        })
    }

    /// IDs of the pipelines reading from the given input.
    pub fn pipelines_reading(&self, input_id: &str) -> Vec<&str> {
        self.pipelines()
            .filter(|pipeline| pipeline.inputs.iter().any(|input| input == input_id))
            .map(|pipeline| pipeline.id.as_str())
            .collect()
    }

    /// The element the outputs of a pipeline read from: its last filter, or the pipeline
    /// itself when it has none.
    pub fn pipeline_tail<'a>(&'a self, pipeline_id: &'a str) -> &'a str {
        self.filters()
            .filter(|filter| filter.pipeline == pipeline_id)
            .last()
            .map(|filter| filter.id.as_str())
            .unwrap_or(pipeline_id)
    }

    /// The element a filter reads from: the filter before it, or its pipeline.
    pub fn previous_hop<'a>(&'a self, filter: &'a FilterElement) -> &'a str {
        self.filters()
            .filter(|candidate| candidate.pipeline == filter.pipeline)
            .take_while(|candidate| candidate.id != filter.id)
            .last()
            .map(|candidate| candidate.id.as_str())
            .unwrap_or(&filter.pipeline)
    }

    /// IDs of the elements directly downstream of `id` within a pipeline: the next filter,
    /// or all outputs of the pipeline once the chain is exhausted.
    pub fn next_hops(&self, pipeline_id: &str, id: &str) -> Vec<&str> {
        let filters: Vec<&FilterElement> = self
            .filters()
            .filter(|filter| filter.pipeline == pipeline_id)
            .collect();
        let position = filters.iter().position(|filter| filter.id == id);
        let next = match position {
            Some(index) => filters.get(index + 1),
            None => filters.first(),
        };
        match next {
            Some(filter) => vec![filter.id.as_str()],
            None => self
                .outputs()
                .filter(|output| output.pipelines.iter().any(|p| p == pipeline_id))
                .map(|output| output.id.as_str())
                .collect(),
        }
    }
}

/// Validates the spec and renders the configuration document of its collector type.
pub fn compile(
    spec: &LogForwarderSpec,
    collector_type: CollectorType,
    secrets: &OutputSecrets,
    cluster: &ClusterInfo,
) -> Result<String> {
    let document = assemble(spec, collector_type, secrets, cluster)?;
    collector::strategy(collector_type).render(&document)
}

/// Walks the pipelines in declaration order and builds the element list.
///
/// Inputs, filters and outputs appear in the order they are first referenced; everything no
/// pipeline references is left out.
pub fn assemble(
    spec: &LogForwarderSpec,
    collector_type: CollectorType,
    secrets: &OutputSecrets,
    cluster: &ClusterInfo,
) -> Result<Document> {
    spec.validate().context(InvalidSpecSnafu)?;

    let profile = cluster.effective_tls_profile(spec.tls_security_profile.as_ref());

    let mut inputs: Vec<(Input, InputElement)> = Vec::new();
    let mut chain: Vec<Element> = Vec::new();
    let mut output_pipelines: Vec<(&str, Vec<String>)> = Vec::new();

    for (index, pipeline) in spec.pipelines.iter().enumerate() {
        let name = pipeline.name_or_default(index);
        let pipeline_id = component::pipeline_id(&name);

        let mut input_ids = Vec::new();
        for input_name in &pipeline.input_refs {
            let input_id = component::input_id(input_name);
            if !inputs.iter().any(|(_, element)| element.id == input_id) {
                // validated above, so the lookup cannot miss
                if let Some(input) = spec.input(input_name) {
                    let element = input_element(&input, &input_id);
                    inputs.push((input, element));
                }
            }
            if !input_ids.contains(&input_id) {
                input_ids.push(input_id);
            }
        }

        chain.push(Element::Pipeline(PipelineElement {
            id: pipeline_id.clone(),
            name: name.clone(),
            inputs: input_ids,
            cluster_id: cluster.cluster_id.clone(),
        }));

        for filter_name in &pipeline.filter_refs {
            if let Some(filter) = spec.filter(filter_name) {
                let kind = match filter.type_ {
                    FilterType::DetectMultilineException => FilterKind::DetectMultilineException,
                    FilterType::ParseJson => FilterKind::ParseJson,
                    FilterType::Labels => FilterKind::Labels(filter.labels.clone()),
                };
                chain.push(Element::Filter(FilterElement {
                    id: component::filter_id(&pipeline_id, filter_name),
                    pipeline: pipeline_id.clone(),
                    kind,
                }));
            }
        }

        for output_name in &pipeline.output_refs {
            match output_pipelines
                .iter_mut()
                .find(|(name, _)| *name == output_name.as_str())
            {
                Some((_, pipelines)) => {
                    if !pipelines.contains(&pipeline_id) {
                        pipelines.push(pipeline_id.clone());
                    }
                }
                None => output_pipelines.push((output_name.as_str(), vec![pipeline_id.clone()])),
            }
        }
    }

    let mut elements = source_elements(&inputs, profile);
    elements.extend(inputs.into_iter().map(|(_, element)| Element::Input(element)));
    elements.extend(chain);
    for (output_name, pipelines) in output_pipelines {
        if let Some(output) = spec.output(output_name) {
            elements.push(Element::Output(output_element(
                output,
                pipelines,
                secrets.get(output_name),
                profile,
            )?));
        }
    }

    tracing::debug!(
        %collector_type,
        elements = elements.len(),
        "Assembled collector configuration document"
    );
    Ok(Document {
        collector_type,
        elements,
    })
}

fn input_element(input: &Input, id: &str) -> InputElement {
    let kind = if let Some(application) = &input.application {
        InputKind::Application {
            namespaces: application.namespaces.clone(),
        }
    } else if input.infrastructure.is_some() {
        InputKind::Infrastructure
    } else if input.audit.is_some() {
        InputKind::Audit
    } else {
        InputKind::Receiver {
            source: component::receiver_id(id),
        }
    };
    InputElement {
        id: id.to_string(),
        name: input.name.clone(),
        kind,
    }
}

/// The collection sources needed by the referenced inputs, in a fixed order.
fn source_elements(
    inputs: &[(Input, InputElement)],
    profile: &TlsSecurityProfile,
) -> Vec<Element> {
    let needs = |matches: fn(&InputKind) -> bool| inputs.iter().any(|(_, input)| matches(&input.kind));

    let mut sources = Vec::new();
    if needs(|kind| matches!(kind, InputKind::Application { .. } | InputKind::Infrastructure)) {
        sources.push(Element::ContainerSource);
    }
    if needs(|kind| matches!(kind, InputKind::Infrastructure)) {
        sources.push(Element::JournalSource);
    }
    if needs(|kind| matches!(kind, InputKind::Audit)) {
        sources.push(Element::AuditSource);
    }
    for (input, element) in inputs {
        if let (InputKind::Receiver { source }, Some(receiver)) = (&element.kind, &input.receiver) {
            sources.push(Element::HttpReceiver(ReceiverElement {
                id: source.clone(),
                input: input.name.clone(),
                port: receiver.port,
                tls: TlsConfig::new(
                    source,
                    receiver.tls.as_ref(),
                    "",
                    profile,
                    TlsOptions {
                        scope: ComponentScope::Sources,
                        include_enabled: true,
                    },
                    None,
                ),
            }));
        }
    }
    sources
}

fn output_element(
    output: &Output,
    pipelines: Vec<String>,
    secret: Option<&Secret>,
    profile: &TlsSecurityProfile,
) -> Result<OutputElement> {
    let id = component::output_id(&output.name);

    let sink = match output.type_ {
        OutputType::Elasticsearch => {
            let elasticsearch = output.elasticsearch.clone().unwrap_or_default();
            Sink::Elasticsearch {
                endpoint: Endpoint::parse(output, None)?,
                index: elasticsearch.index,
                version: elasticsearch.version,
            }
        }
        OutputType::Cloudwatch => {
            let cloudwatch = output.cloudwatch.clone().unwrap_or_default();
            Sink::Cloudwatch {
                region: cloudwatch.region,
                group_by: cloudwatch.group_by,
                group_prefix: cloudwatch.group_prefix,
                endpoint: output.url().to_string(),
            }
        }
        OutputType::Syslog => Sink::Syslog {
            endpoint: Endpoint::parse(output, Some(514))?,
            settings: output.syslog.clone().unwrap_or_default(),
        },
        OutputType::Http => {
            let http = output.http.clone().unwrap_or_default();
            Sink::Http {
                endpoint: Endpoint::parse(output, None)?,
                method: http
                    .method
                    .filter(|method| !method.is_empty())
                    .map(|method| method.to_lowercase())
                    .unwrap_or_else(|| "post".to_string()),
                headers: http.headers,
                timeout_secs: http.timeout,
            }
        }
    };

    let tls = TlsConfig::new(
        &id,
        output.tls.as_ref(),
        output.url(),
        profile,
        TlsOptions {
            scope: ComponentScope::Sinks,
            include_enabled: output.type_ == OutputType::Syslog,
        },
        secret,
    );
    let auth = secret.and_then(|secret| auth(output, secret));

    Ok(OutputElement {
        id,
        name: output.name.clone(),
        pipelines,
        sink,
        tls,
        auth,
    })
}

/// Picks the authentication method from the keys present in the output secret.
fn auth(output: &Output, secret: &Secret) -> Option<Auth> {
    let secret_name = output
        .secret_name()
        .or(secret.metadata.name.as_deref())
        .unwrap_or_default();
    let read = |key: &str| {
        secrets::value(secret, key).map(|value| SecretValue {
            path: secrets::secret_path(secret_name, key),
            value,
        })
    };
    let basic = || {
        Some(Auth::Basic {
            username: read(secrets::USERNAME_KEY)?,
            password: read(secrets::PASSWORD_KEY)?,
        })
    };

    match output.type_ {
        OutputType::Elasticsearch => basic(),
        OutputType::Http => basic().or_else(|| {
            read(secrets::TOKEN_KEY).map(|token| Auth::Bearer { token })
        }),
        OutputType::Cloudwatch => read(secrets::AWS_ACCESS_KEY_ID_KEY)
            .zip(read(secrets::AWS_SECRET_ACCESS_KEY_KEY))
            .map(|(key_id, secret_key)| Auth::AwsAccessKey { key_id, secret_key })
            .or_else(|| secrets::role_arn(secret).map(|role_arn| Auth::AwsWebIdentity { role_arn })),
        OutputType::Syslog => None,
    }
}
