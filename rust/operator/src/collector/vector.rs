//! Renders the vector TOML dialect.

use std::fmt::Write;

use indoc::{formatdoc, indoc};
use k8s_openapi::api::core::v1::ResourceRequirements;
use log_forwarder_crd::{output::CloudwatchGroupBy, CollectorType};

use super::{quote, CollectorStrategy, CredentialDelivery};
use crate::{
    config::{
        Auth, Document, Element, Error, FilterElement, FilterKind, InputElement, InputKind,
        OutputElement, PipelineElement, ReceiverElement, Sink,
    },
    tls::TlsConfig,
};

pub const VECTOR_IMAGE: &str = "quay.io/openshift-logging/vector:6.0";
pub const VECTOR_CONFIG_DIR: &str = "/etc/vector";
pub const VECTOR_CONFIG_FILE: &str = "vector.toml";
pub const VECTOR_DATA_DIR: &str = "/var/lib/vector";

const DEFAULT_ES_INDEX: &str = "{{ log_type }}-write";
const INFRASTRUCTURE_NAMESPACES: &str = r#"starts_with!(.kubernetes.namespace_name, "kube-") || starts_with!(.kubernetes.namespace_name, "openshift-") || .kubernetes.namespace_name == "default""#;

pub struct VectorStrategy;

impl CollectorStrategy for VectorStrategy {
    fn collector_type(&self) -> CollectorType {
        CollectorType::Vector
    }

    fn default_image(&self) -> &'static str {
        VECTOR_IMAGE
    }

    fn image_env_var(&self) -> &'static str {
        "RELATED_IMAGE_VECTOR"
    }

    fn default_resources(&self) -> ResourceRequirements {
        ResourceRequirements::default()
    }

    fn credential_delivery(&self) -> CredentialDelivery {
        CredentialDelivery::Environment
    }

    fn config_dir(&self) -> &'static str {
        VECTOR_CONFIG_DIR
    }

    fn config_file_name(&self) -> &'static str {
        VECTOR_CONFIG_FILE
    }

    fn data_dir(&self) -> &'static str {
        VECTOR_DATA_DIR
    }

    fn command(&self) -> Vec<String> {
        vec![
            "vector".to_string(),
            "--config-toml".to_string(),
            self.config_path(),
        ]
    }

    fn log_level_env_var(&self) -> &'static str {
        "VECTOR_LOG"
    }

    fn preamble(&self, document: &Document) -> String {
        formatdoc! {r#"
            # Generated by {app} for {collector_type}. Do not edit.
            expire_metrics_secs = 60
            data_dir = "{VECTOR_DATA_DIR}"
            "#,
            app = log_forwarder_crd::APP_NAME,
            collector_type = document.collector_type,
        }
    }

    fn render_element(&self, element: &Element, document: &Document) -> Result<String, Error> {
        Ok(match element {
            Element::ContainerSource => container_source(),
            Element::JournalSource => journal_source(),
            Element::AuditSource => audit_source(),
            Element::HttpReceiver(receiver) => http_receiver(receiver),
            Element::Input(input) => input_transform(input),
            Element::Pipeline(pipeline) => pipeline_transform(pipeline),
            Element::Filter(filter) => filter_transform(filter, document.previous_hop(filter)),
            Element::Output(output) => {
                let inputs: Vec<&str> = output
                    .pipelines
                    .iter()
                    .map(|pipeline| document.pipeline_tail(pipeline))
                    .collect();
                sink(output, &inputs)
            }
        })
    }
}

fn array<S: AsRef<str>>(values: &[S]) -> String {
    let quoted: Vec<String> = values.iter().map(|value| quote(value.as_ref())).collect();
    format!("[{}]", quoted.join(", "))
}

fn container_source() -> String {
    indoc! {r#"
        [sources.raw_container_logs]
        type = "kubernetes_logs"
        glob_minimum_cooldown_ms = 15000
        auto_partial_merge = true
        exclude_paths_glob_patterns = ["/var/log/pods/*/collector/*.log", "/var/log/pods/*/*/*.gz", "/var/log/pods/*/*/*.tmp"]
        pod_annotation_fields.pod_labels = "kubernetes.labels"
        pod_annotation_fields.pod_namespace = "kubernetes.namespace_name"
        pod_annotation_fields.pod_annotations = "kubernetes.annotations"
        pod_annotation_fields.pod_uid = "kubernetes.pod_id"
        pod_annotation_fields.pod_node_name = "hostname"
        namespace_annotation_fields.namespace_uid = "kubernetes.namespace_id"
    "#}
    .to_string()
}

fn journal_source() -> String {
    indoc! {r#"
        [sources.raw_journal_logs]
        type = "journald"
        journal_directory = "/var/log/journal"
    "#}
    .to_string()
}

fn audit_source() -> String {
    indoc! {r#"
        [sources.raw_host_audit_logs]
        type = "file"
        include = ["/var/log/audit/audit.log"]
        host_key = "hostname"
        glob_minimum_cooldown_ms = 15000
    "#}
    .to_string()
}

fn http_receiver(receiver: &ReceiverElement) -> String {
    let mut fragment = formatdoc! {r#"
        [sources.{id}]
        type = "http_server"
        address = "[::]:{port}"
        decoding.codec = "json"
        "#,
        id = receiver.id,
        port = receiver.port,
    };
    fragment.push_str(&tls_table(&receiver.tls));
    fragment
}

fn remap<S: AsRef<str>>(id: &str, inputs: &[S], source: &[String]) -> String {
    let mut fragment = String::new();
    let _ = writeln!(fragment, "[transforms.{id}]");
    let _ = writeln!(fragment, "type = \"remap\"");
    let _ = writeln!(fragment, "inputs = {}", array(inputs));
    let _ = writeln!(fragment, "source = '''");
    for line in source {
        let _ = writeln!(fragment, "  {line}");
    }
    let _ = writeln!(fragment, "'''");
    fragment
}

fn abort_unless(condition: &str) -> [String; 3] {
    [
        format!("if {condition} {{"),
        "  abort".to_string(),
        "}".to_string(),
    ]
}

fn input_transform(input: &InputElement) -> String {
    let mut source = Vec::new();
    let inputs = match &input.kind {
        InputKind::Application { namespaces } => {
            if namespaces.is_empty() {
                source.extend(abort_unless(INFRASTRUCTURE_NAMESPACES));
            } else {
                source.extend(abort_unless(&format!(
                    "!includes({}, .kubernetes.namespace_name)",
                    array(namespaces)
                )));
            }
            vec![crate::config::SOURCE_CONTAINER_LOGS.to_string()]
        }
        InputKind::Infrastructure => {
            source.extend(abort_unless(&format!(
                "exists(.kubernetes.namespace_name) && !({INFRASTRUCTURE_NAMESPACES})"
            )));
            vec![
                crate::config::SOURCE_CONTAINER_LOGS.to_string(),
                crate::config::SOURCE_JOURNAL_LOGS.to_string(),
            ]
        }
        InputKind::Audit => vec![crate::config::SOURCE_HOST_AUDIT_LOGS.to_string()],
        InputKind::Receiver { source: receiver } => vec![receiver.clone()],
    };
    source.push(format!(".log_type = {}", quote(input.kind.log_type())));
    remap(&input.id, &inputs, &source)
}

fn pipeline_transform(pipeline: &PipelineElement) -> String {
    let mut source = vec![format!(".pipeline_name = {}", quote(&pipeline.name))];
    if !pipeline.cluster_id.is_empty() {
        source.push(format!(
            ".openshift.cluster_id = {}",
            quote(&pipeline.cluster_id)
        ));
    }
    remap(&pipeline.id, &pipeline.inputs, &source)
}

fn filter_transform(filter: &FilterElement, previous: &str) -> String {
    match &filter.kind {
        FilterKind::DetectMultilineException => formatdoc! {r#"
            [transforms.{id}]
            type = "detect_exceptions"
            inputs = ["{previous}"]
            languages = ["All"]
            group_by = ["kubernetes.namespace_name", "kubernetes.pod_name", "kubernetes.container_name"]
            expire_after_ms = 2000
            multiline_flush_interval_ms = 1000
            "#,
            id = filter.id,
        },
        FilterKind::ParseJson => remap(&filter.id, &[previous], &[
            "parsed, err = parse_json(.message)".to_string(),
            "if err == null {".to_string(),
            "  .structured = parsed".to_string(),
            "}".to_string(),
        ]),
        FilterKind::Labels(labels) => {
            let entries: Vec<String> = labels
                .iter()
                .map(|(key, value)| format!("{}: {}", quote(key), quote(value)))
                .collect();
            remap(&filter.id, &[previous], &[format!(
                ".openshift.labels = {{{}}}",
                entries.join(", ")
            )])
        }
    }
}

fn sink(output: &OutputElement, inputs: &[&str]) -> String {
    let id = &output.id;
    let mut fragment = String::new();
    let _ = writeln!(fragment, "[sinks.{id}]");

    match &output.sink {
        Sink::Elasticsearch {
            endpoint,
            index,
            version,
        } => {
            let _ = writeln!(fragment, "type = \"elasticsearch\"");
            let _ = writeln!(fragment, "inputs = {}", array(inputs));
            let _ = writeln!(fragment, "endpoints = {}", array(&[&endpoint.url]));
            let _ = writeln!(
                fragment,
                "bulk.index = {}",
                quote(index.as_deref().unwrap_or(DEFAULT_ES_INDEX))
            );
            if let Some(version) = version {
                let _ = writeln!(fragment, "api_version = \"v{version}\"");
            }
        }
        Sink::Cloudwatch {
            region,
            group_by,
            group_prefix,
            endpoint,
        } => {
            let group = match group_by {
                CloudwatchGroupBy::LogType => "{{ log_type }}",
                CloudwatchGroupBy::NamespaceName => "{{ kubernetes.namespace_name }}",
                CloudwatchGroupBy::NamespaceUuid => "{{ kubernetes.namespace_id }}",
            };
            let group_name = match group_prefix.as_deref() {
                Some(prefix) if !prefix.is_empty() => format!("{prefix}.{group}"),
                _ => group.to_string(),
            };
            let _ = writeln!(fragment, "type = \"aws_cloudwatch_logs\"");
            let _ = writeln!(fragment, "inputs = {}", array(inputs));
            let _ = writeln!(fragment, "region = {}", quote(region));
            let _ = writeln!(fragment, "compression = \"none\"");
            let _ = writeln!(fragment, "group_name = {}", quote(&group_name));
            let _ = writeln!(fragment, "stream_name = \"{{{{ hostname }}}}\"");
            let _ = writeln!(fragment, "encoding.codec = \"json\"");
            let _ = writeln!(fragment, "request.concurrency = 2");
            let _ = writeln!(fragment, "healthcheck.enabled = false");
            if !endpoint.is_empty() {
                let _ = writeln!(fragment, "endpoint = {}", quote(endpoint));
            }
        }
        Sink::Syslog { endpoint, settings } => {
            let mode = if endpoint.scheme == "udp" { "udp" } else { "tcp" };
            let _ = writeln!(fragment, "type = \"socket\"");
            let _ = writeln!(fragment, "inputs = {}", array(inputs));
            let _ = writeln!(
                fragment,
                "address = \"{}:{}\"",
                endpoint.host, endpoint.port
            );
            let _ = writeln!(fragment, "mode = \"{mode}\"");
            let _ = writeln!(fragment);
            let _ = writeln!(fragment, "[sinks.{id}.encoding]");
            let _ = writeln!(fragment, "codec = \"syslog\"");
            let _ = writeln!(fragment, "rfc = \"{}\"", settings.rfc);
            let _ = writeln!(
                fragment,
                "facility = {}",
                quote(settings.facility.as_deref().unwrap_or("user"))
            );
            let _ = writeln!(
                fragment,
                "severity = {}",
                quote(settings.severity.as_deref().unwrap_or("informational"))
            );
            for (key, value) in [
                ("app_name", &settings.app_name),
                ("msg_id", &settings.msg_id),
                ("proc_id", &settings.proc_id),
                ("tag", &settings.tag),
                ("payload_key", &settings.payload_key),
            ] {
                if let Some(value) = value.as_deref().filter(|value| !value.is_empty()) {
                    let _ = writeln!(fragment, "{key} = {}", quote(value));
                }
            }
        }
        Sink::Http {
            endpoint,
            method,
            headers,
            timeout_secs,
        } => {
            let _ = writeln!(fragment, "type = \"http\"");
            let _ = writeln!(fragment, "inputs = {}", array(inputs));
            let _ = writeln!(fragment, "uri = {}", quote(&endpoint.url));
            let _ = writeln!(fragment, "method = {}", quote(method));
            let _ = writeln!(fragment);
            let _ = writeln!(fragment, "[sinks.{id}.encoding]");
            let _ = writeln!(fragment, "codec = \"json\"");
            if timeout_secs.is_some() || !headers.is_empty() {
                let _ = writeln!(fragment);
                let _ = writeln!(fragment, "[sinks.{id}.request]");
                if let Some(timeout) = timeout_secs {
                    let _ = writeln!(fragment, "timeout_secs = {timeout}");
                }
                if !headers.is_empty() {
                    let entries: Vec<String> = headers
                        .iter()
                        .map(|(key, value)| format!("{} = {}", quote(key), quote(value)))
                        .collect();
                    let _ = writeln!(fragment, "headers = {{{}}}", entries.join(", "));
                }
            }
        }
    }

    fragment.push_str(&auth_table(id, output.auth.as_ref()));
    fragment.push_str(&tls_table(&output.tls));
    fragment
}

fn auth_table(id: &str, auth: Option<&Auth>) -> String {
    let mut table = String::new();
    match auth {
        Some(Auth::Basic { username, password }) => {
            let _ = writeln!(table, "\n[sinks.{id}.auth]");
            let _ = writeln!(table, "strategy = \"basic\"");
            let _ = writeln!(table, "user = {}", quote(&username.value));
            let _ = writeln!(table, "password = {}", quote(&password.value));
        }
        Some(Auth::Bearer { token }) => {
            let _ = writeln!(table, "\n[sinks.{id}.auth]");
            let _ = writeln!(table, "strategy = \"bearer\"");
            let _ = writeln!(table, "token = {}", quote(&token.value));
        }
        Some(Auth::AwsAccessKey { key_id, secret_key }) => {
            let _ = writeln!(table, "\n[sinks.{id}.auth]");
            let _ = writeln!(table, "access_key_id = {}", quote(&key_id.value));
            let _ = writeln!(table, "secret_access_key = {}", quote(&secret_key.value));
        }
        // picked up from the AWS_* environment of the collector container
        Some(Auth::AwsWebIdentity { .. }) | None => {}
    }
    table
}

fn tls_table(tls: &TlsConfig) -> String {
    let mut table = String::new();
    if !tls.needs_rendering {
        return table;
    }
    let _ = writeln!(table, "\n[{}.{}.tls]", tls.scope, tls.id);
    if let Some(enabled) = tls.enabled {
        let _ = writeln!(table, "enabled = {enabled}");
    }
    if !tls.min_tls_version.is_empty() {
        let _ = writeln!(table, "min_tls_version = {}", quote(&tls.min_tls_version));
    }
    if !tls.cipher_suites.is_empty() {
        let _ = writeln!(table, "ciphersuites = {}", quote(&tls.cipher_suites));
    }
    if tls.insecure_skip_verify {
        let _ = writeln!(table, "verify_certificate = false");
        let _ = writeln!(table, "verify_hostname = false");
    }
    if tls.has_client_certificate() {
        let _ = writeln!(table, "key_file = {}", quote(&tls.key_file));
        let _ = writeln!(table, "crt_file = {}", quote(&tls.cert_file));
    }
    if !tls.ca_file.is_empty() {
        let _ = writeln!(table, "ca_file = {}", quote(&tls.ca_file));
    }
    if !tls.key_passphrase.is_empty() {
        let _ = writeln!(table, "key_pass = {}", quote(&tls.key_passphrase));
    }
    table
}
