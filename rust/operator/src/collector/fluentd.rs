//! Renders the fluentd configuration dialect.
//!
//! Records are routed between `<label>` sections: all sources feed `@INGRESS`, which copies
//! every record to each input label. Inputs select their records and relabel them to their
//! pipelines; pipelines and filters hand over to the next hop until the output labels are
//! reached.

use std::fmt::Write;

use indoc::indoc;
use k8s_openapi::api::core::v1::ResourceRequirements;
use log_forwarder_crd::{output::CloudwatchGroupBy, CollectorType, APP_NAME};

use super::{
    quantities, quote, CollectorStrategy, CredentialDelivery, ROLE_SESSION_NAME,
    WEB_IDENTITY_TOKEN_FILE,
};
use crate::{
    config::{
        Auth, Document, Element, Error, FilterElement, FilterKind, InputElement, InputKind,
        OutputElement, PipelineElement, Sink,
    },
    tls::{openssl_version_name, TlsConfig},
};

pub const FLUENTD_IMAGE: &str = "quay.io/openshift-logging/fluentd:1.16.2";
pub const FLUENTD_CONFIG_DIR: &str = "/etc/fluent/configs.d/user";
pub const FLUENTD_CONFIG_FILE: &str = "fluent.conf";
pub const FLUENTD_DATA_DIR: &str = "/var/lib/fluentd";

const DEFAULT_ES_INDEX: &str = "${log_type}-write";
const INFRASTRUCTURE_NAMESPACES: &str = "/^(default|openshift-.*|kube-.*)$/";

const SYSTEM: &str = indoc! {r##"
    <system>
      log_level "#{ENV['LOG_LEVEL'] || 'warn'}"
    </system>
"##};

const INGRESS_METADATA: &str = indoc! {r##"
    <label @INGRESS>
      <filter kubernetes.**>
        @type kubernetes_metadata
        kubernetes_url "#{ENV['K8S_HOST_URL']}"
        cache_size "#{ENV['K8S_METADATA_CACHE_SIZE'] || '1000'}"
      </filter>
"##};

pub struct FluentdStrategy;

impl CollectorStrategy for FluentdStrategy {
    fn collector_type(&self) -> CollectorType {
        CollectorType::Fluentd
    }

    fn default_image(&self) -> &'static str {
        FLUENTD_IMAGE
    }

    fn image_env_var(&self) -> &'static str {
        "RELATED_IMAGE_FLUENTD"
    }

    fn default_resources(&self) -> ResourceRequirements {
        ResourceRequirements {
            limits: quantities(&[("memory", "736Mi")]),
            requests: quantities(&[("cpu", "100m"), ("memory", "736Mi")]),
            ..ResourceRequirements::default()
        }
    }

    fn credential_delivery(&self) -> CredentialDelivery {
        CredentialDelivery::Configuration
    }

    fn config_dir(&self) -> &'static str {
        FLUENTD_CONFIG_DIR
    }

    fn config_file_name(&self) -> &'static str {
        FLUENTD_CONFIG_FILE
    }

    fn data_dir(&self) -> &'static str {
        FLUENTD_DATA_DIR
    }

    fn command(&self) -> Vec<String> {
        vec![
            "fluentd".to_string(),
            "--no-supervisor".to_string(),
            "-c".to_string(),
            self.config_path(),
        ]
    }

    fn log_level_env_var(&self) -> &'static str {
        "LOG_LEVEL"
    }

    fn preamble(&self, document: &Document) -> String {
        let mut config = String::new();
        let _ = writeln!(
            config,
            "## Generated by {APP_NAME} for {}. Do not edit.",
            document.collector_type
        );
        let _ = writeln!(config);
        config.push_str(SYSTEM);
        let _ = writeln!(config);
        config.push_str(INGRESS_METADATA);
        let inputs: Vec<&str> = document.inputs().map(|input| input.id.as_str()).collect();
        if !inputs.is_empty() {
            let _ = writeln!(config);
            route(&mut config, "**", &inputs);
        }
        let _ = writeln!(config, "</label>");
        config
    }

    fn render_element(&self, element: &Element, document: &Document) -> Result<String, Error> {
        match element {
            Element::ContainerSource => Ok(CONTAINER_SOURCE.to_string()),
            Element::JournalSource => Ok(JOURNAL_SOURCE.to_string()),
            Element::AuditSource => Ok(AUDIT_SOURCE.to_string()),
            Element::HttpReceiver(receiver) => unsupported_receiver(&receiver.input),
            Element::Input(input) => input_label(input, document),
            Element::Pipeline(pipeline) => Ok(pipeline_label(pipeline, document)),
            Element::Filter(filter) => Ok(filter_label(filter, document)),
            Element::Output(output) => output_label(output),
        }
    }
}

fn unsupported_receiver(input: &str) -> Result<String, Error> {
    Err(Error::UnsupportedReceiver {
        collector_type: CollectorType::Fluentd,
        input: input.to_string(),
    })
}

fn label(id: &str) -> String {
    format!("@{}", id.to_uppercase())
}

/// Reads a mounted secret file when fluentd loads its configuration.
fn read_file(path: &str) -> String {
    format!("\"#{{File.read('{path}').strip}}\"")
}

/// Relabels every record matching `pattern` to the given targets.
fn route(fragment: &mut String, pattern: &str, targets: &[&str]) {
    let _ = writeln!(fragment, "  <match {pattern}>");
    match targets {
        [target] => {
            let _ = writeln!(fragment, "    @type relabel");
            let _ = writeln!(fragment, "    @label {}", label(target));
        }
        _ => {
            let _ = writeln!(fragment, "    @type copy");
            let _ = writeln!(fragment, "    copy_mode deep");
            for target in targets {
                let _ = writeln!(fragment, "    <store>");
                let _ = writeln!(fragment, "      @type relabel");
                let _ = writeln!(fragment, "      @label {}", label(target));
                let _ = writeln!(fragment, "    </store>");
            }
        }
    }
    let _ = writeln!(fragment, "  </match>");
}

fn record_filter(fragment: &mut String, pattern: &str, plugin: &str, record: &[String]) {
    let _ = writeln!(fragment, "  <filter {pattern}>");
    let _ = writeln!(fragment, "    @type {plugin}");
    if plugin == "record_transformer" {
        let _ = writeln!(fragment, "    enable_ruby true");
    }
    let _ = writeln!(fragment, "    <record>");
    for line in record {
        let _ = writeln!(fragment, "      {line}");
    }
    let _ = writeln!(fragment, "    </record>");
    let _ = writeln!(fragment, "  </filter>");
}

/// Merges `key => value` into the `openshift` record field.
fn merge_openshift(key: &str, value: &str) -> String {
    format!(
        "openshift ${{(record['openshift'] || {{}}).merge({{{} => {value}}})}}",
        quote(key)
    )
}

const CONTAINER_SOURCE: &str = indoc! {r#"
    <source>
      @type tail
      @id container-input
      @label @INGRESS
      path "/var/log/pods/*/*/*.log"
      exclude_path ["/var/log/pods/*/collector/*.log", "/var/log/pods/*/*/*.gz", "/var/log/pods/*/*/*.tmp"]
      pos_file "/var/lib/fluentd/pos/containers.log.pos"
      refresh_interval 5
      rotate_wait 5
      tag kubernetes.*
      read_from_head "true"
      <parse>
        @type regexp
        expression /^(?<time>[^\s]+) (?<stream>stdout|stderr) (?<logtag>[F|P]) (?<message>.*)$/
        time_key time
        time_format %Y-%m-%dT%H:%M:%S.%N%:z
        keep_time_key true
      </parse>
    </source>
"#};

const JOURNAL_SOURCE: &str = indoc! {r##"
    <source>
      @type systemd
      @id systemd-input
      @label @INGRESS
      path "/var/log/journal"
      <storage>
        @type local
        persistent true
        path "/var/lib/fluentd/pos/journal_pos.json"
      </storage>
      matches "#{ENV['JOURNAL_FILTERS_JSON'] || '[]'}"
      tag journal
      read_from_head "false"
    </source>
"##};

const AUDIT_SOURCE: &str = indoc! {r#"
    <source>
      @type tail
      @id audit-input
      @label @INGRESS
      path "/var/log/audit/audit.log"
      pos_file "/var/lib/fluentd/pos/audit.log.pos"
      tag linux-audit.log
      <parse>
        @type viaq_host_audit
      </parse>
    </source>
"#};

fn input_label(input: &InputElement, document: &Document) -> Result<String, Error> {
    let pattern = match &input.kind {
        InputKind::Application { .. } => "kubernetes.**",
        InputKind::Infrastructure => "kubernetes.** journal",
        InputKind::Audit => "linux-audit.log",
        InputKind::Receiver { .. } => return unsupported_receiver(&input.name),
    };

    let mut fragment = String::new();
    let _ = writeln!(fragment, "<label {}>", label(&input.id));

    let namespace_filter = match &input.kind {
        InputKind::Application { namespaces } if namespaces.is_empty() => {
            Some(("exclude", INFRASTRUCTURE_NAMESPACES.to_string()))
        }
        InputKind::Application { namespaces } => {
            let escaped: Vec<String> = namespaces
                .iter()
                .map(|namespace| regex::escape(namespace))
                .collect();
            Some(("regexp", format!("/^({})$/", escaped.join("|"))))
        }
        InputKind::Infrastructure => Some(("regexp", INFRASTRUCTURE_NAMESPACES.to_string())),
        InputKind::Audit | InputKind::Receiver { .. } => None,
    };
    if let Some((directive, namespaces)) = namespace_filter {
        let _ = writeln!(fragment, "  <filter kubernetes.**>");
        let _ = writeln!(fragment, "    @type grep");
        let _ = writeln!(fragment, "    <{directive}>");
        let _ = writeln!(fragment, "      key $.kubernetes.namespace_name");
        let _ = writeln!(fragment, "      pattern {namespaces}");
        let _ = writeln!(fragment, "    </{directive}>");
        let _ = writeln!(fragment, "  </filter>");
        let _ = writeln!(fragment);
    }

    record_filter(&mut fragment, pattern, "record_modifier", &[format!(
        "log_type {}",
        input.kind.log_type()
    )]);
    let _ = writeln!(fragment);
    route(&mut fragment, pattern, &document.pipelines_reading(&input.id));
    let _ = writeln!(fragment);
    let _ = writeln!(fragment, "  <match **>");
    let _ = writeln!(fragment, "    @type null");
    let _ = writeln!(fragment, "  </match>");
    let _ = writeln!(fragment, "</label>");
    Ok(fragment)
}

fn pipeline_label(pipeline: &PipelineElement, document: &Document) -> String {
    let mut fragment = String::new();
    let _ = writeln!(fragment, "<label {}>", label(&pipeline.id));
    record_filter(&mut fragment, "**", "record_modifier", &[format!(
        "pipeline_name {}",
        pipeline.name
    )]);
    let _ = writeln!(fragment);
    if !pipeline.cluster_id.is_empty() {
        record_filter(&mut fragment, "**", "record_transformer", &[merge_openshift(
            "cluster_id",
            &quote(&pipeline.cluster_id),
        )]);
        let _ = writeln!(fragment);
    }
    route(
        &mut fragment,
        "**",
        &document.next_hops(&pipeline.id, &pipeline.id),
    );
    let _ = writeln!(fragment, "</label>");
    fragment
}

const DETECT_EXCEPTIONS: &str = indoc! {"
    <match kubernetes.**>
      @type detect_exceptions
      remove_tag_prefix kubernetes
      message message
      languages all
      multiline_flush_interval .2
      max_bytes 500000
      max_lines 1000
    </match>
"};

const PARSE_JSON: &str = indoc! {"
    <filter **>
      @type parser
      key_name message
      reserve_data true
      hash_value_field structured
      emit_invalid_record_to_error false
      <parse>
        @type json
        json_parser oj
      </parse>
    </filter>
"};

/// Appends a directive block inside the current `<label>`.
fn nested(fragment: &mut String, block: &str) {
    for line in block.lines() {
        let _ = writeln!(fragment, "  {line}");
    }
}

fn filter_label(filter: &FilterElement, document: &Document) -> String {
    let mut fragment = String::new();
    let _ = writeln!(fragment, "<label {}>", label(&filter.id));
    match &filter.kind {
        FilterKind::DetectMultilineException => {
            // Re-emitted records lose the prefix and fall through to the route below.
            nested(&mut fragment, DETECT_EXCEPTIONS);
        }
        FilterKind::ParseJson => {
            nested(&mut fragment, PARSE_JSON);
        }
        FilterKind::Labels(labels) => {
            let entries: Vec<String> = labels
                .iter()
                .map(|(key, value)| format!("{} => {}", quote(key), quote(value)))
                .collect();
            record_filter(&mut fragment, "**", "record_transformer", &[merge_openshift(
                "labels",
                &format!("{{{}}}", entries.join(", ")),
            )]);
        }
    }
    let _ = writeln!(fragment);
    route(
        &mut fragment,
        "**",
        &document.next_hops(&filter.pipeline, &filter.id),
    );
    let _ = writeln!(fragment, "</label>");
    fragment
}

fn output_label(output: &OutputElement) -> Result<String, Error> {
    let id = &output.id;
    let mut fragment = String::new();
    let _ = writeln!(fragment, "<label {}>", label(id));

    match &output.sink {
        Sink::Elasticsearch {
            endpoint,
            index,
            version,
        } => {
            let _ = writeln!(fragment, "  <match **>");
            let _ = writeln!(fragment, "    @type elasticsearch");
            let _ = writeln!(fragment, "    @id {id}");
            let _ = writeln!(fragment, "    host {}", endpoint.host);
            let _ = writeln!(fragment, "    port {}", endpoint.port);
            let _ = writeln!(fragment, "    scheme {}", endpoint.scheme);
            let _ = writeln!(
                fragment,
                "    index_name {}",
                index.as_deref().unwrap_or(DEFAULT_ES_INDEX)
            );
            let _ = writeln!(fragment, "    verify_es_version_at_startup false");
            if let Some(version) = version {
                let _ = writeln!(fragment, "    default_elasticsearch_version {version}");
            }
            auth_lines(&mut fragment, output.auth.as_ref());
            elasticsearch_tls_lines(&mut fragment, &output.tls);
            let chunk_keys = if index.is_none() { " log_type" } else { "" };
            buffer(&mut fragment, id, chunk_keys);
            let _ = writeln!(fragment, "  </match>");
        }
        Sink::Cloudwatch {
            region,
            group_by,
            group_prefix,
            endpoint,
        } => {
            let group = match group_by {
                CloudwatchGroupBy::LogType => "${record['log_type']}",
                CloudwatchGroupBy::NamespaceName => {
                    "${record.dig('kubernetes', 'namespace_name')}"
                }
                CloudwatchGroupBy::NamespaceUuid => "${record.dig('kubernetes', 'namespace_id')}",
            };
            let group_name = match group_prefix.as_deref() {
                Some(prefix) if !prefix.is_empty() => format!("{prefix}.{group}"),
                _ => group.to_string(),
            };
            record_filter(&mut fragment, "**", "record_transformer", &[
                format!("cw_group_name {group_name}"),
                "cw_stream_name ${tag}".to_string(),
            ]);
            let _ = writeln!(fragment);
            let _ = writeln!(fragment, "  <match **>");
            let _ = writeln!(fragment, "    @type cloudwatch_logs");
            let _ = writeln!(fragment, "    @id {id}");
            let _ = writeln!(fragment, "    auto_create_stream true");
            let _ = writeln!(fragment, "    region {region}");
            let _ = writeln!(fragment, "    log_group_name_key cw_group_name");
            let _ = writeln!(fragment, "    log_stream_name_key cw_stream_name");
            let _ = writeln!(fragment, "    remove_log_group_name_key true");
            let _ = writeln!(fragment, "    remove_log_stream_name_key true");
            let _ = writeln!(fragment, "    concurrency 2");
            if !endpoint.is_empty() {
                let _ = writeln!(fragment, "    endpoint {endpoint}");
            }
            auth_lines(&mut fragment, output.auth.as_ref());
            let _ = writeln!(fragment, "    include_time_key true");
            let _ = writeln!(fragment, "    log_rejected_request true");
            buffer(&mut fragment, id, "");
            let _ = writeln!(fragment, "  </match>");
        }
        Sink::Syslog { endpoint, settings } => {
            let protocol = if endpoint.scheme == "udp" { "udp" } else { "tcp" };
            let _ = writeln!(fragment, "  <match **>");
            let _ = writeln!(fragment, "    @type remote_syslog");
            let _ = writeln!(fragment, "    @id {id}");
            let _ = writeln!(fragment, "    host {}", endpoint.host);
            let _ = writeln!(fragment, "    port {}", endpoint.port);
            let _ = writeln!(fragment, "    rfc {}", settings.rfc);
            let _ = writeln!(
                fragment,
                "    facility {}",
                settings.facility.as_deref().unwrap_or("user")
            );
            let _ = writeln!(
                fragment,
                "    severity {}",
                settings.severity.as_deref().unwrap_or("informational")
            );
            for (key, value) in [
                ("appname", &settings.app_name),
                ("msgid", &settings.msg_id),
                ("procid", &settings.proc_id),
                ("program", &settings.tag),
                ("payload_key", &settings.payload_key),
            ] {
                if let Some(value) = value.as_deref().filter(|value| !value.is_empty()) {
                    let _ = writeln!(fragment, "    {key} {value}");
                }
            }
            let _ = writeln!(fragment, "    protocol {protocol}");
            let _ = writeln!(fragment, "    packet_size 4096");
            let _ = writeln!(fragment, "    hostname \"#{{ENV['NODE_NAME']}}\"");
            if endpoint.scheme == "tls" {
                let _ = writeln!(fragment, "    tls true");
                syslog_tls_lines(&mut fragment, &output.tls);
            }
            if protocol == "tcp" {
                let _ = writeln!(fragment, "    timeout 60");
                let _ = writeln!(fragment, "    timeout_exception true");
                let _ = writeln!(fragment, "    keep_alive true");
                let _ = writeln!(fragment, "    keep_alive_idle 75");
                let _ = writeln!(fragment, "    keep_alive_cnt 9");
                let _ = writeln!(fragment, "    keep_alive_intvl 7200");
            }
            let _ = writeln!(fragment, "    <format>");
            let _ = writeln!(fragment, "      @type json");
            let _ = writeln!(fragment, "    </format>");
            buffer(&mut fragment, id, "");
            let _ = writeln!(fragment, "  </match>");
        }
        Sink::Http { .. } => {
            return Err(Error::UnsupportedOutput {
                collector_type: CollectorType::Fluentd,
                output: output.name.clone(),
                type_: output.output_type(),
            })
        }
    }

    let _ = writeln!(fragment, "</label>");
    Ok(fragment)
}

fn auth_lines(fragment: &mut String, auth: Option<&Auth>) {
    match auth {
        Some(Auth::Basic { username, password }) => {
            let _ = writeln!(fragment, "    user {}", read_file(&username.path));
            let _ = writeln!(fragment, "    password {}", read_file(&password.path));
        }
        Some(Auth::AwsAccessKey { key_id, secret_key }) => {
            let _ = writeln!(fragment, "    aws_key_id {}", read_file(&key_id.path));
            let _ = writeln!(fragment, "    aws_sec_key {}", read_file(&secret_key.path));
        }
        Some(Auth::AwsWebIdentity { role_arn }) => {
            let _ = writeln!(fragment, "    <web_identity_credentials>");
            let _ = writeln!(fragment, "      role_arn {}", quote(role_arn));
            let _ = writeln!(
                fragment,
                "      web_identity_token_file {}",
                quote(WEB_IDENTITY_TOKEN_FILE)
            );
            let _ = writeln!(
                fragment,
                "      role_session_name {}",
                quote(ROLE_SESSION_NAME)
            );
            let _ = writeln!(fragment, "    </web_identity_credentials>");
        }
        // only reachable for http outputs, which fluentd cannot render
        Some(Auth::Bearer { .. }) | None => {}
    }
}

fn elasticsearch_tls_lines(fragment: &mut String, tls: &TlsConfig) {
    if !tls.needs_rendering {
        return;
    }
    if !tls.min_tls_version.is_empty() {
        let _ = writeln!(
            fragment,
            "    ssl_min_version {}",
            openssl_version_name(&tls.min_tls_version)
        );
    }
    if tls.has_client_certificate() {
        let _ = writeln!(fragment, "    client_key '{}'", tls.key_file);
        let _ = writeln!(fragment, "    client_cert '{}'", tls.cert_file);
    }
    if !tls.key_passphrase.is_empty() {
        let _ = writeln!(fragment, "    client_key_pass {}", quote(&tls.key_passphrase));
    }
    if !tls.ca_file.is_empty() {
        let _ = writeln!(fragment, "    ca_file '{}'", tls.ca_file);
    }
    if tls.insecure_skip_verify {
        let _ = writeln!(fragment, "    ssl_verify false");
    }
}

fn syslog_tls_lines(fragment: &mut String, tls: &TlsConfig) {
    if !tls.needs_rendering {
        return;
    }
    if !tls.ca_file.is_empty() {
        let _ = writeln!(fragment, "    ca_file '{}'", tls.ca_file);
    }
    if tls.has_client_certificate() {
        let _ = writeln!(fragment, "    client_cert '{}'", tls.cert_file);
        let _ = writeln!(fragment, "    client_cert_key '{}'", tls.key_file);
    }
    if !tls.key_passphrase.is_empty() {
        let _ = writeln!(
            fragment,
            "    client_cert_key_password {}",
            quote(&tls.key_passphrase)
        );
    }
    if tls.insecure_skip_verify {
        let _ = writeln!(fragment, "    verify_mode 0");
    }
}

fn buffer(fragment: &mut String, id: &str, chunk_keys: &str) {
    let _ = writeln!(fragment, "    <buffer{chunk_keys}>");
    let _ = writeln!(fragment, "      @type file");
    let _ = writeln!(fragment, "      path '{FLUENTD_DATA_DIR}/{id}'");
    let _ = writeln!(fragment, "      flush_mode interval");
    let _ = writeln!(fragment, "      flush_interval 1s");
    let _ = writeln!(fragment, "      flush_thread_count 2");
    let _ = writeln!(fragment, "      retry_type exponential_backoff");
    let _ = writeln!(fragment, "      retry_wait 1s");
    let _ = writeln!(fragment, "      retry_max_interval 60s");
    let _ = writeln!(fragment, "      retry_timeout 60m");
    let _ = writeln!(fragment, "      chunk_limit_size 8m");
    let _ = writeln!(fragment, "      overflow_action block");
    let _ = writeln!(fragment, "    </buffer>");
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use log_forwarder_crd::TlsSecurityProfile;

    use super::*;
    use crate::{
        cluster::ClusterInfo,
        config::{compile, tests::spec},
        secrets::{
            tests::{secret, ROLE_ARN},
            OutputSecrets,
        },
    };

    /// Drops indentation so that snippets can be matched independently of their nesting.
    fn trimmed(text: &str) -> String {
        text.lines().map(str::trim).collect::<Vec<_>>().join("\n")
    }

    fn contains(config: &str, snippet: &str) -> bool {
        trimmed(config).contains(&trimmed(snippet))
    }

    #[test]
    fn test_audit_to_elasticsearch() {
        let input = indoc! {"
            apiVersion: logging.forwarder.dev/v1
            kind: LogForwarder
            metadata:
              name: instance
            spec:
              pipelines:
                - name: audit-logs
                  inputRefs: [audit]
                  outputRefs: [es]
              outputs:
                - name: es
                  type: elasticsearch
                  url: http://es.svc:9200
        "};
        let config = compile(
            &spec(input),
            CollectorType::Fluentd,
            &OutputSecrets::new(),
            &ClusterInfo::default(),
        )
        .expect("valid forwarder");

        assert_eq!(config, indoc! {r##"
            ## Generated by log-forwarder for fluentd. Do not edit.

            <system>
              log_level "#{ENV['LOG_LEVEL'] || 'warn'}"
            </system>

            <label @INGRESS>
              <filter kubernetes.**>
                @type kubernetes_metadata
                kubernetes_url "#{ENV['K8S_HOST_URL']}"
                cache_size "#{ENV['K8S_METADATA_CACHE_SIZE'] || '1000'}"
              </filter>

              <match **>
                @type relabel
                @label @INPUT_AUDIT
              </match>
            </label>

            <source>
              @type tail
              @id audit-input
              @label @INGRESS
              path "/var/log/audit/audit.log"
              pos_file "/var/lib/fluentd/pos/audit.log.pos"
              tag linux-audit.log
              <parse>
                @type viaq_host_audit
              </parse>
            </source>

            <label @INPUT_AUDIT>
              <filter linux-audit.log>
                @type record_modifier
                <record>
                  log_type audit
                </record>
              </filter>

              <match linux-audit.log>
                @type relabel
                @label @PIPELINE_AUDIT_LOGS
              </match>

              <match **>
                @type null
              </match>
            </label>

            <label @PIPELINE_AUDIT_LOGS>
              <filter **>
                @type record_modifier
                <record>
                  pipeline_name audit-logs
                </record>
              </filter>

              <match **>
                @type relabel
                @label @OUTPUT_ES
              </match>
            </label>

            <label @OUTPUT_ES>
              <match **>
                @type elasticsearch
                @id output_es
                host es.svc
                port 9200
                scheme http
                index_name ${log_type}-write
                verify_es_version_at_startup false
                <buffer log_type>
                  @type file
                  path '/var/lib/fluentd/output_es'
                  flush_mode interval
                  flush_interval 1s
                  flush_thread_count 2
                  retry_type exponential_backoff
                  retry_wait 1s
                  retry_max_interval 60s
                  retry_timeout 60m
                  chunk_limit_size 8m
                  overflow_action block
                </buffer>
              </match>
            </label>
        "##});
    }

    #[test]
    fn test_applications_through_filters_to_two_outputs() {
        let input = indoc! {"
            apiVersion: logging.forwarder.dev/v1
            kind: LogForwarder
            metadata:
              name: instance
            spec:
              inputs:
                - name: shop
                  application:
                    namespaces: [payments, web]
              filters:
                - name: multiline
                  type: detectMultilineException
                - name: team
                  type: labels
                  labels:
                    team: shop
              pipelines:
                - name: shop
                  inputRefs: [shop]
                  outputRefs: [es, cw]
                  filterRefs: [multiline, team]
              outputs:
                - name: es
                  type: elasticsearch
                  url: https://es.svc:9200
                  secret:
                    name: es-secret
                  tls:
                    ca:
                      configMapName: es-ca
                      key: ca.crt
                    insecureSkipVerify: true
                  elasticsearch:
                    index: shop-logs
                - name: cw
                  type: cloudwatch
                  cloudwatch:
                    region: us-east-77
                  secret:
                    name: cw-secret
        "};
        let secrets = OutputSecrets::from([
            (
                "es".to_string(),
                secret("es-secret", &[("username", "admin"), ("password", "pa55")]),
            ),
            ("cw".to_string(), secret("cw-secret", &[("role_arn", ROLE_ARN)])),
        ]);
        let cluster = ClusterInfo {
            cluster_id: "abc".to_string(),
            tls_security_profile: TlsSecurityProfile {
                min_tls_version: Some("VersionTLS12".to_string()),
                ciphers: vec![],
            },
            ..ClusterInfo::default()
        };

        let config = compile(&spec(input), CollectorType::Fluentd, &secrets, &cluster)
            .expect("valid forwarder");

        assert!(contains(&config, indoc! {"
            <label @INPUT_SHOP>
              <filter kubernetes.**>
                @type grep
                <regexp>
                  key $.kubernetes.namespace_name
                  pattern /^(payments|web)$/
                </regexp>
              </filter>
        "}));
        assert!(contains(&config, indoc! {r#"
            <label @PIPELINE_SHOP>
              <filter **>
                @type record_modifier
                <record>
                  pipeline_name shop
                </record>
              </filter>

              <filter **>
                @type record_transformer
                enable_ruby true
                <record>
                  openshift ${(record['openshift'] || {}).merge({"cluster_id" => "abc"})}
                </record>
              </filter>

              <match **>
                @type relabel
                @label @PIPELINE_SHOP_MULTILINE
              </match>
            </label>
        "#}));
        assert!(contains(&config, indoc! {r#"
            <label @PIPELINE_SHOP_TEAM>
              <filter **>
                @type record_transformer
                enable_ruby true
                <record>
                  openshift ${(record['openshift'] || {}).merge({"labels" => {"team" => "shop"}})}
                </record>
              </filter>

              <match **>
                @type copy
                copy_mode deep
                <store>
                  @type relabel
                  @label @OUTPUT_ES
                </store>
                <store>
                  @type relabel
                  @label @OUTPUT_CW
                </store>
              </match>
            </label>
        "#}));
        assert!(contains(&config, indoc! {r##"
                index_name shop-logs
                verify_es_version_at_startup false
                user "#{File.read('/var/run/ocp-collector/secrets/es-secret/username').strip}"
                password "#{File.read('/var/run/ocp-collector/secrets/es-secret/password').strip}"
                ssl_min_version TLSv1_2
                ca_file '/var/run/ocp-collector/config/es-ca/ca.crt'
                ssl_verify false
                <buffer>
        "##}));
        assert!(contains(&config, indoc! {r#"
                concurrency 2
                <web_identity_credentials>
                  role_arn "arn:aws:iam::123456789012:role/my-role-to-assume"
                  web_identity_token_file "/var/run/ocp-collector/serviceaccount/token"
                  role_session_name "cluster-logging"
                </web_identity_credentials>
                include_time_key true
        "#}));
    }

    #[test]
    fn test_syslog() {
        let input = indoc! {"
            apiVersion: logging.forwarder.dev/v1
            kind: LogForwarder
            metadata:
              name: instance
            spec:
              pipelines:
                - inputRefs: [infrastructure]
                  outputRefs: [secure, plain]
              outputs:
                - name: secure
                  type: syslog
                  url: tls://syslog.example.com:6514
                  syslog:
                    appName: myapp
                  tls:
                    insecureSkipVerify: true
                - name: plain
                  type: syslog
                  url: udp://syslog.example.com
        "};
        let config = compile(
            &spec(input),
            CollectorType::Fluentd,
            &OutputSecrets::new(),
            &ClusterInfo::default(),
        )
        .expect("valid forwarder");

        assert!(contains(&config, indoc! {r##"
                @type remote_syslog
                @id output_secure
                host syslog.example.com
                port 6514
                rfc rfc5424
                facility user
                severity informational
                appname myapp
                protocol tcp
                packet_size 4096
                hostname "#{ENV['NODE_NAME']}"
                tls true
                verify_mode 0
                timeout 60
        "##}));
        assert!(contains(&config, indoc! {r##"
                port 514
                rfc rfc5424
                facility user
                severity informational
                protocol udp
                packet_size 4096
                hostname "#{ENV['NODE_NAME']}"
                <format>
        "##}));
        assert!(config.contains("<match kubernetes.** journal>"));
        assert!(config.contains("@type systemd"));
    }

    #[test]
    fn test_unsupported_elements() {
        let http = indoc! {"
            apiVersion: logging.forwarder.dev/v1
            kind: LogForwarder
            metadata:
              name: instance
            spec:
              pipelines:
                - inputRefs: [application]
                  outputRefs: [collector]
              outputs:
                - name: collector
                  type: http
                  url: https://collector.example.com
        "};
        let result = compile(
            &spec(http),
            CollectorType::Fluentd,
            &OutputSecrets::new(),
            &ClusterInfo::default(),
        );
        assert!(matches!(
            result,
            Err(Error::UnsupportedOutput { output, .. }) if output == "collector"
        ));

        let receiver = indoc! {"
            apiVersion: logging.forwarder.dev/v1
            kind: LogForwarder
            metadata:
              name: instance
            spec:
              inputs:
                - name: webhook
                  receiver:
                    port: 8443
              pipelines:
                - inputRefs: [webhook]
                  outputRefs: [es]
              outputs:
                - name: es
                  type: elasticsearch
                  url: https://es.svc:9200
        "};
        let result = compile(
            &spec(receiver),
            CollectorType::Fluentd,
            &OutputSecrets::new(),
            &ClusterInfo::default(),
        );
        assert!(matches!(
            result,
            Err(Error::UnsupportedReceiver { input, .. }) if input == "webhook"
        ));
    }
}
