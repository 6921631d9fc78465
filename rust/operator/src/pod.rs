//! Builds the pod of the collector workload.
//!
//! The pod is assembled by a fixed sequence of passes. Each pass takes the pod built so far and
//! returns an enriched copy; later passes may append to what earlier ones produced.

use std::{
    collections::{BTreeMap, BTreeSet},
    hash::Hasher,
};

use fnv::FnvHasher;

use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource,
    EnvVar, EnvVarSource, HostPathVolumeSource, KeyToPath, ObjectFieldSelector, PodSpec,
    ProjectedVolumeSource, SELinuxOptions, SeccompProfile, SecretVolumeSource, SecurityContext,
    ServiceAccountTokenProjection, Toleration, Volume, VolumeMount, VolumeProjection,
};
use log_forwarder_crd::{CollectorType, ConfigMapOrSecretKey, LogForwarderSpec, OutputTlsSpec};

use crate::{
    cluster::{ClusterInfo, OperatorConfig},
    collector::{
        self, CredentialDelivery, ROLE_SESSION_NAME, WEB_IDENTITY_TOKEN_DIR,
        WEB_IDENTITY_TOKEN_FILE, WEB_IDENTITY_TOKEN_FILE_NAME,
    },
    config::{Document, Element},
    secrets::{self, CredentialShape, OutputSecrets, CONFIG_MAPS_MOUNT_ROOT, SECRETS_MOUNT_ROOT},
};

pub const CONTAINER_NAME: &str = "collector";
pub const PRIORITY_CLASS_NAME: &str = "system-node-critical";
pub const METRICS_PORT: i32 = 24231;
pub const METRICS_PORT_NAME: &str = "metrics";

/// Volume names are DNS-1123 labels.
const MAX_VOLUME_NAME_LEN: usize = 63;

const CONFIG_VOLUME: &str = "config";
const DATA_VOLUME: &str = "datadir";
const TMP_VOLUME: &str = "tmp";
/// Host log directories, mounted read-only under the same path.
const LOG_VOLUMES: [(&str, &str); 3] = [
    ("varlogpods", "/var/log/pods"),
    ("varlogjournal", "/var/log/journal"),
    ("varlogaudit", "/var/log/audit"),
];

pub const TRUSTED_CA_BUNDLE_NAME: &str = "collector-trusted-ca-bundle";
pub const TRUSTED_CA_BUNDLE_KEY: &str = "ca-bundle.crt";
pub const TRUSTED_CA_BUNDLE_PATH: &str = "tls-ca-bundle.pem";
pub const TRUSTED_CA_BUNDLE_MOUNT_PATH: &str = "/etc/pki/ca-trust/extracted/pem/";

/// Prepended to the cluster `NO_PROXY` list.
pub const NO_PROXY_PREFIX: &str = "elasticsearch";

pub const SA_TOKEN_VOLUME: &str = "bound-sa-token";
pub const SA_TOKEN_AUDIENCE: &str = "openshift";
pub const SA_TOKEN_EXPIRATION_SECONDS: i64 = 3600;

pub const AWS_REGION_ENV: &str = "AWS_REGION";
pub const AWS_ROLE_ARN_ENV: &str = "AWS_ROLE_ARN";
pub const AWS_ROLE_SESSION_NAME_ENV: &str = "AWS_ROLE_SESSION_NAME";
pub const AWS_WEB_IDENTITY_TOKEN_FILE_ENV: &str = "AWS_WEB_IDENTITY_TOKEN_FILE";

const DROPPED_CAPABILITIES: [&str; 9] = [
    "CHOWN",
    "DAC_OVERRIDE",
    "FOWNER",
    "FSETID",
    "KILL",
    "NET_BIND_SERVICE",
    "SETGID",
    "SETPCAP",
    "SETUID",
];

/// Scheduling defaults every collector pod starts from.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkloadDefaults {
    pub tolerations: Vec<Toleration>,
    pub node_selector: BTreeMap<String, String>,
}

impl Default for WorkloadDefaults {
    fn default() -> Self {
        let no_schedule = |key: &str| Toleration {
            key: Some(key.to_string()),
            operator: Some("Exists".to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Toleration::default()
        };
        Self {
            tolerations: vec![
                no_schedule("node-role.kubernetes.io/master"),
                no_schedule("node.kubernetes.io/disk-pressure"),
            ],
            node_selector: BTreeMap::from([(
                "kubernetes.io/os".to_string(),
                "linux".to_string(),
            )]),
        }
    }
}

/// Everything a pass may read. Nothing in here is modified during assembly.
pub struct AssemblyContext<'a> {
    /// Name of the config map holding the rendered collector configuration.
    pub config_map_name: &'a str,
    pub spec: &'a LogForwarderSpec,
    pub collector_type: CollectorType,
    /// The compiled forwarder. Only compiled outputs and receivers contribute to the pod.
    pub document: &'a Document,
    pub secrets: &'a OutputSecrets,
    pub trusted_ca_bundle: Option<&'a ConfigMap>,
    pub cluster: &'a ClusterInfo,
    pub config: &'a OperatorConfig,
}

type Pass = fn(PodSpec, &AssemblyContext) -> PodSpec;

/// Resources are settled before scheduling, and scheduling before any environment enrichment.
const PASSES: [Pass; 7] = [
    base_container,
    output_volumes,
    resources,
    scheduling,
    proxy,
    trusted_ca_bundle,
    federated_credentials,
];

pub fn build_pod_spec(ctx: &AssemblyContext) -> PodSpec {
    let pod = PASSES
        .iter()
        .fold(PodSpec::default(), |pod, pass| pass(pod, ctx));
    tracing::debug!(
        collector = %ctx.collector_type,
        volumes = pod.volumes.as_ref().map_or(0, Vec::len),
        "Assembled collector pod"
    );
    pod
}

fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..EnvVar::default()
    }
}

fn field_env_var(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: Some("v1".to_string()),
                field_path: field_path.to_string(),
            }),
            ..EnvVarSource::default()
        }),
        ..EnvVar::default()
    }
}

fn volume_mount(name: &str, mount_path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: mount_path.to_string(),
        read_only: read_only.then_some(true),
        ..VolumeMount::default()
    }
}

fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            ..HostPathVolumeSource::default()
        }),
        ..Volume::default()
    }
}

fn config_map_volume(name: &str, config_map_name: &str, items: Option<Vec<KeyToPath>>) -> Volume {
    Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map_name.to_string(),
            items,
            ..ConfigMapVolumeSource::default()
        }),
        ..Volume::default()
    }
}

/// Applies `update` to the collector container of the pod.
fn with_collector(mut pod: PodSpec, update: impl FnOnce(&mut Container)) -> PodSpec {
    if let Some(container) = pod
        .containers
        .iter_mut()
        .find(|container| container.name == CONTAINER_NAME)
    {
        update(container);
    }
    pod
}

fn add_env(pod: PodSpec, vars: Vec<EnvVar>) -> PodSpec {
    if vars.is_empty() {
        return pod;
    }
    with_collector(pod, |container| {
        container.env.get_or_insert_with(Vec::new).extend(vars)
    })
}

fn add_volume(mut pod: PodSpec, volume: Volume, mount: VolumeMount) -> PodSpec {
    pod.volumes.get_or_insert_with(Vec::new).push(volume);
    with_collector(pod, |container| {
        container
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(mount)
    })
}

fn base_container(mut pod: PodSpec, ctx: &AssemblyContext) -> PodSpec {
    let strategy = collector::strategy(ctx.collector_type);

    let mut env = vec![
        field_env_var("POD_IP", "status.podIP"),
        field_env_var("NODE_NAME", "spec.nodeName"),
        env_var(strategy.log_level_env_var(), strategy.log_level()),
    ];
    if !ctx.cluster.cluster_id.is_empty() {
        env.push(env_var("CLUSTER_ID", &ctx.cluster.cluster_id));
    }
    if !ctx.cluster.schema_version.is_empty() {
        env.push(env_var("SCHEMA_VERSION", &ctx.cluster.schema_version));
    }

    let mut ports = vec![ContainerPort {
        name: Some(METRICS_PORT_NAME.to_string()),
        container_port: METRICS_PORT,
        protocol: Some("TCP".to_string()),
        ..ContainerPort::default()
    }];
    for element in &ctx.document.elements {
        if let Element::HttpReceiver(receiver) = element {
            ports.push(ContainerPort {
                container_port: i32::from(receiver.port),
                protocol: Some("TCP".to_string()),
                ..ContainerPort::default()
            });
        }
    }

    let mut volume_mounts = vec![
        volume_mount(CONFIG_VOLUME, strategy.config_dir(), true),
        volume_mount(DATA_VOLUME, strategy.data_dir(), false),
        volume_mount(TMP_VOLUME, "/tmp", false),
    ];
    let mut volumes = vec![
        config_map_volume(CONFIG_VOLUME, ctx.config_map_name, None),
        host_path_volume(DATA_VOLUME, strategy.data_dir()),
        Volume {
            name: TMP_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Volume::default()
        },
    ];
    for (name, path) in LOG_VOLUMES {
        volume_mounts.push(volume_mount(name, path, true));
        volumes.push(host_path_volume(name, path));
    }

    pod.containers.push(Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(ctx.config.image(ctx.collector_type).to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(strategy.command()),
        env: Some(env),
        ports: Some(ports),
        volume_mounts: Some(volume_mounts),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            read_only_root_filesystem: Some(true),
            capabilities: Some(Capabilities {
                drop: Some(DROPPED_CAPABILITIES.map(str::to_string).to_vec()),
                ..Capabilities::default()
            }),
            se_linux_options: Some(SELinuxOptions {
                type_: Some("spc_t".to_string()),
                ..SELinuxOptions::default()
            }),
            seccomp_profile: Some(SeccompProfile {
                type_: "RuntimeDefault".to_string(),
                ..SeccompProfile::default()
            }),
            ..SecurityContext::default()
        }),
        ..Container::default()
    });
    pod.volumes = Some(volumes);
    pod.priority_class_name = Some(PRIORITY_CLASS_NAME.to_string());
    pod
}

#[derive(Default)]
struct MountedObjects {
    secrets: BTreeSet<String>,
    config_maps: BTreeSet<String>,
}

impl MountedObjects {
    fn add_secret(&mut self, name: &str) {
        if !name.is_empty() {
            self.secrets.insert(name.to_string());
        }
    }

    fn add_key(&mut self, reference: Option<&ConfigMapOrSecretKey>) {
        let Some(reference) = reference else {
            return;
        };
        match (&reference.secret_name, &reference.config_map_name) {
            (Some(secret_name), _) if !secret_name.is_empty() => self.add_secret(secret_name),
            (_, Some(config_map_name)) if !config_map_name.is_empty() => {
                self.config_maps.insert(config_map_name.clone());
            }
            _ => {}
        }
    }

    fn add_tls(&mut self, tls: Option<&OutputTlsSpec>) {
        let Some(tls) = tls else {
            return;
        };
        self.add_key(tls.ca.as_ref());
        self.add_key(tls.certificate.as_ref());
        for key in [&tls.key, &tls.key_passphrase].into_iter().flatten() {
            self.add_secret(&key.secret_name);
        }
    }
}

/// Mounts the secrets and config maps referenced by compiled outputs and receivers at the
/// paths the rendered configuration points to.
fn output_volumes(mut pod: PodSpec, ctx: &AssemblyContext) -> PodSpec {
    let mut objects = MountedObjects::default();
    for element in &ctx.document.elements {
        match element {
            Element::Output(output) => {
                if let Some(spec) = ctx.spec.output(&output.name) {
                    objects.add_secret(spec.secret_name().unwrap_or_default());
                    objects.add_tls(spec.tls.as_ref());
                }
            }
            Element::HttpReceiver(receiver) => {
                if let Some(receiver) = ctx
                    .spec
                    .input(&receiver.input)
                    .and_then(|input| input.receiver)
                {
                    objects.add_tls(receiver.tls.as_ref());
                }
            }
            _ => {}
        }
    }

    for name in &objects.secrets {
        let volume_name = volume_name("secret", name);
        pod = add_volume(
            pod,
            Volume {
                name: volume_name.clone(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(name.clone()),
                    ..SecretVolumeSource::default()
                }),
                ..Volume::default()
            },
            volume_mount(&volume_name, &format!("{SECRETS_MOUNT_ROOT}/{name}"), true),
        );
    }
    for name in &objects.config_maps {
        let volume_name = volume_name("configmap", name);
        pod = add_volume(
            pod,
            config_map_volume(&volume_name, name, None),
            volume_mount(
                &volume_name,
                &format!("{CONFIG_MAPS_MOUNT_ROOT}/{name}"),
                true,
            ),
        );
    }
    pod
}

/// Names the volume of a mounted object. Object names may contain dots and run up to 253
/// characters, so any name that is not already a valid label gets its invalid characters
/// replaced and is cut short, with a hash of the object name keeping it unique.
fn volume_name(prefix: &str, object_name: &str) -> String {
    let name = format!("{prefix}-{object_name}");
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' => c,
            _ => '-',
        })
        .collect();
    if sanitized == name && name.len() <= MAX_VOLUME_NAME_LEN && !name.ends_with('-') {
        return name;
    }

    let mut hasher = FnvHasher::default();
    hasher.write(object_name.as_bytes());
    let hash = format!("{:016x}", hasher.finish());
    let mut sanitized = sanitized;
    sanitized.truncate(MAX_VOLUME_NAME_LEN - hash.len() - 1);
    format!("{}-{hash}", sanitized.trim_end_matches('-'))
}

/// Declared requirements replace the collector defaults as a whole.
fn resources(pod: PodSpec, ctx: &AssemblyContext) -> PodSpec {
    let resources = ctx
        .spec
        .collector
        .resources
        .clone()
        .unwrap_or_else(|| collector::strategy(ctx.collector_type).default_resources());
    with_collector(pod, |container| container.resources = Some(resources))
}

fn scheduling(mut pod: PodSpec, ctx: &AssemblyContext) -> PodSpec {
    let defaults = &ctx.config.workload;

    let mut tolerations = defaults.tolerations.clone();
    tolerations.extend(ctx.spec.collector.tolerations.iter().cloned());

    let mut node_selector = defaults.node_selector.clone();
    node_selector.extend(
        ctx.spec
            .collector
            .node_selector
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );

    pod.tolerations = Some(tolerations);
    pod.node_selector = Some(node_selector);
    pod
}

fn proxy(pod: PodSpec, ctx: &AssemblyContext) -> PodSpec {
    let proxy = &ctx.cluster.proxy;
    let no_proxy = (!proxy.no_proxy.is_empty())
        .then(|| format!("{NO_PROXY_PREFIX},{}", proxy.no_proxy))
        .unwrap_or_default();

    let mut vars = Vec::new();
    for (name, value) in [
        ("HTTP_PROXY", &proxy.http_proxy),
        ("HTTPS_PROXY", &proxy.https_proxy),
        ("NO_PROXY", &no_proxy),
    ] {
        if !value.is_empty() {
            vars.push(env_var(name, value));
            vars.push(env_var(&name.to_lowercase(), value));
        }
    }
    add_env(pod, vars)
}

fn trusted_ca_bundle(pod: PodSpec, ctx: &AssemblyContext) -> PodSpec {
    let Some(bundle) = ctx.trusted_ca_bundle else {
        return pod;
    };
    let config_map_name = bundle
        .metadata
        .name
        .as_deref()
        .unwrap_or(TRUSTED_CA_BUNDLE_NAME);
    add_volume(
        pod,
        config_map_volume(
            TRUSTED_CA_BUNDLE_NAME,
            config_map_name,
            Some(vec![KeyToPath {
                key: TRUSTED_CA_BUNDLE_KEY.to_string(),
                path: TRUSTED_CA_BUNDLE_PATH.to_string(),
                ..KeyToPath::default()
            }]),
        ),
        volume_mount(TRUSTED_CA_BUNDLE_NAME, TRUSTED_CA_BUNDLE_MOUNT_PATH, true),
    )
}

/// Mounts the projected service account token for cloud outputs that assume a role, and
/// announces the role through `AWS_*` variables when the collector reads them.
///
/// Only one role can be announced through the environment; the first such output in document
/// order wins.
fn federated_credentials(pod: PodSpec, ctx: &AssemblyContext) -> PodSpec {
    let assumed_roles: Vec<(&str, String)> = ctx
        .document
        .outputs()
        .filter(|output| output.output_type().requires_cloud_credentials())
        .filter_map(|output| {
            let secret = ctx.secrets.get(&output.name)?;
            match secrets::credential_shape(secret) {
                CredentialShape::Bundled | CredentialShape::RoleOnly => secrets::role_arn(secret)
                    .map(|role_arn| (output.sink.region().unwrap_or_default(), role_arn)),
                CredentialShape::None => None,
            }
        })
        .collect();
    let Some((region, role_arn)) = assumed_roles.first() else {
        return pod;
    };

    let pod = add_volume(
        pod,
        Volume {
            name: SA_TOKEN_VOLUME.to_string(),
            projected: Some(ProjectedVolumeSource {
                sources: Some(vec![VolumeProjection {
                    service_account_token: Some(ServiceAccountTokenProjection {
                        audience: Some(SA_TOKEN_AUDIENCE.to_string()),
                        expiration_seconds: Some(SA_TOKEN_EXPIRATION_SECONDS),
                        path: WEB_IDENTITY_TOKEN_FILE_NAME.to_string(),
                    }),
                    ..VolumeProjection::default()
                }]),
                ..ProjectedVolumeSource::default()
            }),
            ..Volume::default()
        },
        volume_mount(SA_TOKEN_VOLUME, WEB_IDENTITY_TOKEN_DIR, true),
    );

    match collector::strategy(ctx.collector_type).credential_delivery() {
        CredentialDelivery::Environment => add_env(pod, vec![
            env_var(AWS_REGION_ENV, *region),
            env_var(AWS_ROLE_ARN_ENV, role_arn),
            env_var(AWS_ROLE_SESSION_NAME_ENV, ROLE_SESSION_NAME),
            env_var(AWS_WEB_IDENTITY_TOKEN_FILE_ENV, WEB_IDENTITY_TOKEN_FILE),
        ]),
        CredentialDelivery::Configuration => pod,
    }
}
