//! Reconciles a [`LogForwarder`] into the collector configuration and workload.
//!
//! A reconcile pass walks `Fetching -> Validating -> Building -> Statusing -> Done`. Everything
//! that talks to the cluster sits behind [`ForwarderClient`] and [`EventPublisher`]; the states
//! in between only call the pure compiler and workload factory.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::{ConfigMap, PodSpec},
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
    chrono::Utc,
};
use kube::{runtime::controller::Action, ResourceExt};
use log_forwarder_crd::{
    Condition, LogForwarder, LogForwarderStatus, APP_NAME, CONDITION_TYPE_READY,
};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{Display, EnumDiscriminants, IntoStaticStr};

use crate::{
    cluster::{ClusterInfo, OperatorConfig},
    collector,
    config,
    pod::{self, AssemblyContext},
    secrets::OutputSecrets,
    status,
};

/// Delay before a status update that lost an optimistic concurrency race is retried.
pub const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);
pub const ERROR_REQUEUE: Duration = Duration::from_secs(10);

pub const EVENT_REASON_INVALID: &str = "Invalid";
pub const EVENT_REASON_DEAD_END: &str = "CollectorDeadEnd";
pub const EVENT_REASON_READY: &str = "Ready";

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("object defines no name"))]
    ObjectHasNoName,

    #[snafu(display("object defines no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("failed to fetch LogForwarder {namespace}/{name}"))]
    FetchForwarder {
        source: kube::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to fetch output secrets"))]
    FetchSecrets { source: kube::Error },

    #[snafu(display("failed to fetch the trusted CA bundle"))]
    FetchTrustedCaBundle { source: kube::Error },

    #[snafu(display("failed to fetch cluster information"))]
    FetchClusterInfo { source: kube::Error },

    #[snafu(display("failed to apply collector configuration and workload"))]
    ApplyArtifacts { source: kube::Error },

    #[snafu(display("failed to update status"))]
    UpdateStatus { source: kube::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Low-cardinality label for logs and metrics.
    pub fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

/// The generated objects of one forwarder.
#[derive(Clone, Debug, PartialEq)]
pub struct Artifacts {
    /// Holds the rendered collector configuration.
    pub config_map: ConfigMap,
    pub pod_spec: PodSpec,
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum EventType {
    Normal,
    Warning,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Event {
    pub type_: EventType,
    pub reason: String,
    pub note: String,
}

#[async_trait]
pub trait ForwarderClient: Send + Sync {
    async fn get_forwarder(&self, namespace: &str, name: &str) -> Result<LogForwarder, kube::Error>;

    /// Secrets of the outputs declaring one, keyed by output name.
    async fn get_output_secrets(
        &self,
        forwarder: &LogForwarder,
    ) -> Result<OutputSecrets, kube::Error>;

    /// The cluster-wide trusted CA bundle, if it has been injected into `namespace`.
    async fn get_trusted_ca_bundle(
        &self,
        namespace: &str,
    ) -> Result<Option<ConfigMap>, kube::Error>;

    async fn get_cluster_info(&self) -> Result<ClusterInfo, kube::Error>;

    async fn apply_artifacts(
        &self,
        forwarder: &LogForwarder,
        artifacts: &Artifacts,
    ) -> Result<(), kube::Error>;

    async fn update_status(
        &self,
        forwarder: &LogForwarder,
        status: &LogForwarderStatus,
    ) -> Result<(), kube::Error>;
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, forwarder: &LogForwarder, event: Event);
}

pub struct Ctx {
    pub client: Arc<dyn ForwarderClient>,
    pub events: Arc<dyn EventPublisher>,
    pub config: OperatorConfig,
}

/// Everything read from the cluster for one pass.
struct Snapshot {
    forwarder: LogForwarder,
    secrets: OutputSecrets,
    trusted_ca_bundle: Option<ConfigMap>,
    cluster: ClusterInfo,
}

enum State {
    Fetching,
    Validating(Snapshot),
    Building(Snapshot),
    Statusing {
        snapshot: Snapshot,
        conditions: Vec<Condition>,
        /// Published unconditionally.
        warning: Option<Event>,
    },
    Done(Action),
}

pub async fn reconcile_forwarder(forwarder: Arc<LogForwarder>, ctx: Arc<Ctx>) -> Result<Action> {
    let name = forwarder.metadata.name.clone().context(ObjectHasNoNameSnafu)?;
    let namespace = forwarder.namespace().context(ObjectHasNoNamespaceSnafu)?;
    tracing::info!(forwarder = %name, %namespace, "Starting reconcile");

    let mut state = State::Fetching;
    loop {
        state = match state {
            State::Fetching => match fetch(&ctx, &namespace, &name).await? {
                Some(snapshot) => State::Validating(snapshot),
                None => {
                    tracing::debug!(forwarder = %name, "LogForwarder is gone, nothing to do");
                    State::Done(Action::await_change())
                }
            },
            State::Validating(snapshot) => match snapshot.forwarder.spec.validate() {
                Ok(()) => State::Building(snapshot),
                Err(error) => {
                    tracing::warn!(
                        forwarder = %name,
                        phase = "validating",
                        %error,
                        "Invalid forwarder"
                    );
                    State::Statusing {
                        snapshot,
                        conditions: vec![Condition::invalid(error.to_string(), now())],
                        warning: Some(Event {
                            type_: EventType::Warning,
                            reason: EVENT_REASON_INVALID.to_string(),
                            note: error.to_string(),
                        }),
                    }
                }
            },
            State::Building(snapshot) => match build_artifacts(&snapshot, &ctx.config) {
                Ok(artifacts) => {
                    ctx.client
                        .apply_artifacts(&snapshot.forwarder, &artifacts)
                        .await
                        .context(ApplyArtifactsSnafu)?;
                    State::Statusing {
                        snapshot,
                        conditions: vec![Condition::no_dead_end(now()), Condition::ready(now())],
                        warning: None,
                    }
                }
                Err(error) => {
                    // artifacts applied by earlier passes are left in place
                    tracing::warn!(
                        forwarder = %name,
                        phase = "building",
                        %error,
                        "Collector dead end"
                    );
                    State::Statusing {
                        snapshot,
                        conditions: vec![Condition::dead_end(error.to_string(), now())],
                        warning: Some(Event {
                            type_: EventType::Warning,
                            reason: EVENT_REASON_DEAD_END.to_string(),
                            note: error.to_string(),
                        }),
                    }
                }
            },
            State::Statusing {
                snapshot,
                conditions,
                warning,
            } => publish_status(&ctx, &snapshot.forwarder, conditions, warning).await?,
            State::Done(action) => return Ok(action),
        }
    }
}

pub fn error_policy(forwarder: Arc<LogForwarder>, error: &Error, _ctx: Arc<Ctx>) -> Action {
    tracing::warn!(
        forwarder = %forwarder.name_any(),
        category = error.category(),
        %error,
        "Reconcile failed"
    );
    Action::requeue(ERROR_REQUEUE)
}

fn now() -> Time {
    Time(Utc::now())
}

fn is_status(error: &kube::Error, code: u16) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == code)
}

async fn fetch(ctx: &Ctx, namespace: &str, name: &str) -> Result<Option<Snapshot>> {
    let forwarder = match ctx.client.get_forwarder(namespace, name).await {
        Ok(forwarder) => forwarder,
        Err(error) if is_status(&error, 404) => return Ok(None),
        Err(error) => {
            return Err(error).context(FetchForwarderSnafu { namespace, name });
        }
    };
    let secrets = ctx
        .client
        .get_output_secrets(&forwarder)
        .await
        .context(FetchSecretsSnafu)?;
    let trusted_ca_bundle = ctx
        .client
        .get_trusted_ca_bundle(namespace)
        .await
        .context(FetchTrustedCaBundleSnafu)?;
    // the proxy is the one the operator itself was started with
    let cluster = ClusterInfo {
        proxy: ctx.config.proxy.clone(),
        ..ctx
            .client
            .get_cluster_info()
            .await
            .context(FetchClusterInfoSnafu)?
    };
    Ok(Some(Snapshot {
        forwarder,
        secrets,
        trusted_ca_bundle,
        cluster,
    }))
}

pub fn config_map_name(forwarder: &str) -> String {
    format!("{forwarder}-config")
}

fn build_artifacts(
    snapshot: &Snapshot,
    config: &OperatorConfig,
) -> Result<Artifacts, config::Error> {
    let forwarder = &snapshot.forwarder;
    let spec = &forwarder.spec;
    let collector_type = spec.collector.type_;
    let strategy = collector::strategy(collector_type);

    let document = config::assemble(spec, collector_type, &snapshot.secrets, &snapshot.cluster)?;
    let rendered = strategy.render(&document)?;

    let name = forwarder.name_any();
    let config_map_name = config_map_name(&name);
    let pod_spec = pod::build_pod_spec(&AssemblyContext {
        config_map_name: &config_map_name,
        spec,
        collector_type,
        document: &document,
        secrets: &snapshot.secrets,
        trusted_ca_bundle: snapshot.trusted_ca_bundle.as_ref(),
        cluster: &snapshot.cluster,
        config,
    });

    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_name),
            namespace: forwarder.namespace(),
            labels: Some(BTreeMap::from([
                ("app.kubernetes.io/name".to_string(), APP_NAME.to_string()),
                ("app.kubernetes.io/instance".to_string(), name),
                ("app.kubernetes.io/component".to_string(), collector_type.to_string()),
            ])),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([(
            strategy.config_file_name().to_string(),
            rendered,
        )])),
        ..ConfigMap::default()
    };
    Ok(Artifacts {
        config_map,
        pod_spec,
    })
}

async fn publish_status(
    ctx: &Ctx,
    forwarder: &LogForwarder,
    updates: Vec<Condition>,
    warning: Option<Event>,
) -> Result<State> {
    let mut conditions = forwarder.conditions().to_vec();
    let mut ready_newly_asserted = false;
    for condition in updates {
        let is_ready = condition.type_ == CONDITION_TYPE_READY;
        let (updated, newly_asserted) = status::apply_condition(&conditions, condition);
        conditions = updated;
        ready_newly_asserted |= is_ready && newly_asserted;
    }

    match ctx
        .client
        .update_status(forwarder, &LogForwarderStatus {
            conditions: conditions.clone(),
        })
        .await
    {
        Ok(()) => {}
        Err(error) if is_status(&error, 409) => {
            tracing::debug!(
                forwarder = %forwarder.name_any(),
                "Status update conflicted, retrying"
            );
            return Ok(State::Done(Action::requeue(CONFLICT_REQUEUE)));
        }
        Err(error) => return Err(error).context(UpdateStatusSnafu),
    }

    if let Some(warning) = warning {
        ctx.events.publish(forwarder, warning).await;
    } else if ready_newly_asserted && status::is_true(&conditions, CONDITION_TYPE_READY) {
        ctx.events
            .publish(forwarder, Event {
                type_: EventType::Normal,
                reason: EVENT_REASON_READY.to_string(),
                note: "collector configuration and workload are up to date".to_string(),
            })
            .await;
    }
    tracing::info!(forwarder = %forwarder.name_any(), "Reconcile finished");
    Ok(State::Done(Action::await_change()))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use indoc::indoc;
    use kube::error::ErrorResponse;
    use log_forwarder_crd::{
        ConditionStatus, CONDITION_REASON_INVALID, CONDITION_TYPE_COLLECTOR_DEAD_END,
    };

    use super::*;

    const FORWARDER: &str = indoc! {"
        apiVersion: logging.forwarder.dev/v1
        kind: LogForwarder
        metadata:
          name: instance
          namespace: openshift-logging
        spec:
          pipelines:
            - inputRefs: [application]
              outputRefs: [es]
          outputs:
            - name: es
              type: elasticsearch
              url: https://es.svc:9200
    "};

    fn forwarder(input: &str) -> LogForwarder {
        serde_yaml::from_str(input).expect("illegal test input")
    }

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("request failed with {code}"),
            reason: String::new(),
            code,
        })
    }

    #[derive(Default)]
    struct FakeClient {
        forwarder: Mutex<Option<LogForwarder>>,
        secrets_error: Option<u16>,
        status_error: Option<u16>,
        applied: Mutex<Vec<Artifacts>>,
        statuses: Mutex<Vec<LogForwarderStatus>>,
    }

    #[async_trait]
    impl ForwarderClient for FakeClient {
        async fn get_forwarder(
            &self,
            _namespace: &str,
            _name: &str,
        ) -> Result<LogForwarder, kube::Error> {
            self.forwarder
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| api_error(404))
        }

        async fn get_output_secrets(
            &self,
            _forwarder: &LogForwarder,
        ) -> Result<OutputSecrets, kube::Error> {
            match self.secrets_error {
                Some(code) => Err(api_error(code)),
                None => Ok(OutputSecrets::new()),
            }
        }

        async fn get_trusted_ca_bundle(
            &self,
            _namespace: &str,
        ) -> Result<Option<ConfigMap>, kube::Error> {
            Ok(None)
        }

        async fn get_cluster_info(&self) -> Result<ClusterInfo, kube::Error> {
            Ok(ClusterInfo {
                cluster_id: "abc-123".to_string(),
                ..ClusterInfo::default()
            })
        }

        async fn apply_artifacts(
            &self,
            _forwarder: &LogForwarder,
            artifacts: &Artifacts,
        ) -> Result<(), kube::Error> {
            self.applied.lock().unwrap().push(artifacts.clone());
            Ok(())
        }

        async fn update_status(
            &self,
            _forwarder: &LogForwarder,
            status: &LogForwarderStatus,
        ) -> Result<(), kube::Error> {
            if let Some(code) = self.status_error {
                return Err(api_error(code));
            }
            self.statuses.lock().unwrap().push(status.clone());
            if let Some(forwarder) = self.forwarder.lock().unwrap().as_mut() {
                forwarder.status = Some(status.clone());
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeEvents {
        published: Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl EventPublisher for FakeEvents {
        async fn publish(&self, _forwarder: &LogForwarder, event: Event) {
            self.published.lock().unwrap().push(event);
        }
    }

    struct Harness {
        client: Arc<FakeClient>,
        events: Arc<FakeEvents>,
        ctx: Arc<Ctx>,
    }

    impl Harness {
        fn new(client: FakeClient) -> Self {
            let client = Arc::new(client);
            let events = Arc::new(FakeEvents::default());
            let ctx = Arc::new(Ctx {
                client: client.clone(),
                events: events.clone(),
                config: OperatorConfig::from_lookup(|_| None),
            });
            Self {
                client,
                events,
                ctx,
            }
        }

        fn serving(input: &str) -> Self {
            Self::new(FakeClient {
                forwarder: Mutex::new(Some(forwarder(input))),
                ..FakeClient::default()
            })
        }

        async fn reconcile(&self) -> Result<Action> {
            reconcile_forwarder(Arc::new(forwarder(FORWARDER)), self.ctx.clone()).await
        }

        fn last_status(&self) -> LogForwarderStatus {
            self.client
                .statuses
                .lock()
                .unwrap()
                .last()
                .cloned()
                .expect("status was written")
        }

        fn events(&self) -> Vec<Event> {
            self.events.published.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_ready_is_announced_once() {
        let harness = Harness::serving(FORWARDER);

        let action = harness.reconcile().await.expect("reconcile succeeds");
        assert_eq!(action, Action::await_change());

        let applied = harness.client.applied.lock().unwrap().clone();
        assert_eq!(applied.len(), 1);
        assert_eq!(
            applied[0].config_map.metadata.name.as_deref(),
            Some("instance-config")
        );
        let rendered = applied[0]
            .config_map
            .data
            .as_ref()
            .and_then(|data| data.get("vector.toml"))
            .expect("vector configuration");
        assert!(rendered.contains("[sinks.output_es]"));
        assert!(rendered.contains(r#".openshift.cluster_id = "abc-123""#));
        assert_eq!(applied[0].pod_spec.containers.len(), 1);

        let conditions = harness.last_status().conditions;
        assert!(status::is_true(&conditions, CONDITION_TYPE_READY));
        assert_eq!(
            status::find(&conditions, CONDITION_TYPE_COLLECTOR_DEAD_END).map(|c| &c.status),
            Some(&ConditionStatus::False)
        );
        assert_eq!(harness.events(), vec![Event {
            type_: EventType::Normal,
            reason: "Ready".to_string(),
            note: "collector configuration and workload are up to date".to_string(),
        }]);

        harness.reconcile().await.expect("reconcile succeeds");
        assert_eq!(harness.events().len(), 1);
        assert_eq!(harness.client.applied.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_forwarder_exits_silently() {
        let harness = Harness::new(FakeClient::default());

        let action = harness.reconcile().await.expect("reconcile succeeds");
        assert_eq!(action, Action::await_change());
        assert!(harness.client.applied.lock().unwrap().is_empty());
        assert!(harness.client.statuses.lock().unwrap().is_empty());
        assert!(harness.events().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_forwarder_is_not_built() {
        let harness =
            Harness::serving(&FORWARDER.replace("outputRefs: [es]", "outputRefs: [nope]"));

        harness.reconcile().await.expect("reconcile succeeds");

        assert!(harness.client.applied.lock().unwrap().is_empty());
        let ready = status::find(&harness.last_status().conditions, CONDITION_TYPE_READY)
            .cloned()
            .expect("ready condition");
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, CONDITION_REASON_INVALID);
        assert_eq!(
            ready.message,
            "pipeline [pipeline_0] references undeclared output [nope]"
        );
        let events = harness.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].type_, EventType::Warning);
        assert_eq!(events[0].reason, "Invalid");
    }

    #[tokio::test]
    async fn test_unsupported_output_is_a_dead_end() {
        let input = FORWARDER
            .replace("spec:\n", "spec:\n  collector:\n    type: fluentd\n")
            .replace("type: elasticsearch", "type: http");
        let harness = Harness::serving(&input);

        harness.reconcile().await.expect("reconcile succeeds");

        assert!(harness.client.applied.lock().unwrap().is_empty());
        let conditions = harness.last_status().conditions;
        assert!(status::is_true(&conditions, CONDITION_TYPE_COLLECTOR_DEAD_END));
        assert!(status::find(&conditions, CONDITION_TYPE_READY).is_none());
        assert_eq!(harness.events()[0].reason, "CollectorDeadEnd");
    }

    #[tokio::test]
    async fn test_status_conflict_is_requeued() {
        let harness = Harness::new(FakeClient {
            forwarder: Mutex::new(Some(forwarder(FORWARDER))),
            status_error: Some(409),
            ..FakeClient::default()
        });

        let action = harness.reconcile().await.expect("conflicts are not errors");
        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
        assert!(harness.events().is_empty());
    }

    #[tokio::test]
    async fn test_external_errors_surface() {
        let harness = Harness::new(FakeClient {
            forwarder: Mutex::new(Some(forwarder(FORWARDER))),
            secrets_error: Some(500),
            ..FakeClient::default()
        });

        let error = harness.reconcile().await.expect_err("secrets cannot be read");
        assert_eq!(error.category(), "FetchSecrets");
        assert_eq!(
            error_policy(Arc::new(forwarder(FORWARDER)), &error, harness.ctx.clone()),
            Action::requeue(Duration::from_secs(10))
        );
    }
}
