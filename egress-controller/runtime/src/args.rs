use crate::{
    admission::Admission,
    core::{
        backend::{FirewallPolicyTarget, MemoryBackend},
        DEFAULT_RULE_COLLECTION_GROUP_PRIORITY,
    },
    index,
    k8s::{self, watcher},
    sync::{self, QueueMetrics, ReconcileMetrics},
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::{sync::mpsc, time::Duration};
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "egress", about = "An egress firewall policy controller")]
pub struct Args {
    #[clap(long, default_value = "egress=info,warn", env = "EGRESS_CONTROLLER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// The minimum time between the starts of two reconciliation passes.
    #[clap(long, default_value = "1000")]
    min_update_interval_ms: u64,

    /// The number of resources that may wait for reconciliation.
    #[clap(long, default_value = "16")]
    queue_capacity: usize,

    /// The maximum number of queued resources handled by a single pass.
    #[clap(long, default_value = "64")]
    max_batch: usize,

    #[clap(
        long,
        env = "FW_POLICY_RULE_COLLECTION_GROUP_PRIORITY",
        default_value_t = DEFAULT_RULE_COLLECTION_GROUP_PRIORITY
    )]
    rule_collection_group_priority: i32,

    /// The rule collection group managed by the controller.
    #[clap(long, env = "FW_POLICY_RULE_COLLECTION_GROUP")]
    rule_collection_group: String,

    #[clap(long, env = "FW_POLICY_NAME")]
    firewall_policy_name: Option<String>,

    #[clap(long, env = "FW_POLICY_RESOURCE_GROUP")]
    firewall_policy_resource_group: Option<String>,

    #[clap(long, env = "FW_POLICY_SUBSCRIPTION_ID")]
    firewall_policy_subscription_id: Option<String>,

    /// The firewall policy's full resource id. Overrides the policy name, resource group and
    /// subscription when set.
    #[clap(long, env = "FW_POLICY_RESOURCE_ID")]
    firewall_policy_resource_id: Option<String>,

    /// How long the in-memory backend takes to provision an update.
    #[clap(long, default_value = "0")]
    backend_provisioning_delay_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            min_update_interval_ms,
            queue_capacity,
            max_batch,
            rule_collection_group_priority,
            rule_collection_group,
            firewall_policy_name,
            firewall_policy_resource_group,
            firewall_policy_subscription_id,
            firewall_policy_resource_id,
            backend_provisioning_delay_ms,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let target = policy_target(
            firewall_policy_resource_id,
            firewall_policy_subscription_id,
            firewall_policy_resource_group,
            firewall_policy_name,
            rule_collection_group,
        )?;

        let mut prom = <Registry>::default();
        let queue_metrics = QueueMetrics::register(&mut prom);
        let reconcile_metrics = ReconcileMetrics::register(&mut prom);
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        // The index publishes the resources that need reconciliation, or a gate change, to the
        // controller.
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let index = index::Index::shared(events_tx);

        // Spawn resource watches.

        let rules = runtime.watch_all::<k8s::EgressRules>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), rules).instrument(info_span!("egressrules")),
        );

        let nodes = runtime.watch_all::<k8s::Node>(watcher::Config::default());
        tokio::spawn(kubert::index::cluster(index.clone(), nodes).instrument(info_span!("nodes")));

        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(kubert::index::namespaced(index.clone(), pods).instrument(info_span!("pods")));

        let (queue, jobs) = sync::queue::channel(queue_capacity, queue_metrics);
        let controller = index::Controller::new(events_rx, queue, runtime.client());
        tokio::spawn(controller.run().instrument(info_span!("controller")));

        warn!(
            policy = %target.policy_name,
            rule_collection_group = %target.rule_collection_group,
            "No firewall transport is configured; policies are applied to an in-memory backend"
        );
        let backend = Arc::new(MemoryBackend::new(
            target,
            Duration::from_millis(backend_provisioning_delay_ms),
        ));
        let inventory = Arc::new(index::KubeInventory::new(index, runtime.client()));
        let reconciler = sync::Reconciler::new(
            inventory,
            backend,
            rule_collection_group_priority,
            reconcile_metrics,
        );
        let worker = sync::Worker::new(
            jobs,
            reconciler,
            Duration::from_millis(min_update_interval_ms),
            max_batch,
        );
        info!(min_update_interval_ms, queue_capacity, max_batch, "Starting reconciliation");
        tokio::spawn(
            worker
                .run(runtime.shutdown_handle())
                .instrument(info_span!("reconcile")),
        );

        let runtime = runtime.spawn_server(Admission::new);

        // Wait for the shutdown signal, then for the background tasks to finish.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Identifies the managed rule collection group, preferring the policy's full resource id.
fn policy_target(
    resource_id: Option<String>,
    subscription_id: Option<String>,
    resource_group: Option<String>,
    policy_name: Option<String>,
    rule_collection_group: String,
) -> Result<FirewallPolicyTarget> {
    fn non_empty(value: Option<String>) -> Option<String> {
        value.filter(|v| !v.is_empty())
    }

    if let Some(id) = non_empty(resource_id) {
        let target = FirewallPolicyTarget::from_resource_id(&id, rule_collection_group)?;
        return Ok(target);
    }

    match (
        non_empty(subscription_id),
        non_empty(resource_group),
        non_empty(policy_name),
    ) {
        (Some(subscription_id), Some(resource_group), Some(policy_name)) => {
            Ok(FirewallPolicyTarget {
                subscription_id,
                resource_group,
                policy_name,
                rule_collection_group,
            })
        }
        _ => bail!(
            "the firewall policy requires either a resource id or a subscription, resource group \
             and name"
        ),
    }
}
