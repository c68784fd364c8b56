use crate::{
    coordinator,
    queue::{self, Batch, Process},
    PendingOperations, PolicyOutcome, QueueMetrics, ReconcileMetrics, Reconciler, Worker,
};
use egress_controller_core::{
    backend::{FirewallPolicyTarget, MemoryBackend, ProvisioningState},
    inventory::{Labels, Node, Pod, PodPhase, ResourceState},
    policy::{ApplicationProtocol, ApplicationProtocolType, Rule},
    rules::{
        Action, ApplicationRuleSpec, Destination, EgressRule, NetworkRuleSpec, RuleKind, RuleSpec,
        Selector,
    },
    Inventory, OperationHandle, ResourceKey,
};
use maplit::btreemap;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::{collections::BTreeMap, sync::Arc};
use tokio::time::{self, Duration, Instant};

fn trace_init() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .finish(),
    )
}

#[derive(Default)]
struct TestInventory(Mutex<State>);

#[derive(Default)]
struct State {
    rules: Vec<EgressRule>,
    nodes: BTreeMap<String, Node>,
    pods: Vec<Pod>,
    gated: BTreeMap<String, bool>,
    released: Vec<ResourceKey>,
    fail_lists: bool,
}

#[async_trait::async_trait]
impl Inventory for TestInventory {
    async fn list_rules(&self) -> anyhow::Result<Vec<EgressRule>> {
        let state = self.0.lock();
        if state.fail_lists {
            anyhow::bail!("inventory unavailable");
        }
        Ok(state.rules.clone())
    }

    async fn list_nodes(&self) -> anyhow::Result<Vec<Node>> {
        Ok(self.0.lock().nodes.values().cloned().collect())
    }

    async fn list_pods(&self) -> anyhow::Result<Vec<Pod>> {
        Ok(self.0.lock().pods.clone())
    }

    async fn get_resource(&self, key: &ResourceKey) -> anyhow::Result<Option<ResourceState>> {
        let state = self.0.lock();
        let name = match key {
            ResourceKey::Node(name) => name,
            _ => return Ok(None),
        };
        Ok(state.nodes.get(name).map(|node| ResourceState {
            labels: node.labels.clone(),
            gated: state.gated.get(name).copied().unwrap_or(false),
            ready: true,
        }))
    }

    async fn set_gate(&self, key: &ResourceKey, present: bool) -> anyhow::Result<()> {
        let mut state = self.0.lock();
        if let ResourceKey::Node(name) = key {
            state.gated.insert(name.clone(), present);
        }
        if !present {
            state.released.push(key.clone());
        }
        Ok(())
    }
}

impl TestInventory {
    fn with_nodes(nodes: Vec<Node>) -> Arc<Self> {
        let inventory = Self::default();
        inventory.0.lock().nodes = nodes
            .into_iter()
            .map(|node| (node.name.clone(), node))
            .collect();
        Arc::new(inventory)
    }

    fn set_rules(&self, rules: Vec<EgressRule>) {
        self.0.lock().rules = rules;
    }

    fn set_labels(&self, node: &str, labels: Labels) {
        if let Some(node) = self.0.lock().nodes.get_mut(node) {
            node.labels = labels;
        }
    }

    fn gate(&self, node: &str) {
        self.0.lock().gated.insert(node.to_string(), true);
    }

    fn released(&self) -> Vec<ResourceKey> {
        self.0.lock().released.clone()
    }
}

fn node(name: &str, addr: &str, labels: Labels) -> Node {
    Node {
        name: name.to_string(),
        labels,
        addresses: vec![addr.to_string()],
    }
}

fn prod() -> Labels {
    btreemap! { "env".to_string() => "prod".to_string() }
}

fn cluster() -> Arc<TestInventory> {
    TestInventory::with_nodes(vec![
        node("node-0", "10.0.0.1", prod()),
        node("node-1", "10.0.0.2", prod()),
        node("node-2", "10.0.0.3", Labels::default()),
    ])
}

fn web_rule() -> EgressRule {
    EgressRule {
        name: "egress/web".to_string(),
        selectors: vec![Selector::node("env", "prod")],
        rules: vec![RuleSpec {
            collection: "allow-example".to_string(),
            name: "example".to_string(),
            priority: None,
            action: Action::Allow,
            kind: RuleKind::Application(ApplicationRuleSpec {
                target_fqdns: vec!["*.example.com".to_string()],
                target_urls: vec![],
                protocols: vec!["HTTP:80".to_string()],
            }),
        }],
    }
}

fn pod_rule() -> EgressRule {
    EgressRule {
        name: "egress/jobs".to_string(),
        selectors: vec![Selector::pod("app", "jobs")],
        rules: vec![RuleSpec {
            collection: "deny-db".to_string(),
            name: "db".to_string(),
            priority: None,
            action: Action::Deny,
            kind: RuleKind::Network(NetworkRuleSpec {
                destination: Destination::Addresses(vec!["10.10.0.0/16".to_string()]),
                ports: vec!["5432".to_string()],
                protocols: vec!["TCP".to_string()],
            }),
        }],
    }
}

fn backend(delay: Duration) -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::new(
        FirewallPolicyTarget {
            subscription_id: "sub".to_string(),
            resource_group: "rg".to_string(),
            policy_name: "fw".to_string(),
            rule_collection_group: "egress".to_string(),
        },
        delay,
    ))
}

fn batch(trigger: ResourceKey) -> Batch<ResourceKey> {
    Batch {
        trigger,
        coalesced: vec![],
    }
}

#[tokio::test(start_paused = true)]
async fn applies_resolved_rules() {
    let _tracing = trace_init();
    let inventory = cluster();
    inventory.set_rules(vec![web_rule()]);
    let backend = backend(Duration::ZERO);
    let mut reconciler =
        Reconciler::new(inventory, backend.clone(), 400, ReconcileMetrics::default());

    let outcome = reconciler
        .reconcile(&batch(ResourceKey::rules("egress")))
        .await
        .expect("pass must succeed");
    assert_eq!(outcome.policy, PolicyOutcome::Applied);
    outcome.completion.await.expect("completion must not panic");

    let group = backend
        .address_group("ipgroup-node-env-prod")
        .expect("group must exist");
    assert_eq!(group.addresses, vec!["10.0.0.1", "10.0.0.2"]);
    assert_eq!(group.provisioning_state, ProvisioningState::Succeeded);

    let policy = backend.policy().expect("policy must be applied");
    assert_eq!(policy.priority, 400);
    let collection = policy
        .collection("allow-example")
        .expect("collection must exist");
    assert_eq!(collection.priority, 210);
    assert_eq!(collection.rules.len(), 1);
    match &collection.rules[0] {
        Rule::Application(rule) => {
            assert_eq!(rule.source_ip_groups, vec![group.id.clone()]);
            assert!(!rule.terminate_tls);
            assert_eq!(
                rule.protocols,
                vec![ApplicationProtocol {
                    protocol_type: ApplicationProtocolType::Http,
                    port: 80,
                }]
            );
        }
        rule => panic!("unexpected rule: {:?}", rule),
    }
    assert!(reconciler.pending().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unchanged_passes_do_not_push() {
    let _tracing = trace_init();
    let inventory = cluster();
    inventory.set_rules(vec![web_rule()]);
    let backend = backend(Duration::ZERO);
    let mut reconciler = Reconciler::new(
        inventory.clone(),
        backend.clone(),
        400,
        ReconcileMetrics::default(),
    );

    let first = reconciler
        .reconcile(&batch(ResourceKey::node("node-0")))
        .await
        .unwrap();
    assert_eq!(first.policy, PolicyOutcome::Applied);
    first.completion.await.unwrap();

    let second = reconciler
        .reconcile(&batch(ResourceKey::node("node-0")))
        .await
        .unwrap();
    assert_eq!(second.policy, PolicyOutcome::Unchanged);
    second.completion.await.unwrap();

    assert_eq!(backend.policy_pushes(), 1);
    assert_eq!(backend.address_group_updates(), 1);

    // A restarted controller loads the applied document and does not push it again.
    let mut restarted =
        Reconciler::new(inventory, backend.clone(), 400, ReconcileMetrics::default());
    let outcome = restarted
        .reconcile(&batch(ResourceKey::node("node-0")))
        .await
        .unwrap();
    assert_eq!(outcome.policy, PolicyOutcome::Unchanged);
    assert_eq!(backend.policy_pushes(), 1);
}

#[tokio::test(start_paused = true)]
async fn address_churn_only_updates_groups() {
    let _tracing = trace_init();
    let inventory = cluster();
    inventory.set_rules(vec![web_rule()]);
    let backend = backend(Duration::ZERO);
    let mut reconciler = Reconciler::new(
        inventory.clone(),
        backend.clone(),
        400,
        ReconcileMetrics::default(),
    );
    reconciler
        .reconcile(&batch(ResourceKey::node("node-0")))
        .await
        .unwrap()
        .completion
        .await
        .unwrap();

    inventory.set_labels("node-2", prod());
    let outcome = reconciler
        .reconcile(&batch(ResourceKey::node("node-2")))
        .await
        .unwrap();
    assert_eq!(outcome.policy, PolicyOutcome::Unchanged);
    outcome.completion.await.unwrap();

    assert_eq!(backend.address_group_updates(), 2);
    assert_eq!(backend.policy_pushes(), 1);
    assert_eq!(
        backend
            .address_group("ipgroup-node-env-prod")
            .unwrap()
            .addresses,
        vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]
    );
}

#[tokio::test(start_paused = true)]
async fn releases_gates_after_operations_settle() {
    let _tracing = trace_init();
    let inventory = cluster();
    inventory.set_rules(vec![web_rule()]);
    inventory.gate("node-1");
    let backend = backend(Duration::from_secs(5));
    let mut reconciler = Reconciler::new(
        inventory.clone(),
        backend.clone(),
        400,
        ReconcileMetrics::default(),
    );

    let outcome = reconciler
        .reconcile(&Batch {
            trigger: ResourceKey::node("node-1"),
            coalesced: vec![ResourceKey::node("node-2"), ResourceKey::rules("egress")],
        })
        .await
        .unwrap();
    assert_eq!(outcome.policy, PolicyOutcome::Applied);
    outcome.completion.await.unwrap();

    assert_eq!(inventory.released(), vec![ResourceKey::node("node-1")]);
    assert_eq!(
        backend
            .address_group("ipgroup-node-env-prod")
            .unwrap()
            .provisioning_state,
        ProvisioningState::Succeeded
    );
}

#[tokio::test(start_paused = true)]
async fn failed_pushes_hold_gates_and_retry() {
    let _tracing = trace_init();
    let inventory = cluster();
    inventory.set_rules(vec![web_rule()]);
    inventory.gate("node-0");
    let backend = backend(Duration::ZERO);
    backend.fail_policy_pushes(true);
    let mut reconciler = Reconciler::new(
        inventory.clone(),
        backend.clone(),
        400,
        ReconcileMetrics::default(),
    );

    let outcome = reconciler
        .reconcile(&batch(ResourceKey::node("node-0")))
        .await
        .unwrap();
    assert_eq!(outcome.policy, PolicyOutcome::Failed);
    outcome.completion.await.unwrap();
    assert!(inventory.released().is_empty());
    assert!(backend.policy().is_none());

    backend.fail_policy_pushes(false);
    let outcome = reconciler
        .reconcile(&batch(ResourceKey::node("node-0")))
        .await
        .unwrap();
    assert_eq!(outcome.policy, PolicyOutcome::Applied);
    outcome.completion.await.unwrap();
    assert_eq!(inventory.released(), vec![ResourceKey::node("node-0")]);
}

#[tokio::test(start_paused = true)]
async fn rules_with_failed_groups_are_omitted() {
    let _tracing = trace_init();
    let inventory = cluster();
    inventory.0.lock().pods = vec![Pod {
        namespace: "default".to_string(),
        name: "jobs-0".to_string(),
        phase: PodPhase::Running,
        host_address: Some("10.0.0.3".to_string()),
        labels: btreemap! { "app".to_string() => "jobs".to_string() },
    }];
    inventory.set_rules(vec![web_rule(), pod_rule()]);
    let backend = backend(Duration::ZERO);
    backend.insert_address_group(
        "ipgroup-node-env-prod",
        vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
        ProvisioningState::Succeeded,
    );
    backend.fail_group_updates(true);
    let mut reconciler =
        Reconciler::new(inventory, backend.clone(), 400, ReconcileMetrics::default());

    let outcome = reconciler
        .reconcile(&batch(ResourceKey::rules("egress")))
        .await
        .unwrap();
    assert_eq!(outcome.policy, PolicyOutcome::Applied);

    let policy = backend.policy().unwrap();
    let names = policy
        .rule_collections
        .iter()
        .map(|c| c.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["allow-example"]);
}

#[tokio::test(start_paused = true)]
async fn inventory_errors_abort_the_pass() {
    let _tracing = trace_init();
    let inventory = cluster();
    inventory.0.lock().fail_lists = true;
    let backend = backend(Duration::ZERO);
    let metrics = ReconcileMetrics::default();
    let mut reconciler = Reconciler::new(inventory, backend.clone(), 400, metrics.clone());

    let res = reconciler.process(batch(ResourceKey::node("node-0"))).await;
    assert!(res.is_err());
    assert_eq!(metrics.passes.get(), 1);
    assert_eq!(metrics.failures.get(), 1);
    assert_eq!(backend.policy_pushes(), 0);
}

#[tokio::test(start_paused = true)]
async fn worker_coalesces_bursts() {
    let _tracing = trace_init();
    let inventory = cluster();
    inventory.set_rules(vec![web_rule()]);
    let backend = backend(Duration::ZERO);
    let metrics = ReconcileMetrics::default();
    let reconciler = Reconciler::new(inventory, backend.clone(), 400, metrics.clone());

    let (tx, rx) = queue::channel(16, QueueMetrics::default());
    let (_signal, shutdown) = drain::channel();
    tokio::spawn(Worker::new(rx, reconciler, Duration::from_secs(1), 64).run(shutdown));

    for node in ["node-0", "node-1", "node-2", "node-0"] {
        tx.enqueue(ResourceKey::node(node)).await.unwrap();
    }
    time::sleep(Duration::from_millis(100)).await;
    tx.enqueue(ResourceKey::rules("egress")).await.unwrap();
    time::sleep(Duration::from_secs(3)).await;

    // The burst is served by a single pass; the later change waits for the minimum interval.
    assert_eq!(metrics.passes.get(), 2);
    assert_eq!(backend.policy_pushes(), 1);
}

#[tokio::test(start_paused = true)]
async fn distinct_selectors_use_distinct_groups() {
    let _tracing = trace_init();
    let inventory = TestInventory::with_nodes(vec![
        node(
            "node-0",
            "10.0.0.1",
            btreemap! { "tier-a".to_string() => "b".to_string() },
        ),
        node(
            "node-1",
            "10.0.0.2",
            btreemap! { "tier".to_string() => "a-b".to_string() },
        ),
    ]);
    let mut web = web_rule();
    web.selectors = vec![Selector::node("tier-a", "b")];
    let mut db = pod_rule();
    db.selectors = vec![Selector::node("tier", "a-b")];
    inventory.set_rules(vec![web, db]);
    let backend = backend(Duration::ZERO);
    let mut reconciler =
        Reconciler::new(inventory, backend.clone(), 400, ReconcileMetrics::default());

    let outcome = reconciler
        .reconcile(&batch(ResourceKey::rules("egress")))
        .await
        .unwrap();
    assert_eq!(outcome.policy, PolicyOutcome::Applied);
    outcome.completion.await.unwrap();

    let web_group = backend
        .address_group(&Selector::node("tier-a", "b").address_group_name())
        .expect("group must exist");
    let db_group = backend
        .address_group(&Selector::node("tier", "a-b").address_group_name())
        .expect("group must exist");
    assert_ne!(web_group.id, db_group.id);
    assert_eq!(web_group.addresses, vec!["10.0.0.1"]);
    assert_eq!(db_group.addresses, vec!["10.0.0.2"]);

    let policy = backend.policy().unwrap();
    match &policy.collection("deny-db").unwrap().rules[0] {
        Rule::Network(rule) => assert_eq!(rule.source_ip_groups, vec![db_group.id.clone()]),
        rule => panic!("unexpected rule: {:?}", rule),
    }
    match &policy.collection("allow-example").unwrap().rules[0] {
        Rule::Application(rule) => {
            assert_eq!(rule.source_ip_groups, vec![web_group.id.clone()])
        }
        rule => panic!("unexpected rule: {:?}", rule),
    }
}

fn delayed(name: &str, delay: Duration) -> OperationHandle {
    OperationHandle::new(name, async move {
        time::sleep(delay).await;
        Ok(())
    })
}

#[tokio::test(start_paused = true)]
async fn operations_are_awaited_concurrently() {
    let _tracing = trace_init();
    let inventory = cluster();
    inventory.gate("node-0");
    let pending = PendingOperations::default();
    let operations = vec![
        delayed("ipgroup-a", Duration::from_secs(5)),
        delayed("ipgroup-b", Duration::from_secs(5)),
    ];
    for operation in &operations {
        pending.insert(operation.clone());
    }

    let start = Instant::now();
    coordinator::complete(
        inventory.clone(),
        pending.clone(),
        operations,
        vec![ResourceKey::node("node-0")],
    )
    .await;
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_secs(5), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(10), "{:?}", elapsed);
    assert!(pending.is_empty());
    assert_eq!(inventory.released(), vec![ResourceKey::node("node-0")]);
}

#[tokio::test(start_paused = true)]
async fn failed_operations_do_not_hold_gates() {
    let _tracing = trace_init();
    let inventory = cluster();
    inventory.gate("node-0");
    let pending = PendingOperations::default();
    let operations = vec![
        OperationHandle::failed("ipgroup-a", "provisioning failed"),
        delayed("ipgroup-b", Duration::from_secs(5)),
    ];
    for operation in &operations {
        pending.insert(operation.clone());
    }

    coordinator::complete(
        inventory.clone(),
        pending.clone(),
        operations,
        vec![ResourceKey::node("node-0")],
    )
    .await;

    assert!(pending.is_empty());
    assert_eq!(inventory.released(), vec![ResourceKey::node("node-0")]);
}

#[tokio::test(start_paused = true)]
async fn failed_group_operations_settle_independently() {
    let _tracing = trace_init();
    let inventory = cluster();
    inventory.0.lock().pods = vec![Pod {
        namespace: "default".to_string(),
        name: "jobs-0".to_string(),
        phase: PodPhase::Running,
        host_address: Some("10.0.0.3".to_string()),
        labels: btreemap! { "app".to_string() => "jobs".to_string() },
    }];
    inventory.set_rules(vec![web_rule(), pod_rule()]);
    inventory.gate("node-0");
    let backend = backend(Duration::from_secs(5));
    let failing = Selector::pod("app", "jobs").address_group_name();
    backend.fail_operations_on(&failing, true);
    let mut reconciler = Reconciler::new(
        inventory.clone(),
        backend.clone(),
        400,
        ReconcileMetrics::default(),
    );

    let start = Instant::now();
    let outcome = reconciler
        .reconcile(&batch(ResourceKey::node("node-0")))
        .await
        .unwrap();
    assert_eq!(outcome.policy, PolicyOutcome::Applied);
    outcome.completion.await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(10));

    assert_eq!(
        backend
            .address_group("ipgroup-node-env-prod")
            .unwrap()
            .provisioning_state,
        ProvisioningState::Succeeded
    );
    assert_eq!(
        backend.address_group(&failing).unwrap().provisioning_state,
        ProvisioningState::Failed
    );
    assert_eq!(inventory.released(), vec![ResourceKey::node("node-0")]);
    assert!(reconciler.pending().is_empty());
}
