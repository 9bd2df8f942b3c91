use {
    async_trait::async_trait,
    cirrus_controller::{
        ClusterController,
        Event,
        Handler,
        Kind,
        Operation,
        Phase,
        Registry,
        Rollback,
    },
    cirrus_core::{
        cluster::WithRole,
        compute::{fake, NodeIds, NodeMetadata, NodeState, RunScriptOptions, Script, Statement},
        predicate::Always,
        spec::StateStoreKind,
        Cluster,
        ClusterSpec,
        Credentials,
        Instance,
        InstanceTemplate,
    },
    cirrus_state::{DefaultFactory, StateStore as _},
    std::{
        collections::BTreeSet,
        sync::{Arc, Mutex},
    },
    tokio_util::sync::CancellationToken,
};

fn spec(templates: &str) -> ClusterSpec {
    let mut spec = ClusterSpec::new("hadoop", Credentials::new("cirrus", "key"))
        .with_templates(InstanceTemplate::parse_list(templates).unwrap());
    spec.state_store = StateStoreKind::Memory;
    spec
}

fn controller(provider: &fake::Provider, handlers: Registry) -> ClusterController<fake::Provider> {
    ClusterController::new(provider.clone(), DefaultFactory::new(), handlers)
}

fn tolerant() -> Registry {
    Registry::new().tolerate_unregistered(true)
}

fn node(id: &str, group: &str, n: u8) -> NodeMetadata {
    NodeMetadata {
        id: id.into(),
        group: Some(group.into()),
        state: NodeState::Running,
        hostname: None,
        public_addresses: vec![format!("198.51.100.{n}")],
        private_addresses: vec![format!("192.168.0.{n}")],
    }
}

/// Fails the "before" hook of a phase.
struct FailBefore(Phase);

#[async_trait]
impl Handler for FailBefore {
    async fn before(&self, event: &mut Event<'_>) -> anyhow::Result<()> {
        if event.phase == self.0 {
            anyhow::bail!("injected {} failure", self.0);
        }
        Ok(())
    }
}

/// Records the phases it has been invoked for.
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<String>>>);

#[async_trait]
impl Handler for Recorder {
    async fn before(&self, event: &mut Event<'_>) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(format!("before {}", event.phase));
        Ok(())
    }

    async fn after(&self, event: &Event<'_>) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(format!("after {}", event.phase));
        Ok(())
    }
}

#[tokio::test]
async fn bootstrap_persists_state() {
    let provider = fake::Provider::new();
    let controller = controller(&provider, tolerant());
    let spec = spec("1 namenode, 1 datanode");

    let cluster = controller.bootstrap_cluster(&spec).await.unwrap();
    assert_eq!(cluster.len(), 2);

    let store = controller.state_store(&spec);
    let loaded = store.load().await.unwrap();
    assert_eq!(loaded, cluster);

    let namenode = loaded
        .instance_matching(&WithRole("namenode".into()))
        .require()
        .unwrap();
    assert_eq!(namenode.roles().len(), 1);
    assert!(namenode.node().is_none());
    assert_eq!(namenode.credentials().user, "cirrus");

    let datanode = loaded
        .instance_matching(&WithRole("datanode".into()))
        .require()
        .unwrap();
    assert_ne!(namenode.id(), datanode.id());
}

#[tokio::test]
async fn persisted_record_format() {
    let provider = fake::Provider::new();
    let stores = DefaultFactory::new();
    let controller = ClusterController::new(provider.clone(), stores.clone(), tolerant());
    let spec = spec("1 namenode, 1 datanode");

    let _ = controller.bootstrap_cluster(&spec).await.unwrap();

    let record = stores.memory_records().get("hadoop").unwrap();
    let lines: Vec<_> = record.lines().collect();
    assert_eq!(lines.len(), 2);

    let fields: BTreeSet<_> = lines
        .iter()
        .map(|line| line.split('\t').nth(1).unwrap())
        .collect();
    assert_eq!(fields, BTreeSet::from(["datanode", "namenode"]));
    assert!(lines.iter().all(|line| line.split('\t').count() == 4));
}

#[tokio::test]
async fn reconciliation_uses_live_addresses_and_prior_roles() {
    let provider = fake::Provider::new();
    provider.add_node(node("a", "hadoop", 1));
    provider.add_node(node("b", "hadoop", 2));
    provider.add_node(node("c", "hbase", 3));
    provider.add_node(NodeMetadata {
        state: NodeState::Pending,
        ..node("d", "hadoop", 4)
    });

    let controller = controller(&provider, tolerant());
    let spec = spec("2 worker");

    let creds = spec.credentials.clone();
    let prior = Cluster::new([Instance::new("a", ["worker"], creds)
        .with_addresses(Some("203.0.113.250".into()), None)]);

    let cluster = controller.instances(&spec, Some(&prior)).await.unwrap();
    assert_eq!(cluster.len(), 2);

    let a = cluster.instance("a").unwrap();
    assert!(a.has_role("worker"));
    assert_eq!(a.roles().len(), 1);
    assert_eq!(a.public_address(), Some("198.51.100.1"));
    assert_eq!(a.private_address(), Some("192.168.0.1"));
    assert!(a.node().is_some());

    let b = cluster.instance("b").unwrap();
    assert!(b.roles().is_empty());
    assert_eq!(b.public_address(), Some("198.51.100.2"));

    let without_prior = controller.instances(&spec, None).await.unwrap();
    assert!(without_prior.instances().all(|i| i.roles().is_empty()));
}

#[tokio::test]
async fn services_run_on_reconciled_cluster() {
    let provider = fake::Provider::new();
    let recorder = Recorder::default();
    let controller = controller(
        &provider,
        Registry::new().register("namenode", recorder.clone()),
    );
    let spec = spec("1 namenode");

    let bootstrapped = controller.bootstrap_cluster(&spec).await.unwrap();

    let cluster = controller.configure_services(&spec).await.unwrap();
    assert_eq!(cluster, bootstrapped);

    let _ = controller.start_services(&spec).await.unwrap();
    let _ = controller.stop_services(&spec).await.unwrap();
    let _ = controller.cleanup_cluster(&spec).await.unwrap();

    assert_eq!(recorder.0.lock().unwrap().clone(), [
        "before bootstrap",
        "after bootstrap",
        "before configure",
        "after configure",
        "before start",
        "after start",
        "before stop",
        "after stop",
        "before cleanup",
        "after cleanup",
    ]);
}

#[tokio::test]
async fn reloading_requires_state() {
    let provider = fake::Provider::new();
    let controller = controller(&provider, tolerant());

    let err = controller
        .configure_services(&spec("1 namenode"))
        .await
        .unwrap_err();

    assert_eq!(err.action, Operation::Phase(Phase::Configure));
    assert_eq!(err.cluster, "hadoop");
    assert!(matches!(err.kind, Kind::Storage(cirrus_state::Error::NotFound(_))));
}

#[tokio::test]
async fn handlers_see_other_roles() {
    struct Datanode(Arc<Mutex<Option<String>>>);

    #[async_trait]
    impl Handler for Datanode {
        async fn before(&self, event: &mut Event<'_>) -> anyhow::Result<()> {
            if event.phase != Phase::Configure {
                return Ok(());
            }

            let namenode = event
                .cluster
                .instance_matching(&WithRole("namenode".into()))
                .require()?;

            let address = namenode.private_address().unwrap_or_default().to_string();
            event.add_statement(Statement::new("datanode", format!("NAMENODE={address}")));
            *self.0.lock().unwrap() = Some(address);
            Ok(())
        }
    }

    let provider = fake::Provider::new();
    let seen = Arc::new(Mutex::new(None));
    let controller = controller(
        &provider,
        Registry::new()
            .register("datanode", Datanode(seen.clone()))
            .tolerate_unregistered(true),
    );
    let spec = spec("1 namenode, 2 datanode");

    let cluster = controller.launch_cluster(&spec).await.unwrap();
    let namenode = cluster
        .instance_matching(&WithRole("namenode".into()))
        .require()
        .unwrap();

    let address = seen.lock().unwrap().clone().unwrap();
    assert_eq!(Some(address.as_str()), namenode.private_address());

    let configure_scripts: Vec<_> = provider
        .executions()
        .into_iter()
        .filter(|e| e.options.task_name.as_deref() == Some("configure"))
        .collect();
    assert_eq!(configure_scripts.len(), 2);
    assert!(configure_scripts
        .iter()
        .all(|e| e.script.render().contains(&format!("NAMENODE={address}"))));
}

#[tokio::test]
async fn failed_launch_is_rolled_back() {
    let provider = fake::Provider::new();
    let stores = DefaultFactory::new();
    let controller = ClusterController::new(
        provider.clone(),
        stores.clone(),
        Registry::new()
            .register("datanode", FailBefore(Phase::Configure))
            .tolerate_unregistered(true),
    );
    let spec = spec("1 namenode, 2 datanode");

    let err = controller.launch_cluster(&spec).await.unwrap_err();

    assert_eq!(err.source.action, Operation::Phase(Phase::Configure));
    assert!(matches!(&err.source.kind, Kind::Handler(e) if e.role == "datanode"));
    assert!(matches!(err.rollback, Rollback::Completed));

    // Every bootstrapped node is gone and so is the record.
    assert!(provider.nodes().is_empty());
    assert_eq!(provider.destroyed().len(), 3);
    assert!(stores.memory_records().get("hadoop").is_none());
}

#[tokio::test]
async fn failed_rollback_keeps_the_original_error() {
    let provider = fake::Provider::new();
    provider.fail_destruction();

    let stores = DefaultFactory::new();
    let controller = ClusterController::new(
        provider.clone(),
        stores.clone(),
        Registry::new()
            .register("datanode", FailBefore(Phase::Configure))
            .tolerate_unregistered(true),
    );
    let spec = spec("1 namenode, 2 datanode");

    let err = controller.launch_cluster(&spec).await.unwrap_err();

    assert_eq!(err.source.action, Operation::Phase(Phase::Configure));
    assert!(matches!(&err.source.kind, Kind::Handler(e) if e.role == "datanode"));

    let Rollback::Failed(rollback) = &err.rollback else {
        panic!("unexpected rollback: {:?}", err.rollback);
    };
    assert_eq!(rollback.action, Operation::Phase(Phase::Destroy));
    assert!(matches!(rollback.kind, Kind::Provider(_)));
    assert!(err.to_string().contains("orphaned"));

    // Nothing was terminated, so the record of the nodes is kept.
    assert_eq!(provider.nodes().len(), 3);
    assert_eq!(controller.state_store(&spec).load().await.unwrap().len(), 3);
}

#[tokio::test]
async fn failed_bootstrap_is_rolled_back() {
    let provider = fake::Provider::new();
    provider.limit_creation(1);

    let controller = controller(&provider, tolerant());
    let spec = spec("1 namenode, 3 datanode");

    let err = controller.launch_cluster(&spec).await.unwrap_err();

    assert!(matches!(
        err.source.kind,
        Kind::InsufficientNodes {
            created: 1,
            required: 3,
            ..
        }
    ));
    assert!(matches!(err.rollback, Rollback::Completed));

    // The nodes were never recorded, they are found by their group.
    assert!(provider.nodes().is_empty());
    assert_eq!(provider.destroyed().len(), 2);
}

#[tokio::test]
async fn rollback_disabled() {
    let provider = fake::Provider::new();
    let controller = controller(
        &provider,
        Registry::new()
            .register("namenode", FailBefore(Phase::Start))
            .tolerate_unregistered(true),
    );
    let mut spec = spec("1 namenode, 1 datanode");
    spec.terminate_all_on_launch_failure = false;

    let err = controller.launch_cluster(&spec).await.unwrap_err();

    assert_eq!(err.source.action, Operation::Phase(Phase::Start));
    assert!(matches!(err.rollback, Rollback::Skipped));
    assert!(err.to_string().contains("inconsistent state"));

    assert_eq!(provider.nodes().len(), 2);
    assert!(provider.destroyed().is_empty());

    // Bootstrap state is still there to clean up manually.
    assert_eq!(controller.state_store(&spec).load().await.unwrap().len(), 2);
}

#[tokio::test]
async fn destroy_instance_keeps_the_others() {
    let provider = fake::Provider::new();
    let controller = controller(&provider, tolerant());
    let spec = spec("1 namenode, 2 datanode");

    let cluster = controller.bootstrap_cluster(&spec).await.unwrap();
    let target = cluster
        .instance_matching(&WithRole("namenode".into()))
        .require()
        .unwrap()
        .id()
        .to_string();

    controller.destroy_instance(&spec, &target).await.unwrap();

    assert_eq!(provider.destroyed(), [target.clone()]);

    let loaded = controller.state_store(&spec).load().await.unwrap();
    assert_eq!(loaded.len(), 2);
    assert!(!loaded.contains(&target));

    for instance in loaded.instances() {
        assert_eq!(Some(instance), cluster.instance(instance.id()));
    }
}

#[tokio::test]
async fn lookup_of_single_instance() {
    let provider = fake::Provider::new();
    let controller = controller(&provider, tolerant());
    let spec = spec("2 datanode");

    let cluster = controller.bootstrap_cluster(&spec).await.unwrap();
    let id = cluster.instances().next().unwrap().id().to_string();

    let instance = controller.instance(&spec, &id).await.unwrap();
    assert!(instance.has_role("datanode"));

    let err = controller.instance(&spec, "node-42").await.unwrap_err();
    assert!(matches!(err.kind, Kind::Lookup(_)));
}

#[tokio::test]
async fn destroy_is_idempotent() {
    let provider = fake::Provider::new();
    let stores = DefaultFactory::new();
    let controller = ClusterController::new(provider.clone(), stores.clone(), tolerant());
    let spec = spec("1 namenode, 2 datanode");

    let _ = controller.bootstrap_cluster(&spec).await.unwrap();

    controller.destroy_cluster(&spec).await.unwrap();
    assert!(provider.nodes().is_empty());
    assert!(stores.memory_records().get("hadoop").is_none());

    controller.destroy_cluster(&spec).await.unwrap();
    assert_eq!(provider.destroyed().len(), 3);
}

#[tokio::test]
async fn destroy_with_corrupt_state() {
    let provider = fake::Provider::new();
    let stores = DefaultFactory::new();
    let controller = ClusterController::new(provider.clone(), stores.clone(), tolerant());
    let spec = spec("2 datanode");

    let _ = controller.bootstrap_cluster(&spec).await.unwrap();
    stores.memory_records().set("hadoop", "garbage\n");

    controller.destroy_cluster(&spec).await.unwrap();
    assert!(provider.nodes().is_empty());
}

#[tokio::test]
async fn destroy_explicit_cluster_keeps_the_record() {
    let provider = fake::Provider::new();
    let controller = controller(&provider, tolerant());
    let spec = spec("1 namenode");

    let cluster = controller.bootstrap_cluster(&spec).await.unwrap();
    let cluster = controller.destroy_cluster_on(&spec, cluster).await.unwrap();

    assert!(cluster.is_empty());
    assert!(provider.nodes().is_empty());
    assert_eq!(controller.state_store(&spec).load().await.unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_roles() {
    let provider = fake::Provider::new();
    let spec = spec("1 namenode");

    let err = controller(&provider, Registry::new())
        .bootstrap_cluster(&spec)
        .await
        .unwrap_err();
    assert!(matches!(err.kind, Kind::Config(_)));
    assert!(provider.nodes().is_empty());

    let _ = controller(&provider, tolerant())
        .bootstrap_cluster(&spec)
        .await
        .unwrap();
}

#[tokio::test]
async fn interrupted_launch_is_not_rolled_back() {
    struct Interrupt(CancellationToken);

    #[async_trait]
    impl Handler for Interrupt {
        async fn before(&self, event: &mut Event<'_>) -> anyhow::Result<()> {
            if event.phase == Phase::Configure {
                self.0.cancel();
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    let provider = fake::Provider::new();
    let token = CancellationToken::new();
    let controller = controller(
        &provider,
        Registry::new().register("namenode", Interrupt(token.clone())),
    )
    .with_cancellation(token);
    let spec = spec("1 namenode");

    let err = controller.launch_cluster(&spec).await.unwrap_err();

    assert!(err.source.is_interrupted());
    assert_eq!(err.source.action, Operation::Phase(Phase::Configure));
    assert!(matches!(err.rollback, Rollback::Skipped));

    // Bootstrapped state survives the interruption.
    assert_eq!(provider.nodes().len(), 1);
    assert_eq!(controller.state_store(&spec).load().await.unwrap().len(), 1);
}

#[tokio::test]
async fn bootstrapped_nodes_are_recorded_when_interrupted() {
    struct InterruptAfter(CancellationToken);

    #[async_trait]
    impl Handler for InterruptAfter {
        async fn after(&self, event: &Event<'_>) -> anyhow::Result<()> {
            if event.phase == Phase::Bootstrap {
                self.0.cancel();
            }
            Ok(())
        }
    }

    let provider = fake::Provider::new();
    let token = CancellationToken::new();
    let controller = controller(
        &provider,
        Registry::new()
            .register("namenode", InterruptAfter(token.clone()))
            .tolerate_unregistered(true),
    )
    .with_cancellation(token);
    let spec = spec("1 namenode, 1 datanode");

    let err = controller.launch_cluster(&spec).await.unwrap_err();

    assert!(err.source.is_interrupted());
    assert_eq!(err.source.action, Operation::Phase(Phase::Bootstrap));
    assert!(matches!(err.rollback, Rollback::Skipped));

    assert_eq!(provider.nodes().len(), 2);
    let recorded = controller.state_store(&spec).load().await.unwrap();
    assert_eq!(recorded.len(), 2);
    assert!(provider.nodes().iter().all(|node| recorded.contains(&node.id)));
}

#[tokio::test]
async fn run_script_on_cluster_nodes() {
    let provider = fake::Provider::new();
    provider.add_node(node("a", "hadoop", 1));
    provider.add_node(node("b", "hadoop", 2));
    provider.add_node(node("c", "hbase", 3));

    let controller = controller(&provider, tolerant());
    let spec = spec("2 worker");
    let script: Script = [Statement::new("uptime", "uptime")].into_iter().collect();

    let results = controller
        .run_script_on_nodes_matching(&spec, &Always, &script, None)
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, resp)| resp.is_success()));

    let results = controller
        .run_script_on_nodes_matching(
            &spec,
            &NodeIds::new(["b", "c"]),
            &script,
            Some(RunScriptOptions::default().run_as_root(true)),
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0.id, "b");

    let executions = provider.executions();
    assert_eq!(executions.len(), 3);
    assert!(executions.iter().all(|e| e.options.credentials.as_ref() == Some(&spec.credentials)));
    assert!(executions[2].options.run_as_root);
    assert!(!executions[0].options.run_as_root);
    assert!(!executions[0].options.wrap_in_init_script);

    let other = Arc::new(Credentials::new("admin", "other"));
    let _ = controller
        .run_script_on_nodes_matching(
            &spec,
            &NodeIds::new(["a"]),
            &script,
            Some(RunScriptOptions::default().with_credentials(other.clone())),
        )
        .await
        .unwrap();
    assert_eq!(provider.executions()[3].options.credentials, Some(other));
}

#[tokio::test]
#[allow(deprecated)]
async fn raw_nodes() {
    let provider = fake::Provider::new();
    provider.add_node(node("a", "hadoop", 1));
    provider.add_node(node("c", "hbase", 3));

    let nodes = controller(&provider, tolerant())
        .nodes(&spec("1 worker"))
        .await
        .unwrap();

    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].id, "a");
}
