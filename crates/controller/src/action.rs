//! Lifecycle phases executed against a [`Cluster`].
//!
//! Every phase has the same shape:
//! 1. "before" hooks of all the roles, collecting a [`Script`] per
//!    [`InstanceTemplate`]. Templates are processed concurrently, the roles
//!    of a template sequentially.
//! 2. Main work of the phase, once every "before" hook has completed.
//! 3. "after" hooks of all the roles, seeing the [`Cluster`] produced by the
//!    main work.

use {
    crate::{
        error::Kind,
        handler::{self, Event, Handler, Phase, Registry, Stage},
    },
    cirrus_core::{
        cluster::{WithAllRoles, WithIds},
        compute::{Compute, InGroup, NodeTemplate, RunScriptOptions, Script},
        Cluster,
        ClusterSpec,
        Instance,
        InstanceTemplate,
        Predicate as _,
    },
    futures::future::try_join_all,
    indexmap::IndexSet,
    std::sync::Arc,
};

type Handlers<'a> = Vec<(&'a str, &'a Arc<dyn Handler>)>;

/// Executes a [`Phase`] and returns the resulting [`Cluster`].
pub(crate) async fn execute<C: Compute>(
    phase: Phase,
    compute: &C,
    registry: &Registry,
    spec: &ClusterSpec,
    cluster: Cluster,
) -> Result<Cluster, Kind> {
    let templates = spec
        .instance_templates
        .iter()
        .map(|template| Ok((template, registry.resolve(template)?)))
        .collect::<Result<Vec<_>, handler::UnknownRoleError>>()?;

    tracing::info!(
        cluster = %spec.cluster_name,
        %phase,
        templates = templates.len(),
        instances = cluster.len(),
        "Executing phase"
    );

    let scripts = try_join_all(
        templates
            .iter()
            .map(|(template, handlers)| before(phase, spec, &cluster, template, handlers)),
    )
    .await?;

    let scripts: Vec<_> = templates
        .iter()
        .map(|(template, _)| *template)
        .zip(scripts)
        .collect();

    let cluster = match phase {
        Phase::Bootstrap => bootstrap(compute, spec, cluster, &scripts).await?,
        Phase::Destroy => destroy(compute, spec, cluster, &scripts).await?,
        Phase::Configure | Phase::Start | Phase::Stop | Phase::Cleanup => {
            run_scripts(phase, compute, spec, &cluster, &scripts).await?;
            cluster
        }
    };

    try_join_all(
        templates
            .iter()
            .map(|(template, handlers)| after(phase, spec, &cluster, template, handlers)),
    )
    .await?;

    tracing::info!(
        cluster = %spec.cluster_name,
        %phase,
        instances = cluster.len(),
        "Phase completed"
    );

    Ok(cluster)
}

async fn before(
    phase: Phase,
    spec: &ClusterSpec,
    cluster: &Cluster,
    template: &InstanceTemplate,
    handlers: &Handlers<'_>,
) -> Result<Script, Kind> {
    let mut event = Event::new(phase, spec, cluster, template);

    for (role, handler) in handlers {
        handler
            .before(&mut event)
            .await
            .map_err(|err| handler::Error::new(role, phase, Stage::Before, err))?;
    }

    Ok(event.into_script())
}

async fn after(
    phase: Phase,
    spec: &ClusterSpec,
    cluster: &Cluster,
    template: &InstanceTemplate,
    handlers: &Handlers<'_>,
) -> Result<(), Kind> {
    let event = Event::new(phase, spec, cluster, template);

    for (role, handler) in handlers {
        handler
            .after(&event)
            .await
            .map_err(|err| handler::Error::new(role, phase, Stage::After, err))?;
    }

    Ok(())
}

/// Creates the nodes of every template, using the collected scripts as init
/// scripts.
async fn bootstrap<C: Compute>(
    compute: &C,
    spec: &ClusterSpec,
    cluster: Cluster,
    scripts: &[(&InstanceTemplate, Script)],
) -> Result<Cluster, Kind> {
    let created = try_join_all(scripts.iter().map(|(template, script)| async move {
        let node_template = NodeTemplate {
            roles: template.roles().clone(),
            hardware: template.hardware.clone(),
            image: template.image.clone(),
            location: template.location.clone(),
            firewall_rules: spec.firewall_rules.clone(),
            init_script: script.clone(),
            credentials: Some(spec.credentials.clone()),
        };

        let nodes = compute
            .create_nodes(&spec.cluster_name, template.count(), &node_template)
            .await?;

        tracing::info!(
            cluster = %spec.cluster_name,
            %template,
            created = nodes.len(),
            "Nodes created"
        );

        if nodes.len() < template.min_count() {
            return Err(Kind::InsufficientNodes {
                template: template.to_string(),
                created: nodes.len(),
                required: template.min_count(),
            });
        }

        Ok::<_, Kind>(
            nodes
                .into_iter()
                .map(|node| Instance::from_node(node, template.roles(), spec.credentials.clone()))
                .collect::<Vec<_>>(),
        )
    }))
    .await?;

    Ok(cluster.with_instances(created.into_iter().flatten()))
}

/// Runs the collected scripts on the instances having all of the roles of
/// their template.
async fn run_scripts<C: Compute>(
    phase: Phase,
    compute: &C,
    spec: &ClusterSpec,
    cluster: &Cluster,
    scripts: &[(&InstanceTemplate, Script)],
) -> Result<(), Kind> {
    let mut runs = Vec::new();

    for (template, script) in scripts {
        if script.is_empty() {
            continue;
        }

        let targets = WithAllRoles::new(template.roles());
        runs.extend(
            cluster
                .instances()
                .filter(|i| targets.test(i))
                .map(|i| (i, script)),
        );
    }

    if runs.is_empty() {
        tracing::debug!(cluster = %spec.cluster_name, %phase, "Nothing to run");
        return Ok(());
    }

    let options = &RunScriptOptions::default()
        .with_credentials(spec.credentials.clone())
        .run_as_root(true)
        .task_name(phase.to_string());

    try_join_all(runs.into_iter().map(|(instance, script)| async move {
        let resp = compute.run_script(instance.id(), script, options).await?;

        if !resp.is_success() {
            return Err(Kind::ScriptFailed {
                instance: instance.id().to_string(),
                status: resp.exit_status,
                stderr: resp.error,
            });
        }

        tracing::debug!(instance = instance.id(), %phase, "Script succeeded");
        Ok::<_, Kind>(())
    }))
    .await?;

    Ok(())
}

/// Destroys the instances of the [`Cluster`] together with every node the
/// provider still has in the group of the cluster.
async fn destroy<C: Compute>(
    compute: &C,
    spec: &ClusterSpec,
    cluster: Cluster,
    scripts: &[(&InstanceTemplate, Script)],
) -> Result<Cluster, Kind> {
    if let Err(err) = run_scripts(Phase::Destroy, compute, spec, &cluster, scripts).await {
        tracing::warn!(
            cluster = %spec.cluster_name,
            %err,
            "Destroy scripts failed, destroying the nodes anyway"
        );
    }

    let mut ids: IndexSet<String> = cluster.instances().map(|i| i.id().to_string()).collect();

    let listed = compute
        .list_nodes(&InGroup::new(&spec.cluster_name))
        .await?;
    ids.extend(listed.into_iter().map(|node| node.id));

    tracing::info!(cluster = %spec.cluster_name, nodes = ids.len(), "Destroying nodes");

    try_join_all(ids.iter().map(|id| compute.destroy_node(id))).await?;

    Ok(cluster.without_instances_matching(&WithIds::new(ids)))
}

#[cfg(test)]
mod test {
    use {
        super::*,
        async_trait::async_trait,
        cirrus_core::{
            compute::{fake, Statement},
            Credentials,
        },
        std::sync::Mutex,
    };

    #[derive(Clone, Default)]
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
    }

    struct Recording {
        role: &'static str,
        recorder: Recorder,
    }

    impl Recorder {
        fn handler(&self, role: &'static str) -> Recording {
            Recording {
                role,
                recorder: self.clone(),
            }
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Handler for Recording {
        async fn before(&self, event: &mut Event<'_>) -> anyhow::Result<()> {
            // Let the other templates progress in between.
            tokio::task::yield_now().await;

            self.recorder
                .log
                .lock()
                .unwrap()
                .push(format!("before {} {}", event.phase, self.role));

            event.add_statement(Statement::new(self.role, format!("echo {}", self.role)));
            Ok(())
        }

        async fn after(&self, event: &Event<'_>) -> anyhow::Result<()> {
            self.recorder
                .log
                .lock()
                .unwrap()
                .push(format!("after {} {}", event.phase, self.role));
            Ok(())
        }
    }

    fn spec() -> ClusterSpec {
        ClusterSpec::new("hadoop", Credentials::new("cirrus", "key")).with_templates([
            InstanceTemplate::new(1, ["namenode", "jobtracker"]),
            InstanceTemplate::new(2, ["datanode"]),
        ])
    }

    fn registry(recorder: &Recorder) -> Registry {
        Registry::new()
            .register("namenode", recorder.handler("namenode"))
            .register("jobtracker", recorder.handler("jobtracker"))
            .register("datanode", recorder.handler("datanode"))
    }

    #[tokio::test]
    async fn bootstrap_creates_instances_with_init_scripts() {
        let provider = fake::Provider::new();
        let recorder = Recorder::default();
        let spec = spec();

        let cluster = execute(
            Phase::Bootstrap,
            &provider,
            &registry(&recorder),
            &spec,
            Cluster::empty(),
        )
        .await
        .unwrap();

        assert_eq!(cluster.len(), 3);
        assert_eq!(cluster.instances_matching(&WithAllRoles::new(["datanode"])).count(), 2);

        let namenode = cluster
            .instance_matching(&WithAllRoles::new(["namenode"]))
            .require()
            .unwrap();
        assert!(namenode.has_role("jobtracker"));
        assert!(namenode.node().is_some());
        assert!(namenode.public_address().is_some());

        let init_scripts = provider.executions();
        assert_eq!(init_scripts.len(), 3);

        let names: Vec<_> = init_scripts
            .iter()
            .find(|e| e.node_id == namenode.id())
            .unwrap()
            .script
            .statements()
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, ["namenode", "jobtracker"]);
    }

    #[tokio::test]
    async fn bootstrap_passes_template_hints() {
        let provider = fake::Provider::new();
        let mut template = InstanceTemplate::new(1, ["namenode"]);
        template.hardware = Some("m5.large".into());
        template.location = Some("rack-1".into());

        let mut spec = ClusterSpec::new("hadoop", Credentials::new("cirrus", "key"))
            .with_templates([template]);
        spec.firewall_rules = vec!["50070".into()];

        let registry = Registry::new().tolerate_unregistered(true);
        let _ = execute(Phase::Bootstrap, &provider, &registry, &spec, Cluster::empty())
            .await
            .unwrap();

        let templates = provider.node_templates();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].hardware.as_deref(), Some("m5.large"));
        assert_eq!(templates[0].image, None);
        assert_eq!(templates[0].location.as_deref(), Some("rack-1"));
        assert_eq!(templates[0].firewall_rules, ["50070"]);
        assert!(templates[0].roles.contains("namenode"));
    }

    #[tokio::test]
    async fn before_hooks_are_a_barrier() {
        let provider = fake::Provider::new();
        let recorder = Recorder::default();

        let _ = execute(
            Phase::Bootstrap,
            &provider,
            &registry(&recorder),
            &spec(),
            Cluster::empty(),
        )
        .await
        .unwrap();

        let log = recorder.log();
        assert_eq!(log.len(), 6);

        let last_before = log.iter().rposition(|e| e.starts_with("before")).unwrap();
        let first_after = log.iter().position(|e| e.starts_with("after")).unwrap();
        assert!(last_before < first_after);

        // Roles of a template are processed in declaration order.
        let namenode = log.iter().position(|e| e == "before bootstrap namenode");
        let jobtracker = log.iter().position(|e| e == "before bootstrap jobtracker");
        assert!(namenode < jobtracker);
    }

    #[tokio::test]
    async fn scripts_run_on_instances_with_all_template_roles() {
        let provider = fake::Provider::new();
        let recorder = Recorder::default();
        let registry = registry(&recorder);
        let spec = spec();

        let cluster = execute(Phase::Bootstrap, &provider, &registry, &spec, Cluster::empty())
            .await
            .unwrap();
        let before = provider.executions().len();

        let configured = execute(Phase::Configure, &provider, &registry, &spec, cluster.clone())
            .await
            .unwrap();
        assert_eq!(configured, cluster);

        let executions = &provider.executions()[before..];
        assert_eq!(executions.len(), 3);
        assert!(executions.iter().all(|e| e.options.run_as_root));
        assert!(executions
            .iter()
            .all(|e| e.options.task_name.as_deref() == Some("configure")));
    }

    #[tokio::test]
    async fn failed_script() {
        let provider = fake::Provider::new();
        let recorder = Recorder::default();
        let registry = registry(&recorder);
        let spec = spec();

        let cluster = execute(Phase::Bootstrap, &provider, &registry, &spec, Cluster::empty())
            .await
            .unwrap();

        provider.fail_scripts_containing("echo datanode");

        let res = execute(Phase::Start, &provider, &registry, &spec, cluster).await;
        assert!(matches!(res, Err(Kind::ScriptFailed { status: 1, .. })));

        // "after" hooks don't run if the main work fails.
        assert!(!recorder.log().iter().any(|e| e.starts_with("after start")));
    }

    #[tokio::test]
    async fn insufficient_nodes() {
        let provider = fake::Provider::new();
        provider.limit_creation(1);

        let spec = ClusterSpec::new("hadoop", Credentials::new("cirrus", "key")).with_templates([
            InstanceTemplate::new(3, ["datanode"]).with_min_count(2),
        ]);
        let registry = Registry::new().tolerate_unregistered(true);

        let res = execute(Phase::Bootstrap, &provider, &registry, &spec, Cluster::empty()).await;
        assert!(matches!(
            res,
            Err(Kind::InsufficientNodes {
                created: 1,
                required: 2,
                ..
            })
        ));

        let spec = ClusterSpec::new("hadoop", Credentials::new("cirrus", "key")).with_templates([
            InstanceTemplate::new(3, ["datanode"]).with_min_count(1),
        ]);
        let cluster = execute(Phase::Bootstrap, &provider, &registry, &spec, Cluster::empty())
            .await
            .unwrap();
        assert_eq!(cluster.len(), 1);
    }

    #[tokio::test]
    async fn destroy_includes_untracked_group_nodes() {
        let provider = fake::Provider::new();
        let registry = Registry::new().tolerate_unregistered(true);
        let spec = spec();

        let cluster = execute(Phase::Bootstrap, &provider, &registry, &spec, Cluster::empty())
            .await
            .unwrap();

        // Only one of the instances is known.
        let known = cluster.instances().next().unwrap().clone();
        let cluster = Cluster::new([known]);

        let cluster = execute(Phase::Destroy, &provider, &registry, &spec, cluster)
            .await
            .unwrap();

        assert!(cluster.is_empty());
        assert!(provider.nodes().is_empty());
        assert_eq!(provider.destroyed().len(), 3);

        // Destroying again is not an error.
        let cluster = execute(Phase::Destroy, &provider, &registry, &spec, cluster)
            .await
            .unwrap();
        assert!(cluster.is_empty());
    }

    #[tokio::test]
    async fn unknown_role() {
        let provider = fake::Provider::new();
        let registry = Registry::new().register("namenode", Recorder::default().handler("namenode"));

        let res = execute(Phase::Configure, &provider, &registry, &spec(), Cluster::empty()).await;
        assert!(matches!(res, Err(Kind::Config(_))));
    }
}
