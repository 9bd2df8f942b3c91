//! Orchestration of the cluster lifecycle.
//!
//! [`ClusterController`] sequences the lifecycle phases, keeps the
//! [`StateStore`] in sync with the provisioned hardware and rolls back failed
//! launches.

pub use {
    error::{Error, Kind, LaunchError, Operation, Rollback},
    handler::{Event, Handler, Phase, Registry, Stage},
};
use {
    cirrus_core::{
        cluster::WithIds,
        compute::{
            Compute as _,
            ExecResponse,
            NodeMetadata,
            RunScriptOptions,
            RunningInGroup,
            Script,
        },
        Cluster,
        ClusterSpec,
        Connector,
        Instance,
        Predicate,
    },
    cirrus_state::{DefaultFactory, Factory, StateStore},
    lock::ClusterLocks,
    std::future::Future,
    tokio_util::sync::CancellationToken,
};

mod action;
mod error;
pub mod handler;
mod lock;

/// Top-level orchestrator of the cluster lifecycle.
///
/// Bootstrap, destroy, destroy-instance and launch operations on the same
/// cluster name are serialized.
#[derive(Debug)]
pub struct ClusterController<C, F = DefaultFactory> {
    connector: C,
    stores: F,
    handlers: Registry,
    locks: ClusterLocks,
    token: CancellationToken,
}

impl<C, F> ClusterController<C, F>
where
    C: Connector,
    F: Factory,
{
    pub fn new(connector: C, stores: F, handlers: Registry) -> Self {
        Self {
            connector,
            stores,
            handlers,
            locks: ClusterLocks::default(),
            token: CancellationToken::new(),
        }
    }

    /// Makes every operation fail with [`Kind::Interrupted`] once the provided
    /// [`CancellationToken`] is cancelled.
    ///
    /// In-flight provider operations are aborted, state persisted before the
    /// interruption is left intact.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Returns the [`StateStore`] of the cluster.
    pub fn state_store(&self, spec: &ClusterSpec) -> F::Store {
        self.stores.create(spec)
    }

    /// Bootstraps, configures and starts the cluster.
    ///
    /// On failure all of the nodes of the cluster are destroyed, unless
    /// [`ClusterSpec::terminate_all_on_launch_failure`] is unset or the
    /// launch has been interrupted. The original error is returned either
    /// way.
    pub async fn launch_cluster(&self, spec: &ClusterSpec) -> Result<Cluster, LaunchError> {
        let _guard = self.locks.lock(&spec.cluster_name).await;

        let res = async {
            let cluster = self.bootstrap(spec).await?;
            let cluster = self.configure_services_on(spec, cluster).await?;
            self.start_services_on(spec, cluster).await
        }
        .await;

        let source = match res {
            Ok(cluster) => {
                tracing::info!(
                    cluster = %spec.cluster_name,
                    instances = cluster.len(),
                    "Cluster launched"
                );
                return Ok(cluster);
            }
            Err(err) => err,
        };

        let rollback = if source.is_interrupted() {
            tracing::warn!(
                cluster = %spec.cluster_name,
                "Launch interrupted, nodes are not terminated"
            );
            Rollback::Skipped
        } else if spec.terminate_all_on_launch_failure {
            tracing::error!(
                cluster = %spec.cluster_name,
                err = %source,
                kind = %source.kind,
                "Unable to launch the cluster. Terminating all nodes."
            );

            match self.destroy(spec).await {
                Ok(()) => Rollback::Completed,
                Err(err) => {
                    tracing::error!(
                        cluster = %spec.cluster_name,
                        %err,
                        kind = %err.kind,
                        "Failed to terminate the nodes, there might be orphaned nodes"
                    );
                    Rollback::Failed(err)
                }
            }
        } else {
            tracing::error!(
                cluster = %spec.cluster_name,
                err = %source,
                kind = %source.kind,
                "*CRITICAL* the cluster failed to launch and the automated node termination \
                 option was not selected, there might be orphaned nodes"
            );
            Rollback::Skipped
        };

        Err(LaunchError { source, rollback })
    }

    /// Provisions the nodes of the cluster and records them in the
    /// [`StateStore`] before returning.
    pub async fn bootstrap_cluster(&self, spec: &ClusterSpec) -> Result<Cluster, Error> {
        let _guard = self.locks.lock(&spec.cluster_name).await;
        self.bootstrap(spec).await
    }

    async fn bootstrap(&self, spec: &ClusterSpec) -> Result<Cluster, Error> {
        let cluster = self
            .execute_on(Phase::Bootstrap, spec, Cluster::empty())
            .await?;

        // Created nodes are recorded even if the operation has been
        // interrupted in the meantime.
        self.state_store(spec)
            .save(&cluster)
            .await
            .map_err(|err| Error::new(Phase::Bootstrap, spec, err.into()))?;

        if self.token.is_cancelled() {
            return Err(Error::new(Phase::Bootstrap, spec, Kind::Interrupted));
        }

        Ok(cluster)
    }

    /// Configures the services of the cluster reconciled from the
    /// [`StateStore`] and the provider.
    pub async fn configure_services(&self, spec: &ClusterSpec) -> Result<Cluster, Error> {
        self.execute(Phase::Configure, spec).await
    }

    pub async fn configure_services_on(
        &self,
        spec: &ClusterSpec,
        cluster: Cluster,
    ) -> Result<Cluster, Error> {
        self.execute_on(Phase::Configure, spec, cluster).await
    }

    /// Starts the services of the cluster reconciled from the [`StateStore`]
    /// and the provider.
    pub async fn start_services(&self, spec: &ClusterSpec) -> Result<Cluster, Error> {
        self.execute(Phase::Start, spec).await
    }

    pub async fn start_services_on(
        &self,
        spec: &ClusterSpec,
        cluster: Cluster,
    ) -> Result<Cluster, Error> {
        self.execute_on(Phase::Start, spec, cluster).await
    }

    /// Stops the services of the cluster reconciled from the [`StateStore`]
    /// and the provider.
    pub async fn stop_services(&self, spec: &ClusterSpec) -> Result<Cluster, Error> {
        self.execute(Phase::Stop, spec).await
    }

    pub async fn stop_services_on(
        &self,
        spec: &ClusterSpec,
        cluster: Cluster,
    ) -> Result<Cluster, Error> {
        self.execute_on(Phase::Stop, spec, cluster).await
    }

    /// Removes the services of the cluster reconciled from the
    /// [`StateStore`] and the provider.
    pub async fn cleanup_cluster(&self, spec: &ClusterSpec) -> Result<Cluster, Error> {
        self.execute(Phase::Cleanup, spec).await
    }

    pub async fn cleanup_cluster_on(
        &self,
        spec: &ClusterSpec,
        cluster: Cluster,
    ) -> Result<Cluster, Error> {
        self.execute_on(Phase::Cleanup, spec, cluster).await
    }

    /// Destroys all of the nodes of the cluster and removes its record from
    /// the [`StateStore`].
    ///
    /// Missing or corrupt state doesn't prevent the destruction, the nodes
    /// are then found by their provider group.
    pub async fn destroy_cluster(&self, spec: &ClusterSpec) -> Result<(), Error> {
        let _guard = self.locks.lock(&spec.cluster_name).await;
        self.destroy(spec).await
    }

    async fn destroy(&self, spec: &ClusterSpec) -> Result<(), Error> {
        let store = self.state_store(spec);
        let cluster = store.try_load_or_empty().await;

        let _ = self.execute_on(Phase::Destroy, spec, cluster).await?;

        self.guard(Phase::Destroy, spec, async {
            store.destroy().await?;
            Ok::<_, Kind>(())
        })
        .await
    }

    /// Destroys the nodes of the provided [`Cluster`] without touching the
    /// [`StateStore`].
    pub async fn destroy_cluster_on(
        &self,
        spec: &ClusterSpec,
        cluster: Cluster,
    ) -> Result<Cluster, Error> {
        self.execute_on(Phase::Destroy, spec, cluster).await
    }

    /// Destroys a single node and removes it from the recorded state.
    pub async fn destroy_instance(&self, spec: &ClusterSpec, id: &str) -> Result<(), Error> {
        let _guard = self.locks.lock(&spec.cluster_name).await;

        tracing::info!(cluster = %spec.cluster_name, id, "Destroying instance");

        self.guard(Operation::DestroyInstance, spec, async {
            let compute = self.connector.connect(spec).await?;
            compute.destroy_node(id).await?;

            let store = self.state_store(spec);
            let cluster = store
                .load()
                .await?
                .without_instances_matching(&WithIds::one(id));
            store.save(&cluster).await?;

            Ok::<_, Kind>(())
        })
        .await?;

        tracing::info!(cluster = %spec.cluster_name, id, "Instance destroyed");

        Ok(())
    }

    /// Reconciles the nodes the provider has running in the group of the
    /// cluster with the roles assigned to them in the `prior` [`Cluster`].
    ///
    /// Addresses are taken from the provider. Nodes missing from `prior` get
    /// no roles.
    pub async fn instances(
        &self,
        spec: &ClusterSpec,
        prior: Option<&Cluster>,
    ) -> Result<Cluster, Error> {
        self.guard(Operation::ListInstances, spec, self.reconcile(spec, prior))
            .await
    }

    async fn reconcile(&self, spec: &ClusterSpec, prior: Option<&Cluster>) -> Result<Cluster, Kind> {
        let compute = self.connector.connect(spec).await?;
        let nodes = compute
            .list_nodes(&RunningInGroup::new(&spec.cluster_name))
            .await?;

        Ok(nodes
            .into_iter()
            .map(|node| {
                let roles = prior
                    .and_then(|cluster| cluster.instance(&node.id))
                    .map(|instance| instance.roles().clone())
                    .unwrap_or_default();

                Instance::from_node(node, roles, spec.credentials.clone())
            })
            .collect())
    }

    /// Looks up the single running [`Instance`] of the cluster with the
    /// provided ID.
    pub async fn instance(&self, spec: &ClusterSpec, id: &str) -> Result<Instance, Error> {
        self.guard(Operation::ListInstances, spec, async {
            let prior = self.state_store(spec).try_load_or_empty().await;
            let cluster = self.reconcile(spec, Some(&prior)).await?;
            let instance = cluster.instance_matching(&WithIds::one(id)).require()?;
            Ok::<_, Kind>(instance.clone())
        })
        .await
    }

    /// Lists the nodes the provider has running in the group of the cluster.
    #[deprecated(note = "use `ClusterController::instances` instead")]
    pub async fn nodes(&self, spec: &ClusterSpec) -> Result<Vec<NodeMetadata>, Error> {
        self.guard(Operation::ListInstances, spec, async {
            let compute = self.connector.connect(spec).await?;
            let nodes = compute
                .list_nodes(&RunningInGroup::new(&spec.cluster_name))
                .await?;
            Ok::<_, Kind>(nodes)
        })
        .await
    }

    /// Runs a [`Script`] on the nodes of the cluster matching the provided
    /// [`Predicate`].
    ///
    /// Uses [`Self::default_run_script_options`] if no options are provided.
    /// Credentials of the cluster are used unless the options carry their own.
    pub async fn run_script_on_nodes_matching(
        &self,
        spec: &ClusterSpec,
        predicate: &dyn Predicate<NodeMetadata>,
        script: &Script,
        options: Option<RunScriptOptions>,
    ) -> Result<Vec<(NodeMetadata, ExecResponse)>, Error> {
        let options = match options {
            None => self.default_run_script_options(spec),
            Some(opts) if opts.credentials.is_none() => {
                opts.with_credentials(spec.credentials.clone())
            }
            Some(opts) => opts,
        };

        let predicate = RunningInGroup::new(&spec.cluster_name).and(predicate);

        self.guard(Operation::RunScript, spec, async {
            let compute = self.connector.connect(spec).await?;
            let results = compute
                .run_script_on_nodes_matching(&predicate, script, &options)
                .await?;
            Ok::<_, Kind>(results)
        })
        .await
    }

    /// [`RunScriptOptions`] with the cluster credentials, neither run as root
    /// nor wrapped into an init script.
    pub fn default_run_script_options(&self, spec: &ClusterSpec) -> RunScriptOptions {
        RunScriptOptions::default()
            .with_credentials(spec.credentials.clone())
            .run_as_root(false)
            .wrap_in_init_script(false)
    }

    /// Reconciles the cluster from the [`StateStore`] and the provider, then
    /// executes the [`Phase`] on it.
    async fn execute(&self, phase: Phase, spec: &ClusterSpec) -> Result<Cluster, Error> {
        let cluster = self
            .guard(phase, spec, async {
                let prior = self.state_store(spec).load().await?;
                self.reconcile(spec, Some(&prior)).await
            })
            .await?;

        self.execute_on(phase, spec, cluster).await
    }

    async fn execute_on(
        &self,
        phase: Phase,
        spec: &ClusterSpec,
        cluster: Cluster,
    ) -> Result<Cluster, Error> {
        self.guard(phase, spec, async {
            let compute = self.connector.connect(spec).await?;
            action::execute(phase, &compute, &self.handlers, spec, cluster).await
        })
        .await
    }

    /// Races the provided future against the [`CancellationToken`] and adds
    /// the operation context to its error.
    async fn guard<T>(
        &self,
        op: impl Into<Operation>,
        spec: &ClusterSpec,
        fut: impl Future<Output = Result<T, Kind>>,
    ) -> Result<T, Error> {
        let res = tokio::select! {
            biased;

            () = self.token.cancelled() => Err(Kind::Interrupted),
            res = fut => res,
        };

        res.map_err(|kind| Error::new(op, spec, kind))
    }
}

impl<C: Connector> ClusterController<C> {
    /// Creates a [`ClusterController`] using the [`DefaultFactory`] of
    /// [`StateStore`]s.
    pub fn with_default_stores(connector: C, handlers: Registry) -> Self {
        Self::new(connector, DefaultFactory::new(), handlers)
    }
}
