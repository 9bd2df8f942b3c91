use {
    cirrus_byon::Connector,
    cirrus_controller::ClusterController,
    cirrus_core::{Cluster, ClusterSpec},
};

mod destroy;
mod launch;
mod list;
mod phase;
mod run_script;

pub type Controller = ClusterController<Connector>;

#[derive(clap::Subcommand, Debug)]
pub enum SubCmd {
    /// Launches a new cluster: bootstraps the nodes, then configures and
    /// starts the services
    LaunchCluster,

    /// Destroys the cluster and its persisted state
    DestroyCluster,

    /// Provisions the nodes of the cluster without configuring them
    Bootstrap,

    /// Configures the services of a running cluster
    Configure,

    /// Starts the services of a running cluster
    StartServices,

    /// Stops the services of a running cluster
    StopServices,

    /// Removes the services from the nodes of a running cluster
    CleanupCluster,

    /// Lists the running instances of the cluster
    ListCluster,

    /// Destroys a single instance of the cluster
    DestroyInstance(destroy::DestroyInstanceCmd),

    /// Runs a script on the nodes of the cluster
    RunScript(run_script::RunScriptCmd),
}

pub async fn exec(cmd: SubCmd, controller: &Controller, spec: &ClusterSpec) -> anyhow::Result<()> {
    match cmd {
        SubCmd::LaunchCluster => launch::exec(controller, spec).await,
        SubCmd::DestroyCluster => destroy::exec_cluster(controller, spec).await,
        SubCmd::Bootstrap => phase::exec(phase::Cmd::Bootstrap, controller, spec).await,
        SubCmd::Configure => phase::exec(phase::Cmd::Configure, controller, spec).await,
        SubCmd::StartServices => phase::exec(phase::Cmd::Start, controller, spec).await,
        SubCmd::StopServices => phase::exec(phase::Cmd::Stop, controller, spec).await,
        SubCmd::CleanupCluster => phase::exec(phase::Cmd::Cleanup, controller, spec).await,
        SubCmd::ListCluster => list::exec(controller, spec).await,
        SubCmd::DestroyInstance(args) => destroy::exec_instance(args, controller, spec).await,
        SubCmd::RunScript(args) => run_script::exec(args, controller, spec).await,
    }
}

/// Prints one line per instance: ID, public and private address, roles.
fn print_cluster(cluster: &Cluster) {
    for instance in cluster.instances() {
        let roles: Vec<_> = instance.roles().iter().map(String::as_str).collect();

        println!(
            "{}\t{}\t{}\t{}",
            instance.id(),
            instance.public_address().unwrap_or("-"),
            instance.private_address().unwrap_or("-"),
            roles.join("+"),
        );
    }
}
