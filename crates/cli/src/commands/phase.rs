use {
    super::{print_cluster, Controller},
    anyhow::Context as _,
    cirrus_core::ClusterSpec,
};

#[derive(Clone, Copy, Debug)]
pub enum Cmd {
    Bootstrap,
    Configure,
    Start,
    Stop,
    Cleanup,
}

#[tracing::instrument(skip(controller, spec), fields(cluster = %spec.cluster_name))]
pub async fn exec(cmd: Cmd, controller: &Controller, spec: &ClusterSpec) -> anyhow::Result<()> {
    let cluster = match cmd {
        Cmd::Bootstrap => controller.bootstrap_cluster(spec).await,
        Cmd::Configure => controller.configure_services(spec).await,
        Cmd::Start => controller.start_services(spec).await,
        Cmd::Stop => controller.stop_services(spec).await,
        Cmd::Cleanup => controller.cleanup_cluster(spec).await,
    }
    .with_context(|| format!("`{cmd:?}` failed"))?;

    print_cluster(&cluster);
    Ok(())
}
