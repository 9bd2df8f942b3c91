use {super::Controller, anyhow::Context as _, cirrus_core::ClusterSpec};

#[derive(Debug, clap::Args)]
pub struct DestroyInstanceCmd {
    /// ID of the instance to destroy
    id: String,
}

#[tracing::instrument(skip(controller, spec), fields(cluster = %spec.cluster_name))]
pub async fn exec_cluster(controller: &Controller, spec: &ClusterSpec) -> anyhow::Result<()> {
    controller.destroy_cluster(spec).await?;

    println!("Destroyed cluster `{}`", spec.cluster_name);
    Ok(())
}

#[tracing::instrument(skip(controller, spec), fields(cluster = %spec.cluster_name))]
pub async fn exec_instance(
    args: DestroyInstanceCmd,
    controller: &Controller,
    spec: &ClusterSpec,
) -> anyhow::Result<()> {
    let instance = controller
        .instance(spec, &args.id)
        .await
        .with_context(|| format!("Instance `{}` is not running", args.id))?;

    controller.destroy_instance(spec, instance.id()).await?;

    println!("Destroyed instance `{}`", instance.id());
    Ok(())
}
