use {super::Controller, anyhow::Context as _, cirrus_core::ClusterSpec, cirrus_state::StateStore as _};

pub async fn exec(controller: &Controller, spec: &ClusterSpec) -> anyhow::Result<()> {
    let prior = controller.state_store(spec).try_load_or_empty().await;
    let cluster = controller
        .instances(spec, Some(&prior))
        .await
        .context("Failed to list instances")?;

    if cluster.is_empty() {
        println!("No running instances in cluster `{}`", spec.cluster_name);
    }

    super::print_cluster(&cluster);
    Ok(())
}
