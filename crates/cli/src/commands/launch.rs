use {super::Controller, cirrus_core::ClusterSpec};

#[tracing::instrument(skip(controller, spec), fields(cluster = %spec.cluster_name))]
pub async fn exec(controller: &Controller, spec: &ClusterSpec) -> anyhow::Result<()> {
    let cluster = controller.launch_cluster(spec).await?;

    println!("Running cluster `{}`:", spec.cluster_name);
    super::print_cluster(&cluster);

    println!();
    println!("To log into the nodes use:");

    for instance in cluster.instances() {
        if let Some(address) = instance.public_address() {
            println!(
                "  ssh -i <private-key-file> {}@{address}",
                instance.credentials().user
            );
        }
    }

    Ok(())
}
