use {
    super::Controller,
    anyhow::Context as _,
    cirrus_core::{
        cluster::WithAllRoles,
        compute::{NodeIds, Script, Statement},
        predicate::{self, Predicate as _},
        ClusterSpec,
        Instance,
    },
    cirrus_state::StateStore as _,
    std::path::PathBuf,
};

#[derive(Debug, clap::Args)]
pub struct RunScriptCmd {
    /// Only run on the instances having all of these roles
    #[clap(long, value_delimiter = ',')]
    roles: Vec<String>,

    /// Only run on the instances with these IDs
    #[clap(long, value_delimiter = ',')]
    ids: Vec<String>,

    /// Run the script as root
    #[clap(long)]
    root: bool,

    /// Path of the script to run
    script: PathBuf,
}

#[tracing::instrument(skip_all, fields(cluster = %spec.cluster_name, script = ?args.script))]
pub async fn exec(args: RunScriptCmd, controller: &Controller, spec: &ClusterSpec) -> anyhow::Result<()> {
    let body = tokio::fs::read_to_string(&args.script)
        .await
        .with_context(|| format!("Failed to read {:?}", args.script))?;

    let name = args
        .script
        .file_stem()
        .and_then(|name| name.to_str())
        .unwrap_or("script");

    let script: Script = [Statement::new(name, body)].into_iter().collect();

    let prior = controller.state_store(spec).try_load_or_empty().await;
    let cluster = controller.instances(spec, Some(&prior)).await?;

    let with_roles = WithAllRoles::new(args.roles.iter().map(String::as_str));
    let selected = predicate::from_fn("selected", |instance: &Instance| {
        (args.roles.is_empty() || with_roles.test(instance))
            && (args.ids.is_empty() || args.ids.iter().any(|id| id == instance.id()))
    });

    let targets = NodeIds::new(
        cluster
            .instances()
            .filter(|instance| selected.test(instance))
            .map(Instance::id),
    );

    let options = controller
        .default_run_script_options(spec)
        .run_as_root(args.root)
        .task_name(name);

    let results = controller
        .run_script_on_nodes_matching(spec, &targets, &script, Some(options))
        .await?;

    if results.is_empty() {
        println!("No matching instances");
    }

    let mut failed = 0;

    for (node, response) in results {
        println!("** Node {}: exit status {}", node.id, response.exit_status);
        print!("{}", response.output);
        eprint!("{}", response.error);

        if !response.is_success() {
            failed += 1;
        }
    }

    if failed > 0 {
        anyhow::bail!("Script failed on {failed} node(s)");
    }

    Ok(())
}
