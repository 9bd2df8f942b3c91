use {
    crate::{
        config::Config,
        logger::{LogFormat, Logger},
    },
    anyhow::Context as _,
    cirrus_controller::ClusterController,
    cirrus_state::DefaultFactory,
    clap::Parser,
    std::path::PathBuf,
    tokio_util::sync::CancellationToken,
};

mod commands;
mod config;
mod handler;
mod logger;

/// Launch and manage clusters of services on provisioned nodes
#[derive(clap::Parser, Debug)]
#[clap(
    author,
    version,
    about,
    long_about = None,
    arg_required_else_help(true)
)]
struct App {
    /// Path of the cluster configuration file
    #[clap(long, short, global = true, env = "CIRRUS_CONFIG", default_value = "cirrus.toml")]
    config: PathBuf,

    #[clap(long, global = true, value_enum, default_value_t)]
    log_format: LogFormat,

    /// Log filter directives, `LOG_LEVEL` is used if not provided
    #[clap(long, global = true)]
    log_filter: Option<String>,

    /// Write logs into this file instead of stderr
    #[clap(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    commands: commands::SubCmd,
}

fn main() -> anyhow::Result<()> {
    let app = App::parse();
    let _logger = Logger::init(app.log_format, app.log_filter.as_deref(), app.log_file);

    let cfg = Config::load_from_file(&app.config)
        .with_context(|| format!("Failed to load {:?}", app.config))?;
    let spec = cfg.spec().context("Invalid cluster configuration")?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async move {
            let token = CancellationToken::new();
            tokio::spawn(cancel_on_ctrl_c(token.clone()));

            let controller = ClusterController::new(
                cirrus_byon::Connector::new(cfg.hosts.clone()),
                DefaultFactory::new(),
                cfg.registry(),
            )
            .with_cancellation(token);

            commands::exec(app.commands, &controller, &spec).await
        })
}

async fn cancel_on_ctrl_c(token: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::warn!("Interrupted, cancelling the running operation");
            token.cancel();
        }
        Err(err) => tracing::error!(?err, "Failed to listen for ctrl-c"),
    }
}
