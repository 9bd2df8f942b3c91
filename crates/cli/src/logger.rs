use {
    std::path::PathBuf,
    tracing_appender::{
        non_blocking::WorkerGuard,
        rolling::{RollingFileAppender, Rotation},
    },
    tracing_subscriber::{prelude::*, EnvFilter},
};

/// The default log level, which is used as a fallback if no other can be
/// found.
const DEFAULT_LOG_LEVEL: tracing::Level = tracing::Level::INFO;

/// The environment variable used to control the logger.
const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

pub struct Logger {
    _guard: WorkerGuard,
}

impl Logger {
    /// Initializes the global subscriber writing to stderr, or to the
    /// provided file.
    pub fn init(format: LogFormat, filter: Option<&str>, log_file: Option<PathBuf>) -> Self {
        let filter = filter
            .map(EnvFilter::new)
            .or_else(|| EnvFilter::try_from_env(ENV_LOG_LEVEL).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_LEVEL.to_string()));

        let (writer, guard) = match log_file {
            Some(path) => tracing_appender::non_blocking(init_file_writer(path)),
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let logger = match format {
            LogFormat::Json => tracing_subscriber::fmt::layer()
                .event_format(
                    tracing_subscriber::fmt::format()
                        .json()
                        .with_span_list(true)
                        .with_current_span(false),
                )
                .fmt_fields(tracing_subscriber::fmt::format::JsonFields::default())
                .with_target(true)
                .with_writer(writer)
                .with_filter(filter)
                .boxed(),

            LogFormat::Text => tracing_subscriber::fmt::layer()
                .event_format(tracing_subscriber::fmt::format())
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter)
                .boxed(),
        };

        tracing_subscriber::registry().with(logger).init();

        Self { _guard: guard }
    }
}

fn init_file_writer(mut log_file: PathBuf) -> RollingFileAppender {
    let file_name = log_file
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("cirrus.log")
        .to_string();

    // Turn file name into directory name.
    log_file.pop();

    RollingFileAppender::new(Rotation::NEVER, &log_file, file_name)
}
