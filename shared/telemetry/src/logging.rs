use std::{fs::OpenOptions, path::PathBuf};

use clap::ValueEnum;
use serde::Serialize;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer};

#[derive(Clone, Debug, Copy, ValueEnum, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Console,
    Json,
}

/// Installs the global tracing subscriber.
///
/// Console or JSON lines go to stdout, filtered by `RUST_LOG` with `level` as the
/// default directive. When `write_logs_file` is set, a second plain-text layer
/// appends to that file, filtered by `WRITE_RUST_LOG` if present.
pub fn init_logging(
    output: LogOutput,
    level: Level,
    write_logs_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let output_logs_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env()?;

    let detailed_logs_filter = || {
        if std::env::var("WRITE_RUST_LOG").is_ok() {
            EnvFilter::builder()
                .with_env_var("WRITE_RUST_LOG")
                .from_env()
        } else {
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env()
        }
    };

    let subscriber = tracing_subscriber::registry();
    let subscriber = match output {
        LogOutput::Console => subscriber.with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_thread_names(true)
                .with_filter(output_logs_filter)
                .boxed(),
        ),
        LogOutput::Json => subscriber.with(
            fmt::layer()
                .json()
                .with_writer(std::io::stdout)
                .flatten_event(true)
                .with_current_span(true)
                .with_filter(output_logs_filter)
                .boxed(),
        ),
    };

    match write_logs_file {
        Some(path) => {
            let log_file = OpenOptions::new().append(true).create(true).open(path)?;
            tracing::subscriber::set_global_default(
                subscriber.with(
                    fmt::layer()
                        .with_ansi(false)
                        .with_writer(log_file)
                        .with_filter(detailed_logs_filter()?),
                ),
            )?;
        }
        None => tracing::subscriber::set_global_default(subscriber)?,
    }

    Ok(())
}
