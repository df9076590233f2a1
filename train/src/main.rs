use anyhow::Result;
use clap::Parser;
use ember_modeling::set_suggested_env_vars;
use ember_telemetry::init_logging;
use ember_train::{cli::Args, launch, WorkerOutcome};
use tracing::{info, Level};

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.logs, Level::INFO, args.write_log.clone())?;
    set_suggested_env_vars();

    info!(
        world_size = args.world_size,
        backend = ?args.backend,
        score = ?args.score,
        "============ Starting ember-train ============"
    );

    for outcome in launch(&args)? {
        if let WorkerOutcome::Trained(summary) = outcome {
            if let Some(result) = summary.last_evaluation() {
                info!(
                    accuracy = result.accuracy,
                    loss = result.avg_loss,
                    steps = summary.optimizer_steps,
                    "Worker finished"
                );
            }
        }
    }
    Ok(())
}
