use std::process::ExitCode;

use anyhow::Context;
use tracing::error;

use paymentjob_core::shutdown;
use paymentjob_worker::{
    ConnectionManager, RunLoop, RunSettings, RunSummary, ServiceConnector, WorkerConfig,
};

#[tokio::main]
async fn main() -> ExitCode {
    paymentjob_observability::init("paymentjob-worker");

    match run().await {
        Ok(summary) => {
            tracing::info!(
                processed = summary.processed,
                reason = ?summary.reason,
                "payment worker exiting"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "payment worker failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<RunSummary> {
    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    config.log_banner();

    let connections =
        ConnectionManager::new(ServiceConnector::new(&config), config.connect_retry.clone());
    let run_loop = RunLoop::new(connections, RunSettings::from_config(&config));

    run_loop
        .run(shutdown::signal())
        .await
        .context("payment worker stopped on a fatal error")
}
