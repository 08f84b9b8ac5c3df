use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use kube::api::Api;
use kube::{Client, CustomResourceExt};
use tokio::sync::mpsc;
use tracing::{error, info};

use paymentjob_core::{PaymentJob, shutdown};
use paymentjob_operator::cluster::KubeCluster;
use paymentjob_operator::{Dispatcher, OperatorConfig, Reconciler, watcher};

const EVENT_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> ExitCode {
    // `paymentjob-operator crd` prints the CustomResourceDefinition and exits.
    if std::env::args().nth(1).as_deref() == Some("crd") {
        return match serde_json::to_string_pretty(&PaymentJob::crd()) {
            Ok(crd) => {
                println!("{crd}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("failed to render CRD: {err}");
                ExitCode::FAILURE
            }
        };
    }

    paymentjob_observability::init("paymentjob-operator");

    match run().await {
        Ok(()) => {
            info!("operator stopped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "operator failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = OperatorConfig::from_env().context("invalid operator configuration")?;
    info!(
        namespace = config.namespace.as_deref().unwrap_or("<all>"),
        resync_secs = config.resync_interval.as_secs(),
        status_retry_attempts = config.status_retry.max_attempts,
        "starting paymentjob operator"
    );

    let client = Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;
    let cluster = Arc::new(KubeCluster::new(client.clone()));
    let reconciler = Arc::new(Reconciler::new(cluster, config.status_retry.clone()));
    let dispatcher = Dispatcher::new(reconciler);

    let api: Api<PaymentJob> = match config.namespace.as_deref() {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);

    tokio::select! {
        () = watcher::watch(api, config.resync_interval, tx) => {
            anyhow::bail!("resource watch ended unexpectedly")
        }
        () = dispatcher.run(rx) => {
            anyhow::bail!("dispatcher stopped unexpectedly")
        }
        () = shutdown::signal() => {
            info!("shutdown signal received");
        }
    }
    Ok(())
}
