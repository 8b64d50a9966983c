//! Terrace Operator - Terraform modules reconciled as Kubernetes resources

mod cli;
mod controller_runner;

use clap::Parser;
use futures::future::join_all;
use kube::Client;
use terrace_common::crd::all_crds;
use terrace_common::telemetry::{init_telemetry, TelemetryConfig};
use tokio_util::sync::CancellationToken;

use crate::cli::Cli;
use crate::controller_runner::{build_configuration_controllers, build_revision_controllers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        for crd in all_crds() {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    let telemetry = init_telemetry(TelemetryConfig {
        service_name: "terrace-operator".to_string(),
        log_format: cli.log_format,
        ..Default::default()
    })?;
    if telemetry.is_exporting() {
        tracing::info!("exporting spans and metrics over OTLP");
    }

    let result = run_controllers(cli).await;
    telemetry.shutdown();
    result
}

async fn run_controllers(cli: Cli) -> anyhow::Result<()> {
    let settings = cli.settings();
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    // In-flight cycles stop at their next step once a signal arrives
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    tracing::info!("Starting Terrace controllers:");
    let mut controllers =
        build_configuration_controllers(client.clone(), &settings, cancel.child_token());
    controllers.extend(build_revision_controllers(
        client,
        &settings,
        cancel.child_token(),
    ));

    join_all(controllers).await;
    tracing::info!("Terrace controllers stopped");
    Ok(())
}

async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM, only Ctrl-C cancels");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("shutdown signal received, cancelling in-flight reconciliations");
    cancel.cancel();
}
