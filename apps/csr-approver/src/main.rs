use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use csr_approver::config::{ApproverConfig, Cli};
use csr_approver::controller::Controller;
use csr_approver::kube::KubeClient;
use csr_approver::telemetry::init_tracing;
use csr_core::{Approver, RequestStore, TracingDiagnostics, WatchConfig, WatchRegistry};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_filter)?;
    let config = ApproverConfig::try_from(cli)?;

    info!(
        kube_host = %config.kube.host,
        token_file = %config.kube.token_file.display(),
        insecure_skip_tls_verify = config.kube.insecure_skip_tls_verify,
        signers = ?config.policy.approve_signers(),
        users = ?config.policy.approve_users(),
        deny_unmatched = config.policy.deny_unmatched(),
        watch_buffer = config.watch_buffer,
        rewatch_delay_secs = config.rewatch_delay.as_secs(),
        "starting csr-approver"
    );

    let client = KubeClient::connect(&config.kube)
        .await
        .context("failed to connect to the Kubernetes API")?;
    let store: Arc<dyn RequestStore> = Arc::new(client);
    let registry = WatchRegistry::new(
        Arc::clone(&store),
        Arc::new(TracingDiagnostics),
        WatchConfig {
            buffer: config.watch_buffer,
        },
    );
    let controller = Controller::new(
        registry,
        Approver::new(store),
        config.policy.clone(),
        config.rewatch_delay,
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    let summary = controller.run(shutdown).await;
    info!(
        approved = summary.approved,
        denied = summary.denied,
        failures = summary.failures,
        "csr-approver stopped"
    );
    Ok(())
}
