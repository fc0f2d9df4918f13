//! `paddockd serve`: host the engine until interrupted.
//!
//! Startup reclaims whatever a previous run left behind, then metrics are
//! reported on a fixed interval. On `SIGINT` or `SIGTERM` every container
//! is destroyed before the process exits.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Args;
use paddock_common::config::{IsolationMode, PaddockConfig};
use paddock_runtime::backend::platform_info;
use paddock_runtime::engine::Engine;
use paddock_runtime::metrics::{self, TracingSink};

/// Arguments for the `serve` command.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Seconds between metrics reports; overrides the configuration.
    #[arg(long, env = "PADDOCK_METRICS_INTERVAL")]
    pub metrics_interval: Option<u64>,

    /// Leave containers of a previous run alone instead of reclaiming them.
    #[arg(long)]
    pub skip_recover: bool,
}

/// Runs the server.
///
/// # Errors
///
/// Returns an error if the engine cannot start, recovery fails, or
/// containers cannot be destroyed at shutdown.
pub async fn execute(config: PaddockConfig, args: ServeArgs) -> anyhow::Result<()> {
    let platform = platform_info();
    tracing::info!(
        os = %platform.os,
        arch = %platform.arch,
        native = platform.native_available,
        firewall = platform.firewall_available,
        "starting paddockd"
    );
    if config.isolation == IsolationMode::Linux && !platform.native_available {
        tracing::warn!("linux isolation needs root; use --isolation host for unprivileged development");
    }

    let interval = Duration::from_secs(args.metrics_interval.unwrap_or(config.metrics_interval_secs).max(1));
    let engine = Arc::new(Engine::new(config).context("failed to start engine")?);
    if args.skip_recover {
        tracing::warn!("recovery skipped; leftovers of a previous run stay allocated");
    } else {
        let reclaimed = engine.recover().await.context("failed to recover previous state")?;
        tracing::info!(reclaimed, "recovery complete");
    }

    let reporter = tokio::spawn(report_loop(Arc::clone(&engine), interval));
    shutdown_signal().await;
    tracing::info!("shutting down");
    reporter.abort();

    engine.destroy_all().await.context("failed to destroy containers")?;
    tracing::info!("paddockd stopped");
    Ok(())
}

async fn report_loop(engine: Arc<Engine>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        let _ = ticker.tick().await;
        metrics::report(&engine, &TracingSink).await;
    }
}

/// Resolves on `SIGINT` or `SIGTERM`.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                let _ = stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        () = interrupt => {}
        () = terminate => {}
    }
}
