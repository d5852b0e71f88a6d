//! Orchestrator entry point.
//!
//! Exit codes: 0 clean shutdown, 64 invalid configuration, 69 a required
//! dependency stayed unavailable through startup retries, 70 internal
//! error, 75 the graceful shutdown window lapsed.

use std::process::ExitCode;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use orchestrator_core::config::Config;
use orchestrator_core::server::app::bootstrap;

const EX_CONFIG: u8 = 64;
const EX_UNAVAILABLE: u8 = 69;
const EX_SOFTWARE: u8 = 70;
const EX_TEMPFAIL: u8 = 75;

const STARTUP_ATTEMPTS: u32 = 5;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("orchestrator=info,tower_http=info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration invalid");
            return ExitCode::from(EX_CONFIG);
        }
    };
    let shutdown_timeout = config.core.shutdown_timeout;
    let port = config.core.listen_port;

    // Dependencies (store, coordination store, engine) may still be coming
    // up alongside us; retry with backoff before giving up.
    let mut runtime = None;
    for attempt in 1..=STARTUP_ATTEMPTS {
        match bootstrap(config.clone()).await {
            Ok(built) => {
                runtime = Some(built);
                break;
            }
            Err(err) if attempt < STARTUP_ATTEMPTS => {
                let wait = Duration::from_secs(2u64.pow(attempt.min(4)));
                error!(attempt, error = %err, "startup dependency unavailable, retrying");
                tokio::time::sleep(wait).await;
            }
            Err(err) => {
                error!(error = %err, "dependencies unavailable after retries");
                return ExitCode::from(EX_UNAVAILABLE);
            }
        }
    }
    let runtime = match runtime {
        Some(runtime) => runtime,
        None => return ExitCode::from(EX_UNAVAILABLE),
    };

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, port, "failed to bind listen port");
            return ExitCode::from(EX_SOFTWARE);
        }
    };
    info!(port, node_id = %runtime.state.node_id, "orchestrator listening");

    let shutdown = runtime.shutdown.clone();
    let server_shutdown = shutdown.clone();
    let serve = axum::serve(listener, runtime.router).with_graceful_shutdown(async move {
        server_shutdown.cancelled().await;
    });

    let signal = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(term) => term,
                    Err(_) => return ctrl_c.await.map(|_| ()).unwrap_or(()),
                };
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
    };

    let exit = tokio::select! {
        result = serve => {
            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    error!(error = %err, "server error");
                    ExitCode::from(EX_SOFTWARE)
                }
            }
        }
        _ = signal => {
            info!("shutdown signal received, draining");
            shutdown.cancel();

            let drain = async {
                for handle in runtime.handles {
                    let _ = handle.await;
                }
            };
            match tokio::time::timeout(shutdown_timeout, drain).await {
                Ok(()) => {
                    info!("graceful shutdown complete");
                    ExitCode::SUCCESS
                }
                Err(_) => {
                    error!(
                        timeout_secs = shutdown_timeout.as_secs(),
                        "graceful shutdown timed out, aborting"
                    );
                    ExitCode::from(EX_TEMPFAIL)
                }
            }
        }
    };
    exit
}
