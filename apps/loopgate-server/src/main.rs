use std::time::Duration;

use loopgate_core::Settings;
use tracing::{error, info};

mod access_log;
mod api;
mod app_state;
mod bootstrap;
mod openapi;
mod responses;
mod router;

pub(crate) use app_state::AppState;

#[tokio::main]
async fn main() {
    match bootstrap::ensure_openapi_export() {
        Ok(Some(_)) => return,
        Ok(None) => {}
        Err(err) => {
            eprintln!("error: failed to write OPENAPI_OUT: {err:#}");
            std::process::exit(2);
        }
    }

    loopgate_otel::init();

    let settings = match Settings::load() {
        Ok(s) => s,
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(2);
        }
    };
    let http_cfg = match bootstrap::http_config(&settings) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };
    let bootstrap::BootstrapOutput {
        router,
        state,
        background,
    } = match bootstrap::build(&settings).await {
        Ok(out) => out,
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(2);
        }
    };

    let app = bootstrap::attach_layers(router, http_cfg.concurrency_limit);
    let listener = match tokio::net::TcpListener::bind(http_cfg.addr).await {
        Ok(l) => l,
        Err(err) => {
            eprintln!("error: cannot bind {}: {err}", http_cfg.addr);
            std::process::exit(2);
        }
    };
    info!(addr = %http_cfg.addr, "loopgate-server listening");

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("http server exited with error: {err}");
    }

    state.publish(loopgate_topics::TOPIC_SERVICE_STOP, &serde_json::json!({}));
    // Let the journal drain the stop event before tearing tasks down.
    tokio::time::sleep(Duration::from_millis(100)).await;
    for handle in background {
        handle.abort();
    }
    info!("shutdown complete");
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}
