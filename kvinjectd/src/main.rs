//! `kvinjectd`: a mutating admission webhook which adds a `kvinject-init`
//! container to annotated pods, so that their secrets are fetched from Vault
//! before the workload starts.

use std::sync::Arc;

use axum_server::{tls_rustls::RustlsConfig, Handle};
use kvinject_common::{prelude::*, tracing_support::initialize_tracing};
use prometheus::Registry;
use structopt::StructOpt;
use tokio::signal;

mod admission;
mod config;
mod decision;
mod metrics;
mod patch;

use admission::{metrics_router, router, AppState};
use config::Opt;

#[tokio::main]
async fn main() -> Result<()> {
    initialize_tracing();
    openssl_probe::init_ssl_cert_env_vars();
    let opt = Opt::from_args();
    debug!("Args: {:?}", opt);

    let state = Arc::new(
        AppState::new(opt.injector.clone(), Registry::new())
            .context("could not register metrics")?,
    );
    let app = router(state.clone()).into_make_service();
    let metrics_app = metrics_router(state).into_make_service();
    let addr = opt.listen_addr();
    let metrics_addr = opt.metrics_addr();

    let handle = Handle::new();
    let metrics_handle = Handle::new();
    tokio::spawn(shutdown_on_signal(vec![handle.clone(), metrics_handle.clone()]));

    let webhook = async {
        if opt.disable_tls {
            warn!("serving plain HTTP on {}", addr);
            axum_server::bind(addr)
                .handle(handle)
                .serve(app)
                .await
                .context("webhook server failed")
        } else {
            let tls = RustlsConfig::from_pem_file(&opt.cert_path, &opt.key_path)
                .await
                .with_context(|| {
                    format!(
                        "could not load TLS certificate {} and key {}",
                        opt.cert_path.display(),
                        opt.key_path.display(),
                    )
                })?;
            info!("serving HTTPS on {}", addr);
            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(app)
                .await
                .context("webhook server failed")
        }
    };
    let metrics = async {
        info!("serving metrics on {}", metrics_addr);
        axum_server::bind(metrics_addr)
            .handle(metrics_handle)
            .serve(metrics_app)
            .await
            .context("metrics server failed")
    };
    tokio::try_join!(webhook, metrics)?;

    info!("webhook stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM, then stop accepting requests on every
/// listener and let in-flight ones finish.
async fn shutdown_on_signal(handles: Vec<Handle>) {
    let interrupt = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("could not listen for SIGINT: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("could not listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {},
        _ = terminate => {},
    }
    info!("received shutdown signal, closing down");
    for handle in handles {
        handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
    }
}
