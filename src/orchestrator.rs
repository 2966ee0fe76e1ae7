//! Top-level composition root: loads configuration, starts supervisors for
//! any helper-process upstreams, optionally starts TLS and the CRL
//! responder, then runs the listener until a shutdown signal arrives.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ProxyConfig;
use crate::crl::CrlResponder;
use crate::handler::{handle_connection, HandlerContext};
use crate::listener::{bind_dual_stack, run_accept_loop};
use crate::selector::RoundRobinCursor;
use crate::supervisor::Supervisor;
use crate::tls::build_server_config;

pub struct Orchestrator {
    config: ProxyConfig,
}

impl Orchestrator {
    pub fn new(config: ProxyConfig) -> Self {
        Orchestrator { config }
    }

    /// Runs until Ctrl-C or SIGTERM, then performs one idempotent cleanup
    /// that stops the listener, the CRL responder, and every supervisor.
    pub async fn run(self) -> Result<()> {
        let enabled = self.config.enabled_upstreams();

        let mut supervisors = Vec::new();
        for upstream in &enabled {
            if let Some(process) = &upstream.process {
                if process.auto_start {
                    let supervisor = Arc::new(Supervisor::new(
                        process.clone(),
                        upstream.health_check.clone(),
                        upstream.host.clone(),
                        upstream.port,
                    ));
                    match supervisor.start().await {
                        Ok(()) => supervisors.push(supervisor),
                        Err(e) => error!(error = %e, file_name = %process.file_name, "helper process failed to start; continuing without it"),
                    }
                }
            }
        }

        let server_cert = if self.config.use_https {
            Some(build_server_config(&self.config.cert_file, &self.config.key_file).context("loading server certificate")?)
        } else {
            None
        };

        let crl_responder = match self.config.crl_port {
            Some(port) => match CrlResponder::start(port).await {
                Ok(responder) => Some(responder),
                Err(e) => {
                    warn!(error = %e, port, "CRL responder failed to start; continuing without it");
                    None
                }
            },
            None => None,
        };

        let listener = bind_dual_stack(self.config.port).context("binding proxy listener")?;
        info!(port = self.config.port, upstreams = enabled.len(), tls = server_cert.is_some(), "tunnelgate starting");

        let ctx = Arc::new(HandlerContext {
            server_cert,
            upstreams: enabled,
            strategy: self.config.load_balancing_strategy,
            cursor: RoundRobinCursor::new(),
        });

        let cancel = CancellationToken::new();
        let accept_cancel = cancel.clone();
        let accept_ctx = ctx.clone();
        let accept_task = tokio::spawn(async move {
            run_accept_loop(listener, accept_cancel, move |stream, peer| {
                let ctx = accept_ctx.clone();
                handle_connection(stream, peer, ctx)
            })
            .await;
        });

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received (Ctrl-C)");
            }
            _ = wait_for_sigterm() => {
                info!("shutdown signal received (SIGTERM)");
            }
        }

        cancel.cancel();
        let _ = accept_task.await;
        if let Some(responder) = &crl_responder {
            responder.stop();
        }
        for supervisor in &supervisors {
            supervisor.stop().await;
        }
        info!("tunnelgate shut down cleanly");

        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
