//! Binds a dual-stack TCP socket and runs the accept loop, dispatching each
//! accepted connection to an independent handler task.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Binds `::` with `IPV6_V6ONLY` cleared so both v4 and v6 clients connect
/// through one socket; falls back to a plain v4 bind if the v6 socket-level
/// setup itself fails on this platform.
pub fn bind_dual_stack(port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = format!("[::]:{port}").parse().expect("valid IPv6 any-addr");

    let bind_v6 = || -> std::io::Result<std::net::TcpListener> {
        let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_only_v6(false)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    };

    let std_listener = match bind_v6() {
        Ok(listener) => listener,
        Err(e) => {
            warn!(error = %e, "dual-stack IPv6 bind failed, falling back to IPv4");
            let addr: SocketAddr = format!("0.0.0.0:{port}").parse().expect("valid IPv4 any-addr");
            let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).context("creating IPv4 fallback socket")?;
            socket.set_reuse_address(true)?;
            socket.bind(&addr.into()).context("binding IPv4 fallback socket")?;
            socket.listen(1024)?;
            socket.set_nonblocking(true)?;
            socket.into()
        }
    };

    TcpListener::from_std(std_listener).context("converting std listener to tokio listener")
}

/// Runs the accept loop until `cancel` fires. Accept errors while running are
/// logged and the loop continues; after cancellation fires, accept errors are
/// silent.
pub async fn run_accept_loop<F, Fut>(listener: TcpListener, cancel: CancellationToken, mut on_accept: F)
where
    F: FnMut(tokio::net::TcpStream, SocketAddr) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    info!(local_addr = ?listener.local_addr().ok(), "listener accepting connections");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("listener shutting down");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let fut = on_accept(stream, peer);
                        tokio::spawn(fut);
                    }
                    Err(e) => {
                        if cancel.is_cancelled() {
                            return;
                        }
                        error!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
}
