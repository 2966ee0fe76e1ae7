//! Upstream selection: walk a set of enabled upstreams under a
//! load-balancing policy, dialing each via its wire protocol until one
//! succeeds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::config::{LoadBalancingStrategy, Upstream, UpstreamKind};
use crate::dial::{dial, AddressFamily};
use crate::error::SelectorError;
use crate::{httpconnect, socks5};

/// Bounded connect+handshake deadline applied to every upstream attempt
/// (SOCKS5 and HTTP-CONNECT alike), since neither client otherwise bounds
/// its own I/O and an unresponsive upstream would hang the connection
/// forever.
const DIAL_DEADLINE: Duration = Duration::from_secs(10);

/// Monotonic round-robin cursor (I2); a single atomic counter shared across
/// all connections on one listener, wrapping on overflow rather than risking
/// a signed-overflow panic (REDESIGN FLAG c).
#[derive(Default)]
pub struct RoundRobinCursor(AtomicU64);

impl RoundRobinCursor {
    pub fn new() -> Self {
        RoundRobinCursor(AtomicU64::new(0))
    }

    fn next_index(&self, len: usize) -> usize {
        let n = self.0.fetch_add(1, Ordering::Relaxed);
        (n % len as u64) as usize
    }
}

fn attempt_order(upstreams: &[Upstream], strategy: LoadBalancingStrategy, cursor: &RoundRobinCursor) -> Vec<Upstream> {
    match strategy {
        LoadBalancingStrategy::Failover => upstreams.to_vec(),
        LoadBalancingStrategy::RoundRobin => {
            let k = cursor.next_index(upstreams.len());
            let mut ordered = Vec::with_capacity(upstreams.len());
            ordered.extend_from_slice(&upstreams[k..]);
            ordered.extend_from_slice(&upstreams[..k]);
            ordered
        }
    }
}

async fn dial_one_inner(upstream: &Upstream, target_host: &str, target_port: u16, preferred: Option<AddressFamily>) -> Result<TcpStream, SelectorError> {
    match upstream.kind {
        UpstreamKind::Socks5 => {
            let tcp = dial(&upstream.host, upstream.port, preferred).await?;
            Ok(socks5::connect(tcp, target_host, target_port).await?)
        }
        UpstreamKind::Http => {
            let tcp = dial(&upstream.host, upstream.port, preferred).await?;
            Ok(httpconnect::connect(tcp, target_host, target_port).await?)
        }
        UpstreamKind::Direct => Err(SelectorError::UnsupportedUpstreamType("direct".to_string())),
    }
}

/// Wraps the dial+handshake attempt in [`DIAL_DEADLINE`]. SOCKS5's
/// `read_exact`s and HTTP-CONNECT's byte-by-byte status scan have no timeout
/// of their own, so an upstream that accepts the TCP connection but never
/// answers would otherwise hang the attempt indefinitely.
async fn dial_one(upstream: &Upstream, target_host: &str, target_port: u16, preferred: Option<AddressFamily>) -> Result<TcpStream, SelectorError> {
    match tokio::time::timeout(DIAL_DEADLINE, dial_one_inner(upstream, target_host, target_port, preferred)).await {
        Ok(result) => result,
        Err(_) => Err(SelectorError::Timeout(format!("{}:{}", upstream.host, upstream.port))),
    }
}

/// Selects and dials an upstream for `target_host:target_port`. With no
/// enabled upstreams, dials the target directly. Otherwise walks the
/// strategy's attempt order, recording per-entry failures, and returns the
/// first success or an aggregated [`SelectorError::AllUpstreamsFailed`].
pub async fn select_and_dial(
    target_host: &str,
    target_port: u16,
    preferred: Option<AddressFamily>,
    upstreams: &[Upstream],
    strategy: LoadBalancingStrategy,
    cursor: &RoundRobinCursor,
) -> Result<TcpStream, SelectorError> {
    if upstreams.is_empty() {
        return Ok(dial(target_host, target_port, preferred).await?);
    }

    let order = attempt_order(upstreams, strategy, cursor);
    let mut errors = Vec::with_capacity(order.len());
    for upstream in &order {
        if upstream.host.is_empty() {
            continue;
        }
        let label = format!("{:?}://{}:{}", upstream.kind, upstream.host, upstream.port);
        match dial_one(upstream, target_host, target_port, preferred).await {
            Ok(stream) => {
                info!(upstream = %label, "upstream connected");
                return Ok(stream);
            }
            Err(e) => {
                warn!(upstream = %label, error = %e, "upstream attempt failed");
                errors.push((label, e.to_string()));
            }
        }
    }

    Err(SelectorError::AllUpstreamsFailed(errors))
}
