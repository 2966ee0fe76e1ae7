//! Resolves a (host, port) pair and opens an outbound TCP connection,
//! optionally preferring one address family.

use std::net::{IpAddr, SocketAddr};

use tokio::net::{lookup_host, TcpStream};

use crate::error::DialError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::V4 => addr.is_ipv4(),
            AddressFamily::V6 => addr.is_ipv6(),
        }
    }
}

/// Connects to `host:port`. If `host` is a literal IP, dials it directly on
/// its native family. Otherwise resolves via DNS: with no family preference,
/// `TcpStream::connect` already races/selects the first usable address;
/// with a preference, addresses of that family are tried first, then the
/// opposite family, then whatever resolution returned first.
pub async fn dial(host: &str, port: u16, preferred: Option<AddressFamily>) -> Result<TcpStream, DialError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        let addr = SocketAddr::new(ip, port);
        return TcpStream::connect(addr)
            .await
            .map_err(|source| DialError::Connect { addr, source });
    }

    match preferred {
        None => TcpStream::connect((host, port)).await.map_err(DialError::from),
        Some(family) => {
            let mut addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
            if addrs.is_empty() {
                return Err(DialError::NoAddresses(host.to_string()));
            }
            addrs.sort_by_key(|a| !family.matches(a));
            let mut last_err = None;
            for addr in addrs {
                match TcpStream::connect(addr).await {
                    Ok(stream) => return Ok(stream),
                    Err(source) => last_err = Some(DialError::Connect { addr, source }),
                }
            }
            Err(last_err.expect("non-empty address list yields at least one attempt"))
        }
    }
}
