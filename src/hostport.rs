//! `"host:port"` parsing, including bracketed IPv6 literals (`"[::1]:8443"`).

use anyhow::{anyhow, Result};

/// Parses `host`, `host:port`, or `[v6]:port`/`[v6]` forms. `default_port` is
/// used whenever no port is present in `input`.
pub fn parse(input: &str, default_port: u16) -> Result<(String, u16)> {
    if input.trim().is_empty() {
        return Err(anyhow!("host/port string is empty"));
    }

    if let Some(rest) = input.strip_prefix('[') {
        let close = rest
            .find(']')
            .ok_or_else(|| anyhow!("unmatched '[' in {input:?}"))?;
        let host = &rest[..close];
        let tail = &rest[close + 1..];
        if tail.is_empty() {
            return Ok((host.to_string(), default_port));
        }
        let port_str = tail
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("unexpected trailing characters after ']' in {input:?}"))?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| anyhow!("invalid port {port_str:?} in {input:?}"))?;
        return Ok((host.to_string(), port));
    }

    let colon_count = input.matches(':').count();
    match colon_count {
        0 => Ok((input.to_string(), default_port)),
        1 => {
            let (host, port_str) = input.split_once(':').expect("checked exactly one colon");
            let port: u16 = port_str
                .parse()
                .map_err(|_| anyhow!("invalid port {port_str:?} in {input:?}"))?;
            Ok((host.to_string(), port))
        }
        _ => Err(anyhow!(
            "ambiguous host/port {input:?}: multiple ':' outside brackets"
        )),
    }
}
