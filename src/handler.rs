//! Per-connection state machine: classify, optionally terminate TLS, parse
//! one proxy request, dispatch to the upstream selector, and relay bytes
//! until either side closes.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::classify::{classify, PrefixedStream};
use crate::config::{LoadBalancingStrategy, Upstream};
use crate::dial::AddressFamily;
use crate::error::HandlerError;
use crate::hostport;
use crate::selector::{select_and_dial, RoundRobinCursor};

const RELAY_BUFFER_SIZE: usize = 80 * 1024;

/// Object-safe bound satisfied by both plain `TcpStream`s and terminated TLS
/// streams, so the rest of the handler doesn't need to know which one it has.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Shared, read-only context handed to every connection.
pub struct HandlerContext {
    pub server_cert: Option<Arc<rustls::ServerConfig>>,
    pub upstreams: Vec<Upstream>,
    pub strategy: LoadBalancingStrategy,
    pub cursor: RoundRobinCursor,
}

#[derive(Debug)]
struct ParsedRequest {
    host: String,
    port: u16,
    /// For CONNECT: unused. For forward-HTTP: the rewritten request line plus
    /// every collected header line, each already including its own CRLF.
    forward_lines: Vec<String>,
    is_connect: bool,
}

pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<HandlerContext>) {
    if let Err(e) = run(stream, peer, &ctx).await {
        error!(%peer, error = %e, "connection closed with error");
    }
}

async fn run(stream: TcpStream, peer: SocketAddr, ctx: &HandlerContext) -> Result<(), HandlerError> {
    let preferred_family = match peer {
        SocketAddr::V4(_) => Some(AddressFamily::V4),
        SocketAddr::V6(_) => Some(AddressFamily::V6),
    };

    let (prefixed, is_tls) = classify(stream).await?;
    debug!(%peer, is_tls, "connection classified");

    if is_tls {
        let server_cfg = ctx.server_cert.clone().ok_or(HandlerError::TlsNotEnabled)?;
        let acceptor = TlsAcceptor::from(server_cfg);
        let tls_stream = acceptor
            .accept(prefixed)
            .await
            .map_err(HandlerError::TlsHandshakeFailure)?;
        serve_parsed_request(tls_stream, peer, ctx, preferred_family).await
    } else {
        serve_parsed_request(prefixed, peer, ctx, preferred_family).await
    }
}

async fn serve_parsed_request<S>(
    stream: S,
    peer: SocketAddr,
    ctx: &HandlerContext,
    preferred_family: Option<AddressFamily>,
) -> Result<(), HandlerError>
where
    S: AsyncStream + 'static,
{
    let mut reader = BufReader::new(stream);
    let request = read_request(&mut reader).await?;

    let upstream_stream = select_and_dial(
        &request.host,
        request.port,
        preferred_family,
        &ctx.upstreams,
        ctx.strategy,
        &ctx.cursor,
    )
    .await?;

    if request.is_connect {
        let mut client = take_unread_prefix(reader);
        client.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
        relay(client, upstream_stream, peer, &request.host, request.port).await;
    } else {
        let mut upstream = upstream_stream;
        for line in &request.forward_lines {
            upstream.write_all(line.as_bytes()).await?;
        }
        upstream.write_all(b"\r\n").await?;
        let client = take_unread_prefix(reader);
        relay(client, upstream, peer, &request.host, request.port).await;
    }

    Ok(())
}

/// `BufReader::into_inner` drops any bytes still sitting in its internal
/// buffer (CONNECT tunnel payload or a POST body the client packed into the
/// same TCP segment as the request line/headers). Carry them forward as a
/// prefix instead, so `relay` sees every byte the client sent (I3).
fn take_unread_prefix<S>(reader: BufReader<S>) -> PrefixedStream<S>
where
    S: AsyncStream,
{
    let leftover = reader.buffer().to_vec();
    PrefixedStream::new(leftover, reader.into_inner())
}

async fn read_request<S>(reader: &mut BufReader<S>) -> Result<ParsedRequest, HandlerError>
where
    S: AsyncStream,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(HandlerError::ClientDisconnect);
    }
    let line = line.trim_end_matches(['\r', '\n']);
    let tokens: Vec<&str> = line.splitn(3, ' ').collect();
    if tokens.len() < 3 {
        return Err(HandlerError::BadRequest(format!("malformed request line {line:?}")));
    }
    let method = tokens[0].to_string();
    let target = tokens[1].to_string();

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = hostport::parse(&target, 443).map_err(|e| HandlerError::BadRequest(e.to_string()))?;
        // CONNECT carries its own header block before the tunnel begins; drain
        // it through the terminating blank line so none of it is mistaken for
        // tunnel payload once relaying starts.
        drain_headers(reader).await?;
        return Ok(ParsedRequest {
            host,
            port,
            forward_lines: Vec::new(),
            is_connect: true,
        });
    }

    let (mut host, mut port, path_and_query) = if let Some(rest) = target.strip_prefix("http://") {
        let (authority, path) = split_authority(rest);
        let (h, p) = hostport::parse(authority, 80).map_err(|e| HandlerError::BadRequest(e.to_string()))?;
        (h, p, path.to_string())
    } else if let Some(rest) = target.strip_prefix("https://") {
        let (authority, path) = split_authority(rest);
        let (h, p) = hostport::parse(authority, 443).map_err(|e| HandlerError::BadRequest(e.to_string()))?;
        (h, p, path.to_string())
    } else {
        (String::new(), 80, target.clone())
    };

    let mut forward_lines = vec![format!("{} {} {}\r\n", method, path_and_query, tokens[2])];

    loop {
        let mut header_line = String::new();
        let n = reader.read_line(&mut header_line).await?;
        if n == 0 {
            return Err(HandlerError::ClientDisconnect);
        }
        if header_line == "\r\n" || header_line == "\n" {
            break;
        }
        if host.is_empty() {
            if let Some((name, value)) = header_line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("host") {
                    let value = value.trim();
                    if let Ok((h, p)) = hostport::parse(value, port) {
                        host = h;
                        port = p;
                    }
                }
            }
        }
        forward_lines.push(header_line);
    }

    if host.is_empty() {
        return Err(HandlerError::BadRequest("forward-HTTP request carried no Host".to_string()));
    }

    Ok(ParsedRequest {
        host,
        port,
        forward_lines,
        is_connect: false,
    })
}

async fn drain_headers<S>(reader: &mut BufReader<S>) -> Result<(), HandlerError>
where
    S: AsyncStream,
{
    loop {
        let mut header_line = String::new();
        let n = reader.read_line(&mut header_line).await?;
        if n == 0 {
            return Err(HandlerError::ClientDisconnect);
        }
        if header_line == "\r\n" || header_line == "\n" {
            return Ok(());
        }
    }
}

fn split_authority(rest: &str) -> (&str, &str) {
    match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    }
}

async fn relay<C, U>(client: C, upstream: U, peer: SocketAddr, target_host: &str, target_port: u16)
where
    C: AsyncStream + 'static,
    U: AsyncStream + 'static,
{
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream);

    let target = format!("{target_host}:{target_port}");
    let to_upstream_target = target.clone();
    let to_upstream = async move {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = match client_r.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            if upstream_w.write_all(&buf[..n]).await.is_err() {
                break;
            }
            total += n as u64;
        }
        let _ = upstream_w.shutdown().await;
        debug!(%peer, target = %to_upstream_target, bytes = total, "client->upstream relay half done");
    };
    let from_upstream_target = target.clone();
    let from_upstream = async move {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = match upstream_r.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            if client_w.write_all(&buf[..n]).await.is_err() {
                break;
            }
            total += n as u64;
        }
        let _ = client_w.shutdown().await;
        debug!(%peer, target = %from_upstream_target, bytes = total, "upstream->client relay half done");
    };

    tokio::join!(to_upstream, from_upstream);
    info!(%peer, target = %target, "relay complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_connect_request_line() {
        let (mut client, server) = tokio::io::duplex(256);
        client.write_all(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n").await.unwrap();
        let mut reader = BufReader::new(server);
        let parsed = read_request(&mut reader).await.unwrap();
        assert!(parsed.is_connect);
        assert_eq!(parsed.host, "example.test");
        assert_eq!(parsed.port, 443);
    }

    #[tokio::test]
    async fn parses_absolute_form_forward_request() {
        let (mut client, server) = tokio::io::duplex(256);
        client
            .write_all(b"GET http://127.0.0.1:19000/foo HTTP/1.1\r\nHost: 127.0.0.1:19000\r\nX-T: 1\r\n\r\n")
            .await
            .unwrap();
        let mut reader = BufReader::new(server);
        let parsed = read_request(&mut reader).await.unwrap();
        assert!(!parsed.is_connect);
        assert_eq!(parsed.host, "127.0.0.1");
        assert_eq!(parsed.port, 19000);
        assert_eq!(parsed.forward_lines[0], "GET /foo HTTP/1.1\r\n");
        assert!(parsed.forward_lines.iter().any(|l| l == "X-T: 1\r\n"));
    }

    #[tokio::test]
    async fn parses_origin_form_request_using_host_header() {
        let (mut client, server) = tokio::io::duplex(256);
        client.write_all(b"GET /foo HTTP/1.1\r\nHost: origin.test:8080\r\n\r\n").await.unwrap();
        let mut reader = BufReader::new(server);
        let parsed = read_request(&mut reader).await.unwrap();
        assert_eq!(parsed.host, "origin.test");
        assert_eq!(parsed.port, 8080);
        assert_eq!(parsed.forward_lines[0], "GET /foo HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn mixed_case_host_header_is_recognized() {
        let (mut client, server) = tokio::io::duplex(256);
        client.write_all(b"GET /foo HTTP/1.1\r\nHOST: origin.test:8080\r\n\r\n").await.unwrap();
        let mut reader = BufReader::new(server);
        let parsed = read_request(&mut reader).await.unwrap();
        assert_eq!(parsed.host, "origin.test");
        assert_eq!(parsed.port, 8080);

        let (mut client2, server2) = tokio::io::duplex(256);
        client2.write_all(b"GET /foo HTTP/1.1\r\nHoSt: origin2.test:9090\r\n\r\n").await.unwrap();
        let mut reader2 = BufReader::new(server2);
        let parsed2 = read_request(&mut reader2).await.unwrap();
        assert_eq!(parsed2.host, "origin2.test");
        assert_eq!(parsed2.port, 9090);
    }

    #[tokio::test]
    async fn bytes_buffered_past_the_headers_are_not_lost_on_connect() {
        let (mut client, server) = tokio::io::duplex(256);
        client
            .write_all(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\ntunnel-payload")
            .await
            .unwrap();
        let mut reader = BufReader::new(server);
        let request = read_request(&mut reader).await.unwrap();
        assert!(request.is_connect);

        let mut client_side = take_unread_prefix(reader);
        let mut got = vec![0u8; b"tunnel-payload".len()];
        client_side.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"tunnel-payload");
    }

    #[tokio::test]
    async fn missing_host_is_bad_request() {
        let (mut client, server) = tokio::io::duplex(256);
        client.write_all(b"GET /foo HTTP/1.1\r\n\r\n").await.unwrap();
        let mut reader = BufReader::new(server);
        let err = read_request(&mut reader).await.unwrap_err();
        assert!(matches!(err, HandlerError::BadRequest(_)));
    }

    #[tokio::test]
    async fn short_request_line_is_bad_request() {
        let (mut client, server) = tokio::io::duplex(256);
        client.write_all(b"GET\r\n\r\n").await.unwrap();
        let mut reader = BufReader::new(server);
        let err = read_request(&mut reader).await.unwrap_err();
        assert!(matches!(err, HandlerError::BadRequest(_)));
    }

    #[tokio::test]
    async fn relay_copies_both_directions_until_eof() {
        let (client, client_peer) = tokio::io::duplex(64);
        let (upstream, upstream_peer) = tokio::io::duplex(64);

        let (mut client_peer_r, mut client_peer_w) = tokio::io::split(client_peer);
        let (mut upstream_peer_r, mut upstream_peer_w) = tokio::io::split(upstream_peer);

        let relay_task = tokio::spawn(relay(
            client,
            upstream,
            "127.0.0.1:1".parse().unwrap(),
            "target",
            80,
        ));

        client_peer_w.write_all(b"to-upstream").await.unwrap();
        client_peer_w.shutdown().await.unwrap();
        let mut got_at_upstream = Vec::new();
        upstream_peer_r.read_to_end(&mut got_at_upstream).await.unwrap();
        assert_eq!(got_at_upstream, b"to-upstream");

        upstream_peer_w.write_all(b"to-client").await.unwrap();
        upstream_peer_w.shutdown().await.unwrap();
        let mut got_at_client = Vec::new();
        client_peer_r.read_to_end(&mut got_at_client).await.unwrap();
        assert_eq!(got_at_client, b"to-client");

        relay_task.await.unwrap();
    }
}
