//! Opens a TCP tunnel through an HTTP proxy via `CONNECT host:port`.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::HttpConnectError;

/// Sends a `CONNECT` request to an already-open HTTP proxy stream and waits
/// for the header block; any status other than 200 is a fatal rejection. Any
/// response-body bytes the proxy already pushed are left unconsumed in the
/// tunnel (the success path has none).
pub async fn connect(mut stream: TcpStream, target_host: &str, target_port: u16) -> Result<TcpStream, HttpConnectError> {
    let request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: Keep-Alive\r\n\r\n",
        host = target_host,
        port = target_port
    );
    stream.write_all(request.as_bytes()).await?;

    let mut header = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(HttpConnectError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed before CONNECT response completed",
            )));
        }
        header.push(byte[0]);
        if header.ends_with(b"\r\n\r\n") {
            break;
        }
    }

    let header_str = String::from_utf8_lossy(&header);
    let status_line = header_str
        .lines()
        .next()
        .ok_or_else(|| HttpConnectError::MalformedStatusLine(header_str.to_string()))?;

    let mut parts = status_line.splitn(3, ' ');
    let _version = parts
        .next()
        .ok_or_else(|| HttpConnectError::MalformedStatusLine(status_line.to_string()))?;
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| HttpConnectError::MalformedStatusLine(status_line.to_string()))?;
    let reason = parts.next().unwrap_or("").trim_end().to_string();

    if status != 200 {
        return Err(HttpConnectError::UpstreamRejected { status, reason });
    }

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn writes_expected_connect_request_and_succeeds() {
        let (client, mut server) = pair().await;
        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let n = server.read(&mut buf).await.unwrap();
            let got = String::from_utf8_lossy(&buf[..n]).to_string();
            assert_eq!(
                got,
                "CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\nProxy-Connection: Keep-Alive\r\n\r\n"
            );
            server.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await.unwrap();
            server.write_all(b"tunnel-data").await.unwrap();
        });

        let mut stream = connect(client, "example.test", 443).await.unwrap();
        server_task.await.unwrap();

        let mut buf = vec![0u8; 11];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tunnel-data");
    }

    #[tokio::test]
    async fn non_200_status_is_rejected() {
        let (client, mut server) = pair().await;
        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let _ = server.read(&mut buf).await.unwrap();
            server.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await.unwrap();
        });

        let err = connect(client, "example.test", 443).await.unwrap_err();
        match err {
            HttpConnectError::UpstreamRejected { status, reason } => {
                assert_eq!(status, 407);
                assert_eq!(reason, "Proxy Authentication Required");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn eof_before_terminator_is_an_error() {
        let (client, mut server) = pair().await;
        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let _ = server.read(&mut buf).await.unwrap();
            server.write_all(b"HTTP/1.1 200 OK\r\n").await.unwrap();
            drop(server);
        });

        let err = connect(client, "example.test", 443).await.unwrap_err();
        assert!(matches!(err, HttpConnectError::Io(_)));
        server_task.await.unwrap();
    }
}
