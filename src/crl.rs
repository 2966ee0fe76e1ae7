//! Stub CRL distribution endpoint. Real CRL encoding is an external
//! collaborator (§1); this only owns the bind/serve/stop lifecycle and always
//! answers with a fixed placeholder body, matching the spec's scope line that
//! this endpoint is "a trivial static-byte responder".

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const PLACEHOLDER_BODY: &[u8] = b"-----BEGIN X509 CRL-----\n-----END X509 CRL-----\n";

pub struct CrlResponder {
    cancel: CancellationToken,
}

impl CrlResponder {
    /// Binds `port` and spawns the accept loop; returns immediately, handing
    /// back a handle whose `stop` cancels the loop.
    pub async fn start(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("binding CRL responder on port {port}"))?;
        info!(port, "CRL responder listening");

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = loop_cancel.cancelled() => return,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((mut stream, _)) => {
                                tokio::spawn(async move {
                                    let response = format!(
                                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/pkix-crl\r\n\r\n",
                                        PLACEHOLDER_BODY.len()
                                    );
                                    let _ = stream.write_all(response.as_bytes()).await;
                                    let _ = stream.write_all(PLACEHOLDER_BODY).await;
                                });
                            }
                            Err(e) => {
                                if loop_cancel.is_cancelled() {
                                    return;
                                }
                                error!(error = %e, "CRL responder accept failed");
                            }
                        }
                    }
                }
            }
        });

        Ok(CrlResponder { cancel })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn serves_placeholder_body_and_stops_on_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let responder = CrlResponder::start(port).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf);
        assert!(text.contains("200 OK"));
        assert!(text.ends_with("-----END X509 CRL-----\n"));

        responder.stop();
    }
}
