//! Stream classification: peek the first few bytes off a fresh client socket
//! and decide whether it is a TLS handshake or a plain-text proxy request,
//! without losing any of the peeked bytes for the next reader.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::timeout;
use tracing::warn;

use crate::error::HandlerError;

const PEEK_LEN: usize = 5;
const CLASSIFY_DEADLINE: Duration = Duration::from_secs(5);

/// A stream that yields a buffered prefix before delegating reads to the
/// wrapped transport; writes always go straight to the transport. Safe to use
/// as the `IO` type behind a TLS server handshake because no peeked bytes are
/// ever dropped (I3).
#[derive(Debug)]
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    prefix_pos: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        PrefixedStream { prefix, prefix_pos: 0, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.prefix_pos < self.prefix.len() {
            let remaining = &self.prefix[self.prefix_pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.prefix_pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Pure function: is this byte prefix the start of a TLS record carrying a
/// handshake message, versions 1.0 through 1.3?
pub fn is_tls_prefix(prefix: &[u8]) -> bool {
    prefix.len() >= 3 && prefix[0] == 0x16 && prefix[1] == 0x03 && (0x01..=0x04).contains(&prefix[2])
}

/// Peeks up to [`PEEK_LEN`] bytes off `stream` under a 5s deadline and
/// classifies them. Returns the prefixed stream and the classification.
pub async fn classify<S>(mut stream: S) -> Result<(PrefixedStream<S>, bool), HandlerError>
where
    S: AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut buf = vec![0u8; PEEK_LEN];
    let read = timeout(CLASSIFY_DEADLINE, async {
        let mut total = 0;
        while total < PEEK_LEN {
            let n = stream.read(&mut buf[total..]).await?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok::<usize, std::io::Error>(total)
    })
    .await
    .map_err(|_| HandlerError::ClassifyTimeout)?
    .map_err(HandlerError::Io)?;

    if read == 0 {
        warn!("client closed connection before sending any bytes");
        return Err(HandlerError::ClientDisconnect);
    }

    buf.truncate(read);
    let is_tls = is_tls_prefix(&buf);
    Ok((PrefixedStream::new(buf, stream), is_tls))
}
