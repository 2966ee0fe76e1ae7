//! A minimal RFC 1928 SOCKS5 client: no-auth handshake plus a CONNECT
//! request for IPv4, IPv6, or domain-name targets.

use std::net::IpAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::SocksError;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const RESERVED: u8 = 0x00;
const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

/// Performs the handshake and CONNECT over an already-open TCP stream to a
/// SOCKS5 server, tunneling to `target_host:target_port`.
pub async fn connect(mut stream: TcpStream, target_host: &str, target_port: u16) -> Result<TcpStream, SocksError> {
    stream.write_all(&[VERSION, 0x01, METHOD_NO_AUTH]).await?;

    let mut method_reply = [0u8; 2];
    stream.read_exact(&mut method_reply).await?;
    if method_reply != [VERSION, METHOD_NO_AUTH] {
        return Err(SocksError::HandshakeRejected);
    }

    let mut request = vec![VERSION, CMD_CONNECT, RESERVED];
    if let Ok(IpAddr::V4(v4)) = target_host.parse::<IpAddr>() {
        request.push(ATYP_V4);
        request.extend_from_slice(&v4.octets());
    } else if let Ok(IpAddr::V6(v6)) = target_host.parse::<IpAddr>() {
        request.push(ATYP_V6);
        request.extend_from_slice(&v6.octets());
    } else {
        let name = target_host.as_bytes();
        request.push(ATYP_DOMAIN);
        request.push(name.len() as u8);
        request.extend_from_slice(name);
    }
    request.extend_from_slice(&target_port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[1] != 0x00 {
        return Err(SocksError::from_status_byte(header[1]));
    }

    match header[3] {
        ATYP_V4 => {
            let mut tail = [0u8; 4 + 2];
            stream.read_exact(&mut tail).await?;
        }
        ATYP_V6 => {
            let mut tail = [0u8; 16 + 2];
            stream.read_exact(&mut tail).await?;
        }
        ATYP_DOMAIN => {
            let mut len_byte = [0u8; 1];
            stream.read_exact(&mut len_byte).await?;
            let mut tail = vec![0u8; len_byte[0] as usize + 2];
            stream.read_exact(&mut tail).await?;
        }
        other => return Err(SocksError::UnknownStatus(other)),
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
    async fn ipv4_round_trip() {
        let (client, mut server) = pair().await;
        let server_task = tokio::spawn(async move {
            let mut method_sel = [0u8; 3];
            server.read_exact(&mut method_sel).await.unwrap();
            assert_eq!(method_sel, [0x05, 0x01, 0x00]);
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut req = vec![0u8; 4];
            server.read_exact(&mut req).await.unwrap();
            assert_eq!(req, vec![0x05, 0x01, 0x00, 0x01]);
            let mut addr_port = [0u8; 6];
            server.read_exact(&mut addr_port).await.unwrap();
            assert_eq!(&addr_port[..4], &[93, 184, 216, 34]);
            assert_eq!(u16::from_be_bytes([addr_port[4], addr_port[5]]), 80);

            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let _stream = connect(client, "93.184.216.34", 80).await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn ipv6_round_trip() {
        let (client, mut server) = pair().await;
        let server_task = tokio::spawn(async move {
            let mut method_sel = [0u8; 3];
            server.read_exact(&mut method_sel).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut req = vec![0u8; 4];
            server.read_exact(&mut req).await.unwrap();
            assert_eq!(req[3], 0x04);
            let mut addr_port = [0u8; 18];
            server.read_exact(&mut addr_port).await.unwrap();

            let mut reply = vec![0x05, 0x00, 0x00, 0x04];
            reply.extend_from_slice(&[0u8; 16]);
            reply.extend_from_slice(&[0, 0]);
            server.write_all(&reply).await.unwrap();
        });

        let _stream = connect(client, "::1", 443).await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn domain_round_trip_with_no_leaked_bytes() {
        let (client, mut server) = pair().await;
        let server_task = tokio::spawn(async move {
            let mut method_sel = [0u8; 3];
            server.read_exact(&mut method_sel).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut fixed = [0u8; 4];
            server.read_exact(&mut fixed).await.unwrap();
            assert_eq!(fixed[3], 0x03);
            let mut len_byte = [0u8; 1];
            server.read_exact(&mut len_byte).await.unwrap();
            let mut name = vec![0u8; len_byte[0] as usize];
            server.read_exact(&mut name).await.unwrap();
            assert_eq!(name, b"example.test");
            let mut port = [0u8; 2];
            server.read_exact(&mut port).await.unwrap();
            assert_eq!(u16::from_be_bytes(port), 443);

            let mut reply = vec![0x05, 0x00, 0x00, 0x03, 4];
            reply.extend_from_slice(b"test");
            reply.extend_from_slice(&[0, 0]);
            server.write_all(&reply).await.unwrap();
            server.write_all(b"tunnel-bytes").await.unwrap();
        });

        let mut stream = connect(client, "example.test", 443).await.unwrap();
        server_task.await.unwrap();

        let mut leaked = vec![0u8; 12];
        stream.read_exact(&mut leaked).await.unwrap();
        assert_eq!(&leaked, b"tunnel-bytes");
    }

    #[tokio::test]
    async fn rejected_reply_status_maps_to_error() {
        let (client, mut server) = pair().await;
        let server_task = tokio::spawn(async move {
            let mut method_sel = [0u8; 3];
            server.read_exact(&mut method_sel).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();
            let mut req = vec![0u8; 4];
            server.read_exact(&mut req).await.unwrap();
            let mut addr_port = [0u8; 6];
            server.read_exact(&mut addr_port).await.unwrap();
            server
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let err = connect(client, "1.2.3.4", 1).await.unwrap_err();
        assert!(matches!(err, SocksError::ConnectionRefused));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn non_no_auth_method_reply_is_fatal() {
        let (client, mut server) = pair().await;
        let server_task = tokio::spawn(async move {
            let mut method_sel = [0u8; 3];
            server.read_exact(&mut method_sel).await.unwrap();
            server.write_all(&[0x05, 0xff]).await.unwrap();
        });

        let err = connect(client, "1.2.3.4", 1).await.unwrap_err();
        assert!(matches!(err, SocksError::HandshakeRejected));
        server_task.await.unwrap();
    }
}
