//! GELF over UDP
//!
//! Messages are sent uncompressed. A message that does not fit in one
//! datagram is split into GELF chunks, each prefixed with the chunk magic,
//! an 8-byte message id, the chunk sequence number and the chunk count.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tracing::debug;

use crate::sender::{MessageSink, SinkError};

/// Largest datagram sent, chunk header included
pub const MAX_DATAGRAM_SIZE: usize = 1420;

/// Graylog discards messages split into more chunks than this
pub const MAX_CHUNKS: usize = 128;

const CHUNK_MAGIC: [u8; 2] = [0x1e, 0x0f];
const CHUNK_HEADER_SIZE: usize = 12;
const CHUNK_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - CHUNK_HEADER_SIZE;

/// Delivers GELF messages to a single Graylog UDP input
#[derive(Debug)]
pub struct UdpGelfSink {
    socket: UdpSocket,
    target: SocketAddr,
    next_id: AtomicU64,
}

impl UdpGelfSink {
    /// Resolve `host:port` and connect a local socket of the matching family
    pub async fn connect(host: &str, port: u16) -> Result<Self, SinkError> {
        let endpoint = format!("{host}:{port}");
        let target = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| SinkError::Resolve(endpoint.clone()))?;

        let bind: SocketAddr = if target.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(target).await?;

        debug!(%endpoint, %target, "GELF UDP sink connected");

        Ok(Self {
            socket,
            target,
            next_id: AtomicU64::new(id_seed()),
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl MessageSink for UdpGelfSink {
    async fn send(&self, message: &str) -> Result<(), SinkError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        for datagram in chunk_message(message.as_bytes(), id)? {
            self.socket.send(&datagram).await?;
        }
        Ok(())
    }
}

/// Split a serialized message into the datagrams that carry it
///
/// A message that fits in [`MAX_DATAGRAM_SIZE`] is returned as-is.
pub fn chunk_message(message: &[u8], id: u64) -> Result<Vec<Vec<u8>>, SinkError> {
    if message.len() <= MAX_DATAGRAM_SIZE {
        return Ok(vec![message.to_vec()]);
    }

    let count = message.len().div_ceil(CHUNK_PAYLOAD_SIZE);
    if count > MAX_CHUNKS {
        return Err(SinkError::TooLarge {
            size: message.len(),
        });
    }

    let datagrams = message
        .chunks(CHUNK_PAYLOAD_SIZE)
        .enumerate()
        .map(|(seq, payload)| {
            let mut datagram = Vec::with_capacity(CHUNK_HEADER_SIZE + payload.len());
            datagram.extend_from_slice(&CHUNK_MAGIC);
            datagram.extend_from_slice(&id.to_be_bytes());
            datagram.push(seq as u8);
            datagram.push(count as u8);
            datagram.extend_from_slice(payload);
            datagram
        })
        .collect();

    Ok(datagrams)
}

/// Starting message id, distinct across restarts
fn id_seed() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default();
    nanos ^ u64::from(std::process::id()).rotate_left(32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_message_is_not_chunked() {
        let datagrams = chunk_message(b"{\"version\":\"1.1\"}", 7).unwrap();
        assert_eq!(datagrams, vec![b"{\"version\":\"1.1\"}".to_vec()]);
    }

    #[test]
    fn test_large_message_is_chunked() {
        let message = vec![b'x'; CHUNK_PAYLOAD_SIZE * 2 + 10];
        let datagrams = chunk_message(&message, 0x0102_0304_0506_0708).unwrap();

        assert_eq!(datagrams.len(), 3);
        for (seq, datagram) in datagrams.iter().enumerate() {
            assert_eq!(&datagram[..2], &CHUNK_MAGIC);
            assert_eq!(&datagram[2..10], &[1, 2, 3, 4, 5, 6, 7, 8]);
            assert_eq!(datagram[10], seq as u8);
            assert_eq!(datagram[11], 3);
            assert!(datagram.len() <= MAX_DATAGRAM_SIZE);
        }
        assert_eq!(datagrams[2].len(), CHUNK_HEADER_SIZE + 10);

        let payload: Vec<u8> = datagrams
            .iter()
            .flat_map(|d| d[CHUNK_HEADER_SIZE..].to_vec())
            .collect();
        assert_eq!(payload, message);
    }

    #[test]
    fn test_oversized_message_is_rejected() {
        let message = vec![b'x'; CHUNK_PAYLOAD_SIZE * MAX_CHUNKS + 1];
        let err = chunk_message(&message, 1).unwrap_err();
        assert!(matches!(err, SinkError::TooLarge { size } if size == message.len()));
    }

    #[tokio::test]
    async fn test_udp_sink_delivers_message() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        let sink = UdpGelfSink::connect("127.0.0.1", port).await.unwrap();
        assert_eq!(sink.target(), server.local_addr().unwrap());

        let message = r#"{"host":"node-1","short_message":"hello","timestamp":"1.0000","version":"1.1"}"#;
        sink.send(message).await.unwrap();

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let len = tokio::time::timeout(std::time::Duration::from_secs(2), server.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], message.as_bytes());
    }
}
