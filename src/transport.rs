//! Transport abstraction: the seam concrete mediums (LAN/TCP, Bluetooth)
//! plug into.
//!
//! Two traits: [`Transport`] (the byte-stream and auxiliary-payload
//! primitives a connected peer exposes) and [`TransportFactory`] (discovery
//! + identity broadcast, producing `Transport` instances). Concrete
//! transports are out of scope here; [`mock`] provides the in-process
//! fixture this crate's own tests run against.

use crate::crypto::CertificateInfo;
use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// How a transport prefers to be ranked against others attached to the same
/// device. Higher wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(pub u8);

/// Static properties of a transport connection, consulted by
/// [`crate::channel::Channel`] for framing limits and by
/// [`crate::device::Device`] for channel ranking.
#[derive(Debug, Clone, Copy)]
pub struct TransportCapabilities {
    /// Maximum single packet size this transport is willing to carry.
    pub max_packet_size: usize,
    /// Ranking among concurrently attached channels; higher is preferred.
    pub priority: Priority,
}

/// Transport kind, used only for diagnostics/addressing — not for ranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAddress {
    Tcp(SocketAddr),
    Bluetooth {
        address: String,
        service_uuid: Option<uuid::Uuid>,
    },
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportAddress::Tcp(addr) => write!(f, "tcp://{addr}"),
            TransportAddress::Bluetooth { address, .. } => write!(f, "bt://{address}"),
        }
    }
}

/// A single, already-authenticated byte-stream connection to a peer.
///
/// Framing (LF-delimited JSON) lives one layer up, in
/// [`crate::channel::Channel`]; this trait exposes the raw duplex stream as
/// non-consuming `read`/`write_all` calls (interior mutability over the
/// underlying socket halves is the implementor's concern) so the same
/// `Transport` handle can keep serving auxiliary payload connections and
/// certificate lookups for its whole lifetime.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn capabilities(&self) -> TransportCapabilities;
    fn remote_address(&self) -> TransportAddress;

    /// This device's certificate, as presented during the transport
    /// handshake.
    fn local_certificate(&self) -> &CertificateInfo;
    /// The peer's certificate, as presented during the transport handshake.
    fn peer_certificate_der(&self) -> &[u8];

    /// Read at least one byte into `buf`, returning the count read, or `0`
    /// on clean EOF.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write the entire buffer. Concurrent writers are the caller's
    /// problem; [`crate::channel::Channel`] already serializes its own
    /// writes.
    async fn write_all(&self, buf: &[u8]) -> Result<()>;

    /// Open an auxiliary connection for a single payload upload: returns a
    /// coordinate object to advertise in `payloadTransferInfo` plus the
    /// output stream the caller fills.
    async fn open_upload(
        &self,
    ) -> Result<(
        serde_json::Map<String, serde_json::Value>,
        Box<dyn AsyncWrite + Send + Unpin>,
    )>;

    /// Connect to a peer-advertised payload endpoint for a download.
    async fn open_download(
        &self,
        info: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// Close the underlying connection. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Best-effort liveness check; defaults to `true` since most transports
    /// only discover death on the next read/write.
    fn is_connected(&self) -> bool {
        true
    }
}

/// Produces [`Transport`] instances from discovery events and knows how to
/// announce this peer's identity over its medium.
#[async_trait]
pub trait TransportFactory: Send + Sync + fmt::Debug {
    /// Broadcast (`target: None`) or unicast an identity announcement.
    async fn identify(&self, target: Option<&str>) -> Result<()>;

    fn transport_type(&self) -> &'static str;
}

/// In-process duplex transport used by this crate's own tests, standing in
/// for a real socket.
pub mod mock {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
    use tokio::sync::Mutex;

    #[derive(Debug)]
    pub struct MockTransport {
        capabilities: TransportCapabilities,
        local_certificate: CertificateInfo,
        peer_certificate_der: Vec<u8>,
        read_half: Mutex<ReadHalf<tokio::io::DuplexStream>>,
        write_half: Mutex<WriteHalf<tokio::io::DuplexStream>>,
    }

    impl MockTransport {
        /// Build a connected pair of mock transports sharing an in-memory
        /// duplex pipe, each carrying its own certificate identity.
        pub fn pair(
            local_cert: CertificateInfo,
            peer_cert: CertificateInfo,
            priority: Priority,
        ) -> (MockTransport, MockTransport) {
            let (stream_a, stream_b) = tokio::io::duplex(64 * 1024);
            let caps = TransportCapabilities {
                max_packet_size: 10 * 1024 * 1024,
                priority,
            };
            let a_cert_der = local_cert.certificate.clone();
            let b_cert_der = peer_cert.certificate.clone();
            let (a_read, a_write) = tokio::io::split(stream_a);
            let (b_read, b_write) = tokio::io::split(stream_b);

            (
                MockTransport {
                    capabilities: caps,
                    local_certificate: local_cert,
                    peer_certificate_der: b_cert_der,
                    read_half: Mutex::new(a_read),
                    write_half: Mutex::new(a_write),
                },
                MockTransport {
                    capabilities: caps,
                    local_certificate: peer_cert,
                    peer_certificate_der: a_cert_der,
                    read_half: Mutex::new(b_read),
                    write_half: Mutex::new(b_write),
                },
            )
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn capabilities(&self) -> TransportCapabilities {
            self.capabilities
        }

        fn remote_address(&self) -> TransportAddress {
            TransportAddress::Tcp("127.0.0.1:1716".parse().unwrap())
        }

        fn local_certificate(&self) -> &CertificateInfo {
            &self.local_certificate
        }

        fn peer_certificate_der(&self) -> &[u8] {
            &self.peer_certificate_der
        }

        async fn read(&self, buf: &mut [u8]) -> Result<usize> {
            let mut half = self.read_half.lock().await;
            Ok(half.read(buf).await?)
        }

        async fn write_all(&self, buf: &[u8]) -> Result<()> {
            let mut half = self.write_half.lock().await;
            half.write_all(buf).await?;
            Ok(())
        }

        async fn open_upload(
            &self,
        ) -> Result<(
            serde_json::Map<String, serde_json::Value>,
            Box<dyn AsyncWrite + Send + Unpin>,
        )> {
            Err(crate::error::ProtocolError::NotSupported(
                "mock transport does not implement payload transfer".to_string(),
            ))
        }

        async fn open_download(
            &self,
            _info: &serde_json::Map<String, serde_json::Value>,
        ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
            Err(crate::error::ProtocolError::NotSupported(
                "mock transport does not implement payload transfer".to_string(),
            ))
        }

        async fn close(&self) -> Result<()> {
            let mut half = self.write_half.lock().await;
            half.shutdown().await.ok();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_address_display() {
        let addr = TransportAddress::Tcp("127.0.0.1:1716".parse().unwrap());
        assert_eq!(addr.to_string(), "tcp://127.0.0.1:1716");

        let addr = TransportAddress::Bluetooth {
            address: "AA:BB:CC".to_string(),
            service_uuid: None,
        };
        assert_eq!(addr.to_string(), "bt://AA:BB:CC");
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority(10) > Priority(1));
    }
}
