//! Framed packet I/O and payload transfer over one transport connection.
//!
//! Combines a read-until-LF framing loop over a growable buffer with a
//! single-writer queue so concurrent callers can write without coordinating
//! among themselves.

use crate::crypto::{self, CertificateInfo};
use crate::error::{ProtocolError, Result};
use crate::identity::IdentityPacket;
use crate::packet::Packet;
use crate::transport::Transport;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace, warn};

/// Initial and untrusted-peer-ceiling read buffer size.
const INITIAL_BUFFER_SIZE: usize = 8192;
/// Growth ceiling once a peer is trusted.
const TRUSTED_BUFFER_CEILING: usize = 10 * 1024 * 1024;

/// One pending outbound packet plus the caller's completion handle.
struct QueuedWrite {
    packet: Packet,
    done: oneshot::Sender<Result<()>>,
}

/// A full-duplex, framed packet stream over one [`Transport`] connection.
///
/// Reads are driven explicitly via [`Channel::read_packet`]; writes are
/// serialized internally so concurrent callers may call
/// [`Channel::write_packet`] without coordinating among themselves.
pub struct Channel {
    transport: Arc<dyn Transport>,
    local_certificate: CertificateInfo,
    peer_certificate_der: Vec<u8>,
    /// Timestamp from the pairing exchange, needed for the v8 verification
    /// key formula. `None` until pairing completes on a v8 peer.
    pairing_timestamp: Mutex<Option<i64>>,
    trusted: AtomicBool,
    closed: Arc<AtomicBool>,
    read_buf: Mutex<ReadState>,
    write_tx: mpsc::UnboundedSender<QueuedWrite>,
    /// The peer's identity, as read off this connection before it was
    /// handed to a [`crate::device::Device`]. Populated by the channel
    /// service that negotiated this channel.
    peer_identity: Mutex<Option<IdentityPacket>>,
    /// Process-unique id, used only to compare two `Arc<Channel>` handles
    /// for identity (e.g. "is this the channel that just closed").
    id: u64,
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

struct ReadState {
    buf: Vec<u8>,
    /// Bytes already consumed from the front of `buf`, to avoid repeated
    /// memmoves while scanning for more data than one read yields.
    filled: usize,
}

impl Channel {
    /// Wrap a connected transport. `trusted` should reflect whether the
    /// peer is already a paired device (affects the read buffer ceiling).
    pub fn new(transport: Arc<dyn Transport>, trusted: bool) -> Self {
        let local_certificate = transport.local_certificate().clone();
        let peer_certificate_der = transport.peer_certificate_der().to_vec();

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let channel_transport = transport.clone();
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(Self::run_writer(channel_transport, write_rx, closed.clone()));

        Self {
            transport,
            local_certificate,
            peer_certificate_der,
            pairing_timestamp: Mutex::new(None),
            trusted: AtomicBool::new(trusted),
            closed,
            read_buf: Mutex::new(ReadState {
                buf: vec![0u8; INITIAL_BUFFER_SIZE],
                filled: 0,
            }),
            write_tx,
            peer_identity: Mutex::new(None),
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn set_peer_identity(&self, identity: IdentityPacket) {
        *self.peer_identity.lock().await = Some(identity);
    }

    pub async fn peer_identity(&self) -> Option<IdentityPacket> {
        self.peer_identity.lock().await.clone()
    }

    pub fn mark_trusted(&self) {
        self.trusted.store(true, Ordering::SeqCst);
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn set_pairing_timestamp(&self, ts: i64) {
        *self.pairing_timestamp.lock().await = Some(ts);
    }

    pub fn remote_address(&self) -> crate::transport::TransportAddress {
        self.transport.remote_address()
    }

    pub fn capabilities(&self) -> crate::transport::TransportCapabilities {
        self.transport.capabilities()
    }

    /// Derive the human-verifiable pairing string from both certificates'
    /// SubjectPublicKeyInfo bytes.
    pub async fn verification_key(&self) -> Result<String> {
        let local_spki = self.local_certificate.subject_public_key_info()?;
        let peer_cert = openssl::x509::X509::from_der(&self.peer_certificate_der)?;
        let peer_spki = peer_cert.public_key()?.public_key_to_der()?;

        let ts = *self.pairing_timestamp.lock().await;
        Ok(crypto::derive_verification_key(&local_spki, &peer_spki, ts))
    }

    pub fn peer_fingerprint(&self) -> Result<String> {
        Ok(CertificateInfo::calculate_fingerprint(&self.peer_certificate_der))
    }

    /// Raw DER bytes of the peer's certificate, as presented by the
    /// transport during its handshake. Used by [`crate::device::Device`] to
    /// persist the peer certificate on a successful pairing accept.
    pub fn peer_certificate_der(&self) -> &[u8] {
        &self.peer_certificate_der
    }

    /// Await one complete, validated packet from the transport.
    ///
    /// Fails with [`ProtocolError::ConnectionClosed`] if the channel has
    /// already been closed, or on clean EOF from the transport.
    pub async fn read_packet(&self) -> Result<Packet> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let mut state = self.read_buf.lock().await;
        loop {
            if let Some(pos) = state.buf[..state.filled].iter().position(|&b| b == b'\n') {
                let line = state.buf[..pos].to_vec();
                let remaining = state.filled - (pos + 1);
                state.buf.copy_within(pos + 1..state.filled, 0);
                state.filled = remaining;
                let packet = Packet::from_bytes(&line)?;
                trace!(packet_type = %packet.packet_type, "read_packet");
                return Ok(packet);
            }

            let ceiling = if self.is_trusted() {
                TRUSTED_BUFFER_CEILING
            } else {
                INITIAL_BUFFER_SIZE
            };

            if state.filled == state.buf.len() {
                if state.buf.len() >= ceiling {
                    return Err(ProtocolError::MessageTooLarge {
                        actual: state.buf.len() + 1,
                        max: ceiling,
                    });
                }
                let new_len = (state.buf.len() * 2).min(ceiling);
                state.buf.resize(new_len, 0);
            }

            let filled = state.filled;
            let n = self.transport.read(&mut state.buf[filled..]).await?;
            if n == 0 {
                self.mark_closed();
                return Err(ProtocolError::ConnectionClosed);
            }
            state.filled += n;
        }
    }

    /// Enqueue a packet for writing. Resolves once the packet has actually
    /// reached the transport (or failed).
    pub async fn write_packet(&self, packet: Packet) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.write_tx
            .send(QueuedWrite {
                packet,
                done: done_tx,
            })
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        done_rx.await.map_err(|_| ProtocolError::ConnectionClosed)?
    }

    /// Background task draining the write queue one packet at a time,
    /// stamping `id` with the current time before each send.
    async fn run_writer(
        transport: Arc<dyn Transport>,
        mut rx: mpsc::UnboundedReceiver<QueuedWrite>,
        closed: Arc<AtomicBool>,
    ) {
        while let Some(item) = rx.recv().await {
            let mut packet = item.packet;
            packet.id = crate::packet::current_timestamp_ms();
            let result = match packet.to_bytes() {
                Ok(bytes) => transport.write_all(&bytes).await,
                Err(e) => Err(e),
            };
            let failed = result.is_err();
            let _ = item.done.send(result);
            if failed {
                warn!("channel write failed, draining remaining queue as closed");
                closed.store(true, Ordering::SeqCst);
                while let Ok(next) = rx.try_recv() {
                    let _ = next.done.send(Err(ProtocolError::ConnectionClosed));
                }
                break;
            }
        }
    }

    /// Open an auxiliary upload: send `packet` (annotated with payload
    /// coordinates) then hand back the output stream for the caller to
    /// fill.
    pub async fn upload(&self, packet: Packet) -> Result<(Packet, Box<dyn tokio::io::AsyncWrite + Send + Unpin>)> {
        let (info, sink) = self.transport.open_upload().await?;
        let annotated = packet.with_payload_transfer_info(info);
        self.write_packet(annotated.clone()).await?;
        Ok((annotated, sink))
    }

    /// Connect to the endpoint described in `packet`'s `payloadTransferInfo`
    /// and return the input stream for the caller to drain.
    pub async fn download(&self, packet: &Packet) -> Result<Box<dyn tokio::io::AsyncRead + Send + Unpin>> {
        let info = packet
            .payload_transfer_info
            .as_ref()
            .ok_or_else(|| ProtocolError::MissingField("payloadTransferInfo".to_string()))?;
        self.transport.open_download(info).await
    }

    /// Idempotent close: cancels all queued writes with
    /// [`ProtocolError::ConnectionClosed`] and closes the transport.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("closing channel");
        self.transport.close().await
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("remote", &self.transport.remote_address())
            .field("trusted", &self.is_trusted())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Priority ordering over a device's attached channels: the channel with
/// the highest transport priority is "current".
pub fn select_current<'a>(channels: &'a VecDeque<Arc<Channel>>) -> Option<&'a Arc<Channel>> {
    channels
        .iter()
        .max_by_key(|c| c.capabilities().priority)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use crate::transport::Priority;
    use serde_json::json;

    fn certs() -> (CertificateInfo, CertificateInfo) {
        (
            CertificateInfo::generate("a".repeat(32), 10).unwrap(),
            CertificateInfo::generate("b".repeat(32), 10).unwrap(),
        )
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (cert_a, cert_b) = certs();
        let (ta, tb) = MockTransport::pair(cert_a, cert_b, Priority(0));
        let a = Channel::new(Arc::new(ta), true);
        let b = Channel::new(Arc::new(tb), true);

        a.write_packet(Packet::new("kdeconnect.ping", json!({"message": "hi"})))
            .await
            .unwrap();
        let got = b.read_packet().await.unwrap();
        assert_eq!(got.packet_type, "kdeconnect.ping");
        assert_eq!(got.get_string("message"), Some("hi"));
        assert!(got.id > 0, "writer should stamp id with current time");
    }

    #[tokio::test]
    async fn untrusted_peer_buffer_is_capped_at_initial_size() {
        let (cert_a, cert_b) = certs();
        let (ta, tb) = MockTransport::pair(cert_a, cert_b, Priority(0));
        let a = Channel::new(Arc::new(ta), false);
        let b = Channel::new(Arc::new(tb), false);

        let huge = "x".repeat(INITIAL_BUFFER_SIZE * 2);
        a.write_packet(Packet::new("kdeconnect.ping", json!({"message": huge})))
            .await
            .unwrap();

        let err = b.read_packet().await.unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (cert_a, cert_b) = certs();
        let (ta, _tb) = MockTransport::pair(cert_a, cert_b, Priority(0));
        let a = Channel::new(Arc::new(ta), true);
        a.close().await.unwrap();
        a.close().await.unwrap();
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let (cert_a, cert_b) = certs();
        let (ta, _tb) = MockTransport::pair(cert_a, cert_b, Priority(0));
        let a = Channel::new(Arc::new(ta), true);
        a.close().await.unwrap();
        let err = a
            .write_packet(Packet::new("kdeconnect.ping", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[tokio::test]
    async fn verification_key_agrees_both_directions() {
        let (cert_a, cert_b) = certs();
        let (ta, tb) = MockTransport::pair(cert_a, cert_b, Priority(0));
        let a = Channel::new(Arc::new(ta), true);
        let b = Channel::new(Arc::new(tb), true);
        a.set_pairing_timestamp(42).await;
        b.set_pairing_timestamp(42).await;

        let ka = a.verification_key().await.unwrap();
        let kb = b.verification_key().await.unwrap();
        assert_eq!(ka, kb);
        assert_eq!(ka.len(), 8);
    }
}
