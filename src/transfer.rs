//! Splice a local file through a [`Channel`]'s auxiliary payload
//! connection, in either direction.
//!
//! Metadata extraction uses `std::fs::metadata` and ms-since-epoch
//! timestamps. This module drives the splice over [`Channel::upload`]/
//! [`Channel::download`] rather than owning its own TCP listener, since
//! that belongs to the `Transport` implementation.

use crate::channel::Channel;
use crate::error::{ProtocolError, Result};
use crate::packet::Packet;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Filesystem metadata needed to populate or apply a transfer packet's
/// `creationTime`/`lastModified`/`payloadSize` fields.
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub size: u64,
    pub creation_time: Option<i64>,
    pub last_modified: Option<i64>,
}

impl FileMetadata {
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        let size = metadata.len();
        let creation_time = metadata
            .created()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64);
        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64);
        Ok(Self {
            size,
            creation_time,
            last_modified,
        })
    }
}

/// Send `local_path`'s contents as the payload for `packet`. Stamps
/// `creationTime`, `lastModified`, and `payloadSize` on the packet before
/// handing it to [`Channel::upload`].
pub async fn upload_file(channel: &Channel, packet: Packet, local_path: impl AsRef<Path>) -> Result<()> {
    let local_path = local_path.as_ref();
    let metadata = FileMetadata::from_path(local_path).await?;

    let mut packet = packet.with_payload_size(metadata.size as i64);
    if let Some(ct) = metadata.creation_time {
        packet = packet.with_body_field("creationTime", ct);
    }
    if let Some(lm) = metadata.last_modified {
        packet = packet.with_body_field("lastModified", lm);
    }

    let (_announced, mut sink) = channel.upload(packet).await?;
    let mut file = tokio::fs::File::open(local_path).await?;

    let transferred = tokio::io::copy(&mut file, &mut sink).await?;
    sink.shutdown().await?;

    if transferred != metadata.size {
        return Err(ProtocolError::PartialInput {
            expected: metadata.size as i64,
            actual: transferred as i64,
        });
    }
    debug!(bytes = transferred, path = %local_path.display(), "upload complete");
    Ok(())
}

/// Receive `packet`'s payload into `local_path`.
/// Replaces the destination atomically (write to a sibling temp file, then
/// rename) and, on success, best-effort applies `creationTime`/
/// `lastModified` from the packet — failures there are logged, not
/// propagated, since some filesystems reject creation-time sets.
pub async fn download_file(channel: &Channel, packet: &Packet, local_path: impl AsRef<Path>) -> Result<()> {
    let local_path = local_path.as_ref();
    let expected = packet
        .payload_size
        .ok_or_else(|| ProtocolError::MissingField("payloadSize".to_string()))?;

    if let Some(parent) = local_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = sibling_temp_path(local_path);

    let mut source = channel.download(packet).await?;
    let mut file = tokio::fs::File::create(&tmp_path).await?;
    let transferred = tokio::io::copy(&mut source, &mut file).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if expected >= 0 && transferred != expected as u64 {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(ProtocolError::PartialInput {
            expected,
            actual: transferred as i64,
        });
    }

    tokio::fs::rename(&tmp_path, local_path).await?;
    apply_timestamps(local_path, packet).await;

    debug!(bytes = transferred, path = %local_path.display(), "download complete");
    Ok(())
}

fn sibling_temp_path(dest: &Path) -> std::path::PathBuf {
    let mut tmp = dest.as_os_str().to_owned();
    tmp.push(".part");
    tmp.into()
}

/// Best-effort application of `creationTime`/`lastModified`; any failure is
/// demoted to a debug line.
async fn apply_timestamps(path: &Path, packet: &Packet) {
    let Some(last_modified_ms) = packet.get_i64("lastModified") else {
        return;
    };
    let mtime = UNIX_EPOCH + std::time::Duration::from_millis(last_modified_ms.max(0) as u64);
    let path = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path)?;
        file.set_modified(mtime)
    })
    .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "failed to apply lastModified to downloaded file"),
        Err(e) => debug!(error = %e, "timestamp-apply task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CertificateInfo;
    use crate::transport::mock::MockTransport;
    use crate::transport::Priority;
    use serde_json::json;
    use tempfile::TempDir;

    fn certs() -> (CertificateInfo, CertificateInfo) {
        (
            CertificateInfo::generate("a".repeat(32), 10).unwrap(),
            CertificateInfo::generate("b".repeat(32), 10).unwrap(),
        )
    }

    #[tokio::test]
    async fn upload_fails_cleanly_when_transport_lacks_payload_support() {
        let (cert_a, cert_b) = certs();
        let (ta, _tb) = MockTransport::pair(cert_a, cert_b, Priority(0));
        let channel = Channel::new(std::sync::Arc::new(ta), true);

        let dir = TempDir::new().unwrap();
        let file_path = dir.path().join("payload.bin");
        tokio::fs::write(&file_path, b"hello world").await.unwrap();

        let packet = Packet::new("kdeconnect.share.request", json!({}));
        let err = upload_file(&channel, packet, &file_path).await.unwrap_err();
        assert!(matches!(err, ProtocolError::NotSupported(_)));
    }

    #[tokio::test]
    async fn download_requires_payload_size() {
        let (cert_a, cert_b) = certs();
        let (ta, _tb) = MockTransport::pair(cert_a, cert_b, Priority(0));
        let channel = Channel::new(std::sync::Arc::new(ta), true);

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.bin");
        let packet = Packet::new("kdeconnect.share.request", json!({}))
            .with_payload_transfer_info(serde_json::Map::new());
        let err = download_file(&channel, &packet, &dest).await.unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField(_)));
    }

    #[tokio::test]
    async fn metadata_reads_size() {
        let dir = TempDir::new().unwrap();
        let file_path = dir.path().join("sized.bin");
        tokio::fs::write(&file_path, vec![0u8; 1234]).await.unwrap();
        let meta = FileMetadata::from_path(&file_path).await.unwrap();
        assert_eq!(meta.size, 1234);
    }
}
