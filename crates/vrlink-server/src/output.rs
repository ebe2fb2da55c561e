//! Bitstream output task.
//!
//! Collects fragments from every encoder sink and writes one elementary
//! stream per region. Stands in for the network packetizer.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use vrlink_config::VideoCodec;

/// One fragment tagged with the region it belongs to.
#[derive(Debug)]
pub struct Packet {
    pub stream: usize,
    pub data: Bytes,
    pub is_last: bool,
}

/// Per-region totals reported when the output closes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub bytes: u64,
    pub fragments: u64,
    pub frames: u64,
}

/// Output file of stream `index`.
#[must_use]
pub fn stream_path(dir: &Path, index: usize, codec: VideoCodec) -> PathBuf {
    dir.join(format!("stream{index}.{}", codec.extension()))
}

/// Drain `rx` until every sender is gone.
///
/// `codecs[i]` is the codec of stream `i`. With `dir` unset, packets are
/// only counted.
///
/// # Errors
///
/// Returns an error if an output file cannot be created or written.
pub async fn write_streams(
    dir: Option<PathBuf>,
    codecs: Vec<VideoCodec>,
    mut rx: mpsc::UnboundedReceiver<Packet>,
) -> Result<Vec<StreamStats>> {
    let mut files: Vec<Option<File>> = Vec::with_capacity(codecs.len());
    for (index, codec) in codecs.iter().enumerate() {
        let file = match &dir {
            Some(dir) => {
                let path = stream_path(dir, index, *codec);
                let file = File::create(&path)
                    .await
                    .with_context(|| format!("failed to create {}", path.display()))?;
                tracing::info!(stream = index, path = %path.display(), "Writing stream");
                Some(file)
            }
            None => None,
        };
        files.push(file);
    }

    let mut stats = vec![StreamStats::default(); codecs.len()];
    while let Some(packet) = rx.recv().await {
        let Some(entry) = stats.get_mut(packet.stream) else {
            tracing::warn!(stream = packet.stream, "Packet for unknown stream dropped");
            continue;
        };
        entry.bytes += packet.data.len() as u64;
        entry.fragments += 1;
        if packet.is_last {
            entry.frames += 1;
        }
        if let Some(file) = &mut files[packet.stream] {
            file.write_all(&packet.data)
                .await
                .with_context(|| format!("failed to write stream {}", packet.stream))?;
        }
    }

    for file in files.iter_mut().flatten() {
        file.flush().await.context("failed to flush stream")?;
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(stream: usize, data: &'static [u8], is_last: bool) -> Packet {
        Packet {
            stream,
            data: Bytes::from_static(data),
            is_last,
        }
    }

    #[tokio::test]
    async fn writes_one_file_per_stream() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(packet(0, b"\0\0\x01ab", false)).expect("send");
        tx.send(packet(1, b"\0\0\x01cd", true)).expect("send");
        tx.send(packet(0, b"\0\0\x01ef", true)).expect("send");
        drop(tx);

        let stats = write_streams(
            Some(dir.path().to_path_buf()),
            vec![VideoCodec::H265, VideoCodec::H264],
            rx,
        )
        .await
        .expect("write");

        assert_eq!(
            stats[0],
            StreamStats {
                bytes: 10,
                fragments: 2,
                frames: 1
            }
        );
        assert_eq!(stats[1].frames, 1);

        let first = std::fs::read(dir.path().join("stream0.h265")).expect("read");
        assert_eq!(first, b"\0\0\x01ab\0\0\x01ef");
        let second = std::fs::read(dir.path().join("stream1.h264")).expect("read");
        assert_eq!(second, b"\0\0\x01cd");
    }

    #[tokio::test]
    async fn counts_without_output_dir() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(packet(0, b"abc", true)).expect("send");
        tx.send(packet(3, b"zzz", true)).expect("send");
        drop(tx);

        let stats = write_streams(None, vec![VideoCodec::H265], rx).await.expect("count");
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].bytes, 3);
    }
}
