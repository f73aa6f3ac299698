//! Zstd-compressed, durably written checkpoint files (spec §4.2, §4.7).
//!
//! The `CheckpointWriter` trait and its tmp-file/fsync/rename/fsync-dir
//! sequence are grounded directly in the `oddjobs` example's
//! `crates/storage/src/checkpoint.rs`: write to `{path}.tmp`, fsync the
//! tmp file, rename onto the final path, fsync the containing directory.
//! The payload itself is this crate's concern, not that example's —
//! header + memlayout + all per-hart register buffers + the guest RAM
//! image, concatenated and compressed as one Zstd frame.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use prost::Message;

use super::error::{EngineError, Result};
use super::layout::{CheckpointHeader, MemLayout};

/// Compression level used for checkpoint frames: spec §9 picks a low level
/// (favoring write latency over ratio) since checkpoints are taken on the
/// hot path between translation blocks.
const ZSTD_LEVEL: i32 = 1;

pub trait CheckpointWriter: Send + Sync {
    fn write_tmp(&self, path: &Path, data: &[u8]) -> Result<()>;
    fn fsync_file(&self, path: &Path) -> Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    fn fsync_dir(&self, path: &Path) -> Result<()>;
}

#[derive(Clone, Default)]
pub struct FsCheckpointWriter;

fn io_err(path: &Path, source: std::io::Error) -> EngineError {
    EngineError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl CheckpointWriter for FsCheckpointWriter {
    fn write_tmp(&self, path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let mut file = File::create(path).map_err(|e| io_err(path, e))?;
        file.write_all(data).map_err(|e| io_err(path, e))?;
        Ok(())
    }

    fn fsync_file(&self, path: &Path) -> Result<()> {
        File::open(path).and_then(|f| f.sync_all()).map_err(|e| io_err(path, e))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        std::fs::rename(from, to).map_err(|e| io_err(to, e))
    }

    fn fsync_dir(&self, path: &Path) -> Result<()> {
        File::open(path).and_then(|f| f.sync_all()).map_err(|e| io_err(path, e))
    }
}

/// Build the uncompressed payload: length-delimited header, length-delimited
/// memlayout, then each hart's fixed-size register buffer in hart-index
/// order, then the raw guest RAM image.
pub fn build_payload(header: &CheckpointHeader, layout: &MemLayout, per_hart_regs: &[Vec<u8>], ram: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(
        header.encoded_len() + layout.encoded_len() + per_hart_regs.iter().map(Vec::len).sum::<usize>() + ram.len() + 16,
    );
    header.encode_length_delimited(&mut payload).expect("encoding into a Vec never fails");
    layout.encode_length_delimited(&mut payload).expect("encoding into a Vec never fails");
    for regs in per_hart_regs {
        payload.extend_from_slice(regs);
    }
    payload.extend_from_slice(ram);
    payload
}

/// Compress `payload` and write it durably to `path`, via a `{path}.tmp`
/// staging file in the same directory so the rename is atomic.
pub fn commit(writer: &dyn CheckpointWriter, path: &Path, payload: &[u8]) -> Result<u64> {
    let compressed = zstd::stream::encode_all(payload, ZSTD_LEVEL).map_err(|e| EngineError::Compress(e.to_string()))?;

    let tmp_path = path.with_extension("tmp");
    writer.write_tmp(&tmp_path, &compressed)?;
    writer.fsync_file(&tmp_path)?;
    writer.rename(&tmp_path, path)?;
    if let Some(dir) = path.parent() {
        writer.fsync_dir(dir)?;
    }
    Ok(compressed.len() as u64)
}

/// Decompress a checkpoint file previously written by [`commit`], for tests
/// and for any future restore tooling.
pub fn decode(compressed: &[u8]) -> std::io::Result<Vec<u8>> {
    zstd::stream::decode_all(compressed)
}

pub fn checkpoint_file_path(dir: &Path) -> PathBuf {
    dir.join("checkpoint.zst")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::layout::{CheckpointHeader, DEFAULT_MEMLAYOUT};

    #[test]
    fn commit_round_trips_through_zstd_and_atomic_rename() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = FsCheckpointWriter;
        let header = CheckpointHeader::new(1);
        let payload = build_payload(&header, &DEFAULT_MEMLAYOUT, &[vec![7u8; 64]], &[1, 2, 3, 4]);

        let path = checkpoint_file_path(tmp.path());
        let size = commit(&writer, &path, &payload).unwrap();
        assert!(size > 0);
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let compressed = std::fs::read(&path).unwrap();
        let decoded = decode(&compressed).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn payload_contains_header_then_layout_then_regs_then_ram() {
        let header = CheckpointHeader::new(2);
        let per_hart = vec![vec![1u8; 10], vec![2u8; 10]];
        let ram = vec![9u8; 20];
        let payload = build_payload(&header, &DEFAULT_MEMLAYOUT, &per_hart, &ram);
        assert!(payload.len() > 40);
        assert_eq!(&payload[payload.len() - 20..], &ram[..]);
    }
}
