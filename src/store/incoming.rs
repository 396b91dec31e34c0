//! Chunk assembly for files arriving from a peer.
//!
//! Each transfer gets its own directory; chunks land at
//! `sequence × chunk_size` byte offsets, so a retransmitted chunk just
//! rewrites the same bytes. Finalize re-reads the file to compute the
//! digest checked against the sender's `Complete`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct IncomingStore {
    root: PathBuf,
}

impl IncomingStore {
    pub fn with_root(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to prepare incoming dir at {}", root.display()))?;
        Ok(Self { root })
    }

    /// Create (or reopen, when resuming) the destination file for a
    /// transfer, pre-sized to its final length.
    pub async fn open(
        &self,
        transfer_id: &Uuid,
        file_name: &str,
        file_size: u64,
    ) -> Result<IncomingFile> {
        let dir = self.root.join(transfer_id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create transfer dir {}", dir.display()))?;

        let path = dir.join(sanitise_file_name(file_name));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open incoming file {}", path.display()))?;
        file.set_len(file_size)
            .await
            .with_context(|| format!("failed to size incoming file {}", path.display()))?;

        Ok(IncomingFile { path, file })
    }
}

/// Keep only the final path component so a hostile peer cannot steer the
/// write outside the transfer directory.
fn sanitise_file_name(file_name: &str) -> String {
    Path::new(file_name)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty() && name != "." && name != "..")
        .unwrap_or_else(|| "incoming.bin".to_string())
}

#[derive(Debug)]
pub struct IncomingFile {
    path: PathBuf,
    file: File,
}

impl IncomingFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one plaintext chunk at its byte offset.
    pub async fn write_chunk(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .with_context(|| format!("failed to seek to {offset} in {}", self.path.display()))?;
        self.file
            .write_all(bytes)
            .await
            .with_context(|| format!("failed to write chunk at {offset}"))?;
        Ok(())
    }

    /// Flush, re-read the whole file and return its SHA-256.
    pub async fn finalize(&mut self) -> Result<[u8; 32]> {
        self.file.flush().await.context("failed to flush incoming file")?;
        self.file
            .sync_all()
            .await
            .context("failed to sync incoming file")?;

        let contents = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("failed to read back {}", self.path.display()))?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&Sha256::digest(&contents));
        Ok(digest)
    }
}
