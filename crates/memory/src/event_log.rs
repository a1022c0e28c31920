use std::io::{BufRead, BufReader, Write as _};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;

use crate::error::MemoryResult;

/// Append-only JSON-lines file shared by the memory store and the insight
/// store.
#[derive(Debug, Clone)]
pub struct JsonlLog {
    path: PathBuf,
}

impl JsonlLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event and fsync before returning.
    pub async fn append<T: Serialize>(&self, event: &T) -> MemoryResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let line = serde_json::to_string(event)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Read every event in file order.
    ///
    /// Lines that fail to parse are skipped with a warning and copied to a
    /// `.corrupt` sidecar; a missing file is an empty log.
    pub fn load<T: DeserializeOwned>(&self) -> MemoryResult<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = std::fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut corrupt = Vec::new();

        for (line_idx, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(&line) {
                Ok(event) => events.push(event),
                Err(err) => {
                    tracing::warn!(
                        line = line_idx + 1,
                        error = %err,
                        path = %self.path.display(),
                        "corrupt JSONL line skipped"
                    );
                    corrupt.push(line);
                }
            }
        }

        if !corrupt.is_empty() {
            let sidecar = self.corrupt_path();
            let written = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&sidecar)
                .and_then(|mut f| corrupt.iter().try_for_each(|line| writeln!(f, "{line}")));
            if let Err(err) = written {
                tracing::warn!(error = %err, path = %sidecar.display(), "could not write corrupt sidecar");
            }
            tracing::warn!(
                corrupt_lines = corrupt.len(),
                path = %self.path.display(),
                "log loaded with skipped lines; inspect the .corrupt sidecar"
            );
        }

        Ok(events)
    }

    pub fn corrupt_path(&self) -> PathBuf {
        sibling(&self.path, "corrupt")
    }
}

/// Replace `path` with `bytes` atomically: write a `.tmp` sibling, fsync,
/// rename.  A crash before the rename leaves the old file untouched.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> MemoryResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = sibling(path, "tmp");

    let write_result: MemoryResult<()> = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;

    if let Err(err) = write_result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err);
    }
    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err.into());
    }
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let filename = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "log".to_string());
    path.with_file_name(format!("{filename}.{suffix}"))
}
