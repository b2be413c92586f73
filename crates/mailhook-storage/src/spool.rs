//! Temp store for raw message bytes

use mailhook_common::{Error, Result};
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

/// Spool directory holding one file per in-flight message
pub struct TempStore {
    base_path: PathBuf,
}

impl TempStore {
    /// Create a new temp store, creating the base directory if needed
    pub fn new(path: &std::path::Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .map_err(|e| Error::Storage(format!("Failed to create spool directory: {}", e)))?;

        info!(path = %path.display(), "Initialized message spool");

        Ok(Self {
            base_path: path.to_path_buf(),
        })
    }

    /// Generate a collision-resistant message id
    pub fn make_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Resolve an id to its spool path
    ///
    /// Ids are generated by [`TempStore::make_id`]; anything else that could
    /// escape the spool directory is rejected.
    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::Storage(format!("Invalid message id: {:?}", id)));
        }
        Ok(self.base_path.join(id))
    }

    /// Open a fresh write target for a message
    pub async fn create(&self, id: &str) -> Result<SpoolWriter> {
        let path = self.path_for(id)?;

        let file = fs::File::create(&path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to create spool file: {}", e)))?;

        debug!(id = %id, "Opened spool file");

        Ok(SpoolWriter { file, id: id.to_string() })
    }

    /// Read a spooled message back
    pub async fn read(&self, id: &str) -> Result<Vec<u8>> {
        let path = self.path_for(id)?;

        let data = fs::read(&path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to read spool file {}: {}", id, e)))?;

        debug!(id = %id, size = data.len(), "Read spool file");

        Ok(data)
    }

    /// Delete a spooled message
    ///
    /// Idempotent: deleting an already-absent file succeeds.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;

        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(id = %id, "Deleted spool file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!(
                "Failed to delete spool file {}: {}",
                id, e
            ))),
        }
    }
}

/// Open write target for one message's raw bytes
pub struct SpoolWriter {
    file: fs::File,
    id: String,
}

impl SpoolWriter {
    /// Append a chunk verbatim
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write spool file {}: {}", self.id, e)))
    }

    /// Flush and close the write target
    pub async fn finish(mut self) -> Result<()> {
        self.file
            .flush()
            .await
            .map_err(|e| Error::Storage(format!("Failed to flush spool file {}: {}", self.id, e)))
    }
}
