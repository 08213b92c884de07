//! File-backed quarantine store.
//!
//! One JSON document per message id. Every write goes to a uniquely named
//! temporary file that is fsynced and then atomically renamed over the
//! record, so a crash never leaves a half-written record behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{
    QuarantineError, QuarantineQuery, QuarantineRecord, QuarantineResult, QuarantineSink,
    QuarantineStats, Resolution,
};
use crate::messaging::MessageId;

const RECORD_EXTENSION: &str = "json";
const TEMP_PREFIX: &str = ".tmp-";

#[derive(Debug)]
pub struct FileQuarantineStore {
    directory: PathBuf,
    /// Serializes read-merge-write cycles within this process
    write_lock: Mutex<()>,
}

impl FileQuarantineStore {
    /// Open (creating if needed) a store rooted at `directory`
    pub async fn open(directory: impl Into<PathBuf>) -> QuarantineResult<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)
            .await
            .map_err(|e| QuarantineError::io(directory.display().to_string(), e))?;
        Ok(Self {
            directory,
            write_lock: Mutex::new(()),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// File name for a message id; unsafe bytes are percent-encoded
    fn file_name(message_id: &MessageId) -> String {
        let mut name = String::with_capacity(message_id.as_str().len() + 5);
        for byte in message_id.as_str().bytes() {
            match byte {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => name.push(byte as char),
                _ => name.push_str(&format!("%{byte:02X}")),
            }
        }
        name.push('.');
        name.push_str(RECORD_EXTENSION);
        name
    }

    fn record_path(&self, message_id: &MessageId) -> PathBuf {
        self.directory.join(Self::file_name(message_id))
    }

    async fn read_path(path: &Path) -> QuarantineResult<Option<QuarantineRecord>> {
        match fs::read(path).await {
            Ok(bytes) => {
                let record = serde_json::from_slice(&bytes).map_err(|e| {
                    QuarantineError::Serialization(format!("{}: {e}", path.display()))
                })?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(QuarantineError::io(path.display().to_string(), e)),
        }
    }

    async fn write_atomic(&self, record: &QuarantineRecord) -> QuarantineResult<()> {
        let path = self.record_path(&record.message_id);
        let temp_path = self.directory.join(format!(
            "{TEMP_PREFIX}{}-{}",
            Uuid::new_v4().simple(),
            Self::file_name(&record.message_id)
        ));
        let bytes = serde_json::to_vec_pretty(record)?;
        let io_err = |p: &Path, e: std::io::Error| QuarantineError::io(p.display().to_string(), e);

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| io_err(&temp_path, e))?;
        file.write_all(&bytes).await.map_err(|e| io_err(&temp_path, e))?;
        file.sync_all().await.map_err(|e| io_err(&temp_path, e))?;
        drop(file);

        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| io_err(&path, e))?;

        #[cfg(unix)]
        {
            let dir = fs::File::open(&self.directory)
                .await
                .map_err(|e| io_err(&self.directory, e))?;
            dir.sync_all().await.map_err(|e| io_err(&self.directory, e))?;
        }

        Ok(())
    }

    async fn read_all(&self) -> QuarantineResult<Vec<QuarantineRecord>> {
        let dir_err = |e: std::io::Error| QuarantineError::io(self.directory.display().to_string(), e);
        let mut entries = fs::read_dir(&self.directory).await.map_err(dir_err)?;
        let mut records = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(dir_err)? {
            let path = entry.path();
            let is_record = path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION)
                && !entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX);
            if !is_record {
                continue;
            }
            if let Some(record) = Self::read_path(&path).await? {
                records.push(record);
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl QuarantineSink for FileQuarantineStore {
    #[instrument(skip(self, record), fields(message_id = %record.message_id))]
    async fn persist(&self, record: QuarantineRecord) -> QuarantineResult<()> {
        let _guard = self.write_lock.lock().await;
        let merged = match Self::read_path(&self.record_path(&record.message_id)).await? {
            Some(existing) => QuarantineRecord::merge(existing, record),
            None => record,
        };
        self.write_atomic(&merged).await?;
        debug!(
            history_len = merged.attempt_history.len(),
            "Quarantine record written"
        );
        Ok(())
    }

    async fn get(&self, message_id: &MessageId) -> QuarantineResult<Option<QuarantineRecord>> {
        Self::read_path(&self.record_path(message_id)).await
    }

    async fn list(&self, query: &QuarantineQuery) -> QuarantineResult<Vec<QuarantineRecord>> {
        Ok(query.apply(self.read_all().await?))
    }

    async fn mark_resolved(
        &self,
        message_id: &MessageId,
        resolution: Resolution,
    ) -> QuarantineResult<QuarantineRecord> {
        let _guard = self.write_lock.lock().await;
        let mut record = Self::read_path(&self.record_path(message_id))
            .await?
            .ok_or_else(|| QuarantineError::not_found(message_id))?;
        if record.resolution.is_none() {
            record.resolution = Some(resolution);
            self.write_atomic(&record).await?;
        }
        Ok(record)
    }

    async fn stats(&self) -> QuarantineResult<QuarantineStats> {
        let records = self.read_all().await?;
        Ok(QuarantineStats::from_records(records.iter()))
    }

    async fn purge_resolved_before(&self, cutoff: DateTime<Utc>) -> QuarantineResult<u64> {
        let _guard = self.write_lock.lock().await;
        let mut purged = 0;
        for record in self.read_all().await? {
            let expired = record
                .resolution
                .as_ref()
                .map(|r| r.resolved_at < cutoff)
                .unwrap_or(false);
            if expired {
                let path = self.record_path(&record.message_id);
                fs::remove_file(&path)
                    .await
                    .map_err(|e| QuarantineError::io(path.display().to_string(), e))?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }
}
