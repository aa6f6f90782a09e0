//! Concatenation reference numbers for outgoing multi-part messages.
//!
//! References cycle through 0..=255. With a backing file the counter
//! survives restarts; the file holds `{"msgref": n}` where `n` is the next
//! reference to hand out.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use atgsm_core::error::{Error, Result};

/// Process-wide counter used when no file is configured.
static NEXT_REFERENCE: AtomicU8 = AtomicU8::new(0);

#[derive(Debug, Default, Serialize, Deserialize)]
struct RefFile {
    msgref: u8,
}

/// Source of concatenation references.
#[derive(Debug)]
pub struct MessageReferences {
    file: Option<PathBuf>,
    lock: Mutex<()>,
}

impl MessageReferences {
    /// References from the process-wide counter.
    pub fn in_memory() -> Self {
        MessageReferences {
            file: None,
            lock: Mutex::new(()),
        }
    }

    /// References persisted in `path`. A missing file starts at 0.
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        MessageReferences {
            file: Some(path.into()),
            lock: Mutex::new(()),
        }
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Hand out the next reference.
    pub async fn next(&self) -> Result<u8> {
        let Some(path) = &self.file else {
            return Ok(NEXT_REFERENCE.fetch_add(1, Ordering::Relaxed));
        };

        let _guard = self.lock.lock().await;
        let current = match tokio::fs::read(path).await {
            Ok(data) => serde_json::from_slice::<RefFile>(&data)
                .map_err(|e| {
                    Error::InvalidParameter(format!(
                        "invalid message reference file {}: {e}",
                        path.display()
                    ))
                })?
                .msgref,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let next = RefFile {
            msgref: current.wrapping_add(1),
        };
        let data = serde_json::to_vec(&next)
            .map_err(|e| Error::InvalidParameter(format!("message reference: {e}")))?;

        // Write beside the target and rename so a crash never leaves a
        // truncated file.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;

        debug!(reference = current, file = %path.display(), "message reference allocated");
        Ok(current)
    }
}

impl Default for MessageReferences {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_counter_starts_at_zero_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msgref.json");

        let refs = MessageReferences::with_file(&path);
        assert_eq!(refs.next().await.unwrap(), 0);
        assert_eq!(refs.next().await.unwrap(), 1);

        let reopened = MessageReferences::with_file(&path);
        assert_eq!(reopened.next().await.unwrap(), 2);

        let stored = std::fs::read_to_string(&path).unwrap();
        assert_eq!(stored, r#"{"msgref":3}"#);
    }

    #[tokio::test]
    async fn file_counter_wraps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msgref.json");
        std::fs::write(&path, r#"{"msgref":255}"#).unwrap();

        let refs = MessageReferences::with_file(&path);
        assert_eq!(refs.next().await.unwrap(), 255);
        assert_eq!(refs.next().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msgref.json");
        std::fs::write(&path, "not json").unwrap();

        let err = MessageReferences::with_file(&path).next().await.unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn in_memory_counter_advances() {
        let refs = MessageReferences::in_memory();
        let a = refs.next().await.unwrap();
        let b = refs.next().await.unwrap();
        assert_ne!(a, b);
    }
}
