use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use tokio::{fs::OpenOptions, io::AsyncWriteExt};

use crate::{Event, EventHandler, EventPublisher};

/// Durable event log appending one JSON line per event.
///
/// Subscribe it to any event type to keep an audit trail of what the bus delivered.
#[derive(Debug, Clone)]
pub struct EventJournal {
    path: PathBuf,
}

impl EventJournal {
    /// Creates a journal writing to `path`, creating parent directories.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path })
    }

    /// File the journal appends to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, event: &Event) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for EventJournal {
    async fn handle(&self, event: &Event) -> Result<()> {
        self.append(event).await
    }
}

#[async_trait]
impl EventPublisher for EventJournal {
    async fn publish(&self, event: Event) -> Result<()> {
        self.append(&event).await
    }
}
