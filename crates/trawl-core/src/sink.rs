use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::ScrapedItem;
use crate::traits::ItemSink;

/// Writes each job's items to `{dir}/{job_id}.jsonl`, one JSON object per line.
///
/// A rerun of the same job replaces the previous file.
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    dir: PathBuf,
}

impl JsonLinesSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, job_id: Uuid) -> PathBuf {
        self.dir.join(format!("{job_id}.jsonl"))
    }
}

impl ItemSink for JsonLinesSink {
    async fn write(&self, job_id: Uuid, items: &[ScrapedItem]) -> Result<Option<String>, AppError> {
        let mut buf = Vec::new();
        for item in items {
            serde_json::to_writer(&mut buf, item)?;
            buf.push(b'\n');
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(job_id);
        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(&buf).await?;
        file.flush().await?;

        tracing::debug!(%job_id, path = %path.display(), items = items.len(), "Wrote items");
        Ok(Some(path.display().to_string()))
    }
}
