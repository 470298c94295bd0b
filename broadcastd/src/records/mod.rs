//! Structured audience records produced while a broadcast is live.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::client::{BroadcastId, Comment, FinalAudience};
use crate::error::Result;

/// One heartbeat observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerSample {
    pub timestamp: DateTime<Utc>,
    pub broadcast_id: BroadcastId,
    pub account: String,
    pub viewer_count: u64,
    pub total_unique_viewers: u64,
}

/// One line of the comment transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub created_at: i64,
    pub broadcast_id: BroadcastId,
    pub account: String,
    pub author: String,
    pub text: String,
}

impl TranscriptEntry {
    pub fn new(account: &str, comment: &Comment) -> Self {
        Self {
            created_at: comment.created_at,
            broadcast_id: comment.broadcast_id,
            account: account.to_string(),
            author: comment.author.clone(),
            text: comment.text.clone(),
        }
    }
}

/// Audience of an ended broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalAudienceRecord {
    pub recorded_at: DateTime<Utc>,
    pub broadcast_id: BroadcastId,
    pub account: String,
    #[serde(flatten)]
    pub audience: FinalAudience,
}

/// Destination of audience records. Failures are reported to the caller,
/// which logs them and carries on.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn viewer_sample(&self, sample: &ViewerSample) -> Result<()>;

    async fn comment(&self, entry: &TranscriptEntry) -> Result<()>;

    async fn final_audience(&self, record: &FinalAudienceRecord) -> Result<()>;
}

/// Writes JSON lines files under one directory.
#[derive(Debug, Clone)]
pub struct JsonlRecordSink {
    directory: PathBuf,
}

impl JsonlRecordSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file(&self, kind: &str, account: &str, id: BroadcastId, ext: &str) -> PathBuf {
        self.directory.join(format!("{kind}_{account}_{id}.{ext}"))
    }

    async fn append_line<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');

        tokio::fs::create_dir_all(&self.directory).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl RecordSink for JsonlRecordSink {
    async fn viewer_sample(&self, sample: &ViewerSample) -> Result<()> {
        let path = self.file("viewers", &sample.account, sample.broadcast_id, "jsonl");
        self.append_line(&path, sample).await
    }

    async fn comment(&self, entry: &TranscriptEntry) -> Result<()> {
        let path = self.file("comments", &entry.account, entry.broadcast_id, "jsonl");
        self.append_line(&path, entry).await
    }

    async fn final_audience(&self, record: &FinalAudienceRecord) -> Result<()> {
        let path = self.file("final_viewers", &record.account, record.broadcast_id, "json");
        tokio::fs::create_dir_all(&self.directory).await?;
        tokio::fs::write(&path, serde_json::to_vec_pretty(record)?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Viewer;

    fn sample(count: u64) -> ViewerSample {
        ViewerSample {
            timestamp: Utc::now(),
            broadcast_id: 42,
            account: "alice".to_string(),
            viewer_count: count,
            total_unique_viewers: count * 2,
        }
    }

    #[tokio::test]
    async fn test_viewer_samples_append() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlRecordSink::new(dir.path().join("audience"));

        sink.viewer_sample(&sample(1)).await.unwrap();
        sink.viewer_sample(&sample(5)).await.unwrap();

        let content = tokio::fs::read_to_string(dir.path().join("audience/viewers_alice_42.jsonl"))
            .await
            .unwrap();
        let lines: Vec<ViewerSample> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].viewer_count, 5);
    }

    #[tokio::test]
    async fn test_transcript_and_final_audience() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlRecordSink::new(dir.path());

        let comment = Comment {
            id: "c1".to_string(),
            broadcast_id: 7,
            author: "bob".to_string(),
            text: "hi".to_string(),
            created_at: 100,
        };
        sink.comment(&TranscriptEntry::new("alice", &comment))
            .await
            .unwrap();

        let record = FinalAudienceRecord {
            recorded_at: Utc::now(),
            broadcast_id: 7,
            account: "alice".to_string(),
            audience: FinalAudience {
                viewers: vec![Viewer {
                    id: "1".to_string(),
                    username: "bob".to_string(),
                    full_name: String::new(),
                }],
                total_unique_viewers: 1,
            },
        };
        sink.final_audience(&record).await.unwrap();

        let transcript = std::fs::read_to_string(dir.path().join("comments_alice_7.jsonl")).unwrap();
        assert!(transcript.contains("\"author\":\"bob\""));

        let snapshot: FinalAudienceRecord = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("final_viewers_alice_7.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(snapshot, record);
    }
}
