//! Filesystem-backed artifact storage.
//!
//! Worker results live outside the relational store, addressed by the opaque
//! `worker_id`: the final result text at `worker/<id>/result` and sidecar
//! metadata at `worker/<id>/metadata`. Large tool outputs get their own
//! out-of-band blobs so they never consume LLM context.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ArtifactError;
use crate::llm::TokenUsage;

/// Sidecar metadata written next to each worker result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub duration_ms: i64,
    /// Absent when the provider never reported usage; zero is a real value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// Content-addressed store for worker results.
pub struct ArtifactStore {
    base: PathBuf,
}

impl ArtifactStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn worker_dir(&self, worker_id: &str) -> PathBuf {
        // worker_id is opaque but filesystem-hostile characters are rejected
        // rather than escaped; ids are generated internally.
        self.base.join("worker").join(worker_id)
    }

    async fn write(&self, path: &Path, content: &[u8]) -> Result<(), ArtifactError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub async fn put_result(&self, worker_id: &str, content: &str) -> Result<(), ArtifactError> {
        self.write(&self.worker_dir(worker_id).join("result"), content.as_bytes())
            .await
    }

    pub async fn get_result(&self, worker_id: &str) -> Result<String, ArtifactError> {
        let path = self.worker_dir(worker_id).join("result");
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ArtifactError::NotFound(worker_id.to_string()),
                _ => ArtifactError::Io(e),
            })
    }

    pub async fn put_metadata(
        &self,
        worker_id: &str,
        metadata: &WorkerMetadata,
    ) -> Result<(), ArtifactError> {
        let json = serde_json::to_vec_pretty(metadata)
            .map_err(|e| ArtifactError::Serialization(e.to_string()))?;
        self.write(&self.worker_dir(worker_id).join("metadata"), &json)
            .await
    }

    pub async fn get_metadata(&self, worker_id: &str) -> Result<WorkerMetadata, ArtifactError> {
        let path = self.worker_dir(worker_id).join("metadata");
        let data = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ArtifactError::NotFound(worker_id.to_string()),
                _ => ArtifactError::Io(e),
            })?;
        serde_json::from_str(&data).map_err(|e| ArtifactError::Serialization(e.to_string()))
    }

    /// Summary if present, else the full result. The caller truncates.
    pub async fn best_result(&self, worker_id: &str) -> Result<String, ArtifactError> {
        if let Ok(metadata) = self.get_metadata(worker_id).await {
            if let Some(summary) = metadata.summary {
                if !summary.trim().is_empty() {
                    return Ok(summary);
                }
            }
        }
        self.get_result(worker_id).await
    }
}

/// Marker embedded in tool messages pointing at an offloaded output.
pub fn output_marker(artifact_id: &str, bytes: usize) -> String {
    format!("[TOOL_OUTPUT:artifact_id={},bytes={}]", artifact_id, bytes)
}

/// Parse an `artifact_id` out of a marker produced by `output_marker`.
pub fn parse_output_marker(s: &str) -> Option<(String, usize)> {
    let start = s.find("[TOOL_OUTPUT:artifact_id=")?;
    let rest = &s[start + "[TOOL_OUTPUT:artifact_id=".len()..];
    let comma = rest.find(",bytes=")?;
    let artifact_id = &rest[..comma];
    let after = &rest[comma + ",bytes=".len()..];
    let end = after.find(']')?;
    let bytes = after[..end].parse().ok()?;
    Some((artifact_id.to_string(), bytes))
}

/// Out-of-band store for large tool outputs.
pub struct ToolOutputStore {
    base: PathBuf,
}

impl ToolOutputStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn path(&self, artifact_id: &str) -> PathBuf {
        self.base.join("tool_output").join(artifact_id)
    }

    /// Store a blob and return its artifact id.
    pub async fn put(&self, content: &str) -> Result<String, ArtifactError> {
        let artifact_id = Uuid::new_v4().simple().to_string();
        let path = self.path(&artifact_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content.as_bytes()).await?;
        Ok(artifact_id)
    }

    pub async fn get(&self, artifact_id: &str) -> Result<String, ArtifactError> {
        tokio::fs::read_to_string(self.path(artifact_id))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ArtifactError::NotFound(artifact_id.to_string()),
                _ => ArtifactError::Io(e),
            })
    }
}

/// Truncate using a head+tail strategy: the first `head_size` bytes always
/// survive, the remaining budget goes to the tail, and the elided middle is
/// replaced with a byte-count marker.
pub fn truncate_head_tail(content: &str, max_bytes: usize, head_size: usize) -> String {
    let content_bytes = content.as_bytes();
    let total_bytes = content_bytes.len();

    if total_bytes <= max_bytes {
        return content.to_string();
    }

    let marker_estimate = format!("\n[...truncated {} bytes...]\n", 999_999_999usize);
    let marker_bytes = marker_estimate.len();

    let available = max_bytes.saturating_sub(marker_bytes);
    if available < head_size * 2 {
        // Budget too small for head+tail; return a clipped head.
        let head = String::from_utf8_lossy(&content_bytes[..max_bytes.min(total_bytes)]);
        return format!("{}...", head);
    }

    let actual_head = head_size.min(available / 2);
    let tail_size = available - actual_head;

    let head = String::from_utf8_lossy(&content_bytes[..actual_head]);
    let tail = String::from_utf8_lossy(&content_bytes[total_bytes - tail_size..]);
    let truncated = total_bytes - actual_head - tail_size;

    format!("{}\n[...truncated {} bytes...]\n{}", head, truncated, tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_result_roundtrip() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        store.put_result("w-abc", "Disk at 47%").await.unwrap();
        assert_eq!(store.get_result("w-abc").await.unwrap(), "Disk at 47%");

        let missing = store.get_result("w-missing").await;
        assert!(matches!(missing, Err(ArtifactError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_best_result_prefers_summary() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.put_result("w-1", "long raw output").await.unwrap();
        store
            .put_metadata(
                "w-1",
                &WorkerMetadata {
                    summary: Some("short summary".to_string()),
                    duration_ms: 1200,
                    usage: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(store.best_result("w-1").await.unwrap(), "short summary");
    }

    #[tokio::test]
    async fn test_tool_output_roundtrip_and_marker() {
        let dir = tempdir().unwrap();
        let store = ToolOutputStore::new(dir.path());

        let id = store.put("big output").await.unwrap();
        assert_eq!(store.get(&id).await.unwrap(), "big output");

        let marker = output_marker(&id, 10);
        let (parsed_id, bytes) = parse_output_marker(&marker).unwrap();
        assert_eq!(parsed_id, id);
        assert_eq!(bytes, 10);
    }

    #[test]
    fn test_parse_marker_rejects_garbage() {
        assert!(parse_output_marker("no marker here").is_none());
        assert!(parse_output_marker("[TOOL_OUTPUT:artifact_id=x,bytes=notanum]").is_none());
    }

    #[test]
    fn test_truncate_head_tail_small_passthrough() {
        assert_eq!(truncate_head_tail("short", 100, 10), "short");
    }

    #[test]
    fn test_truncate_head_tail_keeps_both_ends() {
        let content = format!("{}{}{}", "H".repeat(2000), "M".repeat(50_000), "T".repeat(2000));
        let out = truncate_head_tail(&content, 4096, 1024);
        assert!(out.len() <= 4200);
        assert!(out.starts_with("H"));
        assert!(out.ends_with("T"));
        assert!(out.contains("truncated"));
    }
}
