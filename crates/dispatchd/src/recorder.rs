//! Execution log recorder.
//!
//! Creates a `running` entry when a logged invocation starts and finalizes it
//! with status, end time, and (bounded) output when it terminates.

use chrono::Utc;
use dispatch_core::config::{DEFAULT_LOG_OUTPUT_MAX_BYTES, DEFAULT_LOG_RETENTION};
use dispatch_core::{Config, ExecutionLogEntry, Id, LogStatus, NewExecutionLog};
use std::sync::Arc;
use tracing::{debug, info};

use crate::storage::{Result, Storage};

/// Prefix marking output that was cut down to its tail.
pub const TRUNCATION_MARKER: &str = "...(output truncated)...\n";

/// Keep the last `max_bytes` of `output`, prefixed with [`TRUNCATION_MARKER`].
///
/// The cut point moves forward to the next char boundary, so the kept tail
/// can be slightly shorter than `max_bytes`.
pub fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let mut start = output.len() - max_bytes;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    format!("{TRUNCATION_MARKER}{}", &output[start..])
}

/// Bounded, newest-first execution log.
#[derive(Debug, Clone)]
pub struct Recorder {
    storage: Arc<Storage>,
    retention: usize,
    max_output_bytes: usize,
}

impl Recorder {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            retention: DEFAULT_LOG_RETENTION,
            max_output_bytes: DEFAULT_LOG_OUTPUT_MAX_BYTES,
        }
    }

    pub fn from_config(storage: Arc<Storage>, config: &Config) -> Self {
        Self {
            storage,
            retention: config.log_retention,
            max_output_bytes: config.log_output_max_bytes,
        }
    }

    /// Record a new `running` entry and return its id.
    pub async fn create(&self, meta: NewExecutionLog) -> Result<Id> {
        let entry = ExecutionLogEntry {
            id: Id::new(),
            project_id: meta.project_id,
            project_name: meta.project_name,
            script_name: meta.script_name,
            script_path: meta.script_path,
            script_content: meta.script_content,
            command: meta.command,
            variables: meta.variables,
            start_time: Utc::now().timestamp(),
            end_time: 0,
            status: LogStatus::Running,
            output: String::new(),
        };

        let evicted = self.storage.insert_log(&entry, self.retention).await?;
        if evicted > 0 {
            debug!(evicted, retention = self.retention, "evicted old execution logs");
        }
        info!(
            log_id = %entry.id,
            project_id = %entry.project_id,
            script = %entry.script_name,
            command = %entry.command,
            "execution log created"
        );
        Ok(entry.id)
    }

    /// Finalize an entry. Output beyond the byte cap keeps only its tail.
    pub async fn update(&self, id: &Id, status: LogStatus, output: &str) -> Result<()> {
        let output = truncate_output(output, self.max_output_bytes);
        self.storage
            .finish_log(id, status, &output, Utc::now().timestamp())
            .await?;
        info!(log_id = %id, status = status.as_str(), output_bytes = output.len(), "execution log updated");
        Ok(())
    }

    pub async fn list(
        &self,
        project_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<ExecutionLogEntry>> {
        let project_id = project_id.filter(|p| !p.is_empty());
        let limit = limit.filter(|l| *l > 0);
        self.storage.list_logs(project_id, limit).await
    }

    pub async fn get(&self, id: &Id) -> Result<ExecutionLogEntry> {
        self.storage.get_log(id).await
    }

    /// Delete one entry; deleting an unknown id is not an error.
    pub async fn delete(&self, id: &Id) -> Result<bool> {
        self.storage.delete_log(id).await
    }

    /// Clear every entry, or only one project's entries.
    pub async fn clear(&self, project_id: Option<&str>) -> Result<u64> {
        let removed = self
            .storage
            .clear_logs(project_id.filter(|p| !p.is_empty()))
            .await?;
        info!(removed, project_id = project_id.unwrap_or("*"), "execution logs cleared");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;
    use tempfile::TempDir;

    async fn create_test_recorder(config: &Config) -> (Recorder, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        (Recorder::from_config(Arc::new(storage), config), dir)
    }

    fn meta(project_id: &str) -> NewExecutionLog {
        NewExecutionLog {
            project_id: project_id.to_string(),
            project_name: "Demo".to_string(),
            script_name: "app.py".to_string(),
            command: "run".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn short_output_is_kept_whole() {
        assert_eq!(truncate_output("hello", 10), "hello");
        assert_eq!(truncate_output("", 0), "");
    }

    #[test]
    fn long_output_keeps_tail_with_marker() {
        let out = truncate_output("abcdefghij", 4);
        assert_eq!(out, format!("{TRUNCATION_MARKER}ghij"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // Each 'é' is two bytes; a 3-byte tail would split one.
        let out = truncate_output("éééé", 3);
        assert_eq!(out, format!("{TRUNCATION_MARKER}é"));
    }

    #[tokio::test]
    async fn create_then_get_is_running() {
        let (recorder, _dir) = create_test_recorder(&Config::default()).await;
        let id = recorder.create(meta("p1")).await.unwrap();

        let entry = recorder.get(&id).await.unwrap();
        assert_eq!(entry.status, LogStatus::Running);
        assert_eq!(entry.end_time, 0);
        assert!(entry.start_time > 0);
    }

    #[tokio::test]
    async fn update_sets_status_output_and_end_time() {
        let (recorder, _dir) = create_test_recorder(&Config::default()).await;
        let id = recorder.create(meta("p1")).await.unwrap();

        recorder.update(&id, LogStatus::Success, "X").await.unwrap();

        let entry = recorder.get(&id).await.unwrap();
        assert_eq!(entry.status, LogStatus::Success);
        assert_eq!(entry.output, "X");
        assert!(entry.end_time > 0);
    }

    #[tokio::test]
    async fn update_truncates_to_configured_cap() {
        let config = Config {
            log_output_max_bytes: 8,
            ..Config::default()
        };
        let (recorder, _dir) = create_test_recorder(&config).await;
        let id = recorder.create(meta("p1")).await.unwrap();

        recorder
            .update(&id, LogStatus::Failed, "0123456789abcdef")
            .await
            .unwrap();
        let entry = recorder.get(&id).await.unwrap();
        assert_eq!(entry.output, format!("{TRUNCATION_MARKER}89abcdef"));
    }

    #[tokio::test]
    async fn update_unknown_id_is_not_found() {
        let (recorder, _dir) = create_test_recorder(&Config::default()).await;
        let result = recorder.update(&Id::new(), LogStatus::Failed, "").await;
        assert!(matches!(result, Err(StorageError::LogNotFound(_))));
    }

    #[tokio::test]
    async fn five_hundred_and_first_entry_evicts_oldest() {
        let (recorder, _dir) = create_test_recorder(&Config::default()).await;
        let first = recorder.create(meta("p1")).await.unwrap();
        for _ in 1..500 {
            recorder.create(meta("p1")).await.unwrap();
        }
        assert_eq!(recorder.list(None, None).await.unwrap().len(), 500);
        assert!(recorder.get(&first).await.is_ok());

        let newest = recorder.create(meta("p1")).await.unwrap();
        let all = recorder.list(None, None).await.unwrap();
        assert_eq!(all.len(), 500);
        assert_eq!(all[0].id, newest);
        assert!(recorder.get(&first).await.is_err());
    }

    #[tokio::test]
    async fn empty_filters_mean_everything() {
        let (recorder, _dir) = create_test_recorder(&Config::default()).await;
        recorder.create(meta("a")).await.unwrap();
        recorder.create(meta("b")).await.unwrap();

        assert_eq!(recorder.list(Some(""), Some(0)).await.unwrap().len(), 2);
        assert_eq!(recorder.list(Some("a"), None).await.unwrap().len(), 1);
        assert_eq!(recorder.clear(Some("")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn concurrent_updates_to_different_entries_both_persist() {
        let (recorder, _dir) = create_test_recorder(&Config::default()).await;
        let a = recorder.create(meta("p")).await.unwrap();
        let b = recorder.create(meta("p")).await.unwrap();

        let (ra, rb) = tokio::join!(
            recorder.update(&a, LogStatus::Success, "a-out"),
            recorder.update(&b, LogStatus::Failed, "b-out"),
        );
        ra.unwrap();
        rb.unwrap();

        assert_eq!(recorder.get(&a).await.unwrap().output, "a-out");
        assert_eq!(recorder.get(&b).await.unwrap().status, LogStatus::Failed);
    }
}
