//! Usage Storage
//!
//! One JSON document per partition day.
//! Storage: `{usage_root}/{YYYY-MM-DD}.json`

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::debug;

use super::DailyUsageState;
use crate::core::{CoreError, CoreResult};

/// Date format of partition keys and file stems
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// File-backed store of daily usage documents
#[derive(Debug, Clone)]
pub struct UsageStore {
    root: PathBuf,
}

impl UsageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn validate_date(date: &str) -> CoreResult<()> {
        NaiveDate::parse_from_str(date, DATE_FORMAT)
            .map(|_| ())
            .map_err(|_| CoreError::Validation(format!("Invalid usage date: {}", date)))
    }

    pub fn path_for(&self, date: &str) -> PathBuf {
        self.root.join(format!("{}.json", date))
    }

    /// Loads a day's usage; `None` when nothing was saved for it
    pub async fn load(&self, date: &str) -> CoreResult<Option<DailyUsageState>> {
        Self::validate_date(date)?;
        let path = self.path_for(date);

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let state: DailyUsageState = serde_json::from_str(&content)?;
        debug!("Loaded usage for {} from {}", date, path.display());
        Ok(Some(state))
    }

    /// Saves a day's usage atomically (temp file + rename)
    pub async fn save(&self, state: &DailyUsageState) -> CoreResult<()> {
        Self::validate_date(&state.date)?;
        tokio::fs::create_dir_all(&self.root).await?;

        let path = self.path_for(&state.date);
        let temp_path = path.with_extension(format!("json.tmp.{}", ulid::Ulid::new()));
        let content = serde_json::to_string_pretty(state)?;

        tokio::fs::write(&temp_path, content).await?;
        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        debug!("Saved usage for {} to {}", state.date, path.display());
        Ok(())
    }

    /// Dates with a saved document, ascending
    pub async fn list_dates(&self) -> CoreResult<Vec<String>> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut dates = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if Self::validate_date(stem).is_ok() {
                    dates.push(stem.to_string());
                }
            }
        }

        dates.sort();
        Ok(dates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = UsageStore::new(dir.path().join("usage"));

        let mut state = DailyUsageState::new("2025-03-10");
        state.counters.images = 3;
        state.counters.total_cost = 0.09;
        store.save(&state).await.unwrap();

        let loaded = store.load("2025-03-10").await.unwrap();
        assert_eq!(loaded, Some(state));
        assert!(store.load("2025-03-11").await.unwrap().is_none());
        assert!(!store.path_for("2025-03-10").with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_list_dates_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        let store = UsageStore::new(dir.path());

        for date in ["2025-03-12", "2025-03-10", "2025-03-11"] {
            store.save(&DailyUsageState::new(date)).await.unwrap();
        }
        std::fs::write(dir.path().join("notes.json"), "{}").unwrap();
        std::fs::write(dir.path().join("2025-03-09.txt"), "").unwrap();

        assert_eq!(
            store.list_dates().await.unwrap(),
            vec!["2025-03-10", "2025-03-11", "2025-03-12"]
        );
    }

    #[tokio::test]
    async fn test_rejects_path_like_dates() {
        let dir = TempDir::new().unwrap();
        let store = UsageStore::new(dir.path());
        assert!(matches!(
            store.load("../secrets").await,
            Err(CoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupted_document_is_error() {
        let dir = TempDir::new().unwrap();
        let store = UsageStore::new(dir.path());
        std::fs::write(store.path_for("2025-03-10"), "not json").unwrap();
        assert!(matches!(
            store.load("2025-03-10").await,
            Err(CoreError::Json(_))
        ));
    }
}
