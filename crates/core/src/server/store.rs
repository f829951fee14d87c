use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::Value;

/// Named workflows persisted as JSON files under one directory. The core
/// treats the payload as opaque JSON matching the graph wire schema.
pub struct WorkflowStore {
    dir: PathBuf,
}

/// Reject names that would escape the store directory or collide with the
/// on-disk layout.
pub fn sanitize_workflow_name(name: &str) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        bail!("workflow name must not be empty");
    }
    if name.ends_with(".json") {
        bail!("workflow name must not include .json suffix");
    }
    if name.contains('/') || name.contains('\\') {
        bail!("workflow name must not contain path separators");
    }
    if name.contains("..") {
        bail!("workflow name must not contain '..'");
    }
    Ok(())
}

impl WorkflowStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        sanitize_workflow_name(name)?;
        Ok(self.dir.join(format!("{}.json", name.trim())))
    }

    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(Vec::new()),
        };

        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    return None;
                }
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(str::to_string)
            })
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn load(&self, name: &str) -> Result<Option<Value>> {
        let path = self.path_for(name)?;
        if !path.exists() {
            return Ok(None);
        }

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read workflow {}", path.display()))?;
        let workflow: Value = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse workflow {}", path.display()))?;
        Ok(Some(workflow))
    }

    pub fn save(&self, name: &str, workflow: &Value) -> Result<()> {
        let path = self.path_for(name)?;
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create workflows dir {}", self.dir.display()))?;

        let raw = serde_json::to_string_pretty(workflow).context("failed to encode workflow")?;
        fs::write(&path, raw)
            .with_context(|| format!("failed to write workflow {}", path.display()))?;
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<bool> {
        let path = self.path_for(name)?;
        if !path.exists() {
            return Ok(false);
        }

        fs::remove_file(&path)
            .with_context(|| format!("failed to delete workflow {}", path.display()))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, WorkflowStore) {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let store = WorkflowStore::new(dir.path().join("workflows"));
        (dir, store)
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (_guard, store) = store();
        let workflow = json!({"nodes": {}, "connections": []});

        store.save("pipeline", &workflow).expect("save should succeed");
        let loaded = store
            .load("pipeline")
            .expect("load should succeed")
            .expect("workflow should exist");
        assert_eq!(loaded, workflow);
    }

    #[test]
    fn test_list_returns_sorted_names() {
        let (_guard, store) = store();
        let workflow = json!({"nodes": {}});
        store.save("zeta", &workflow).expect("save should succeed");
        store.save("alpha", &workflow).expect("save should succeed");

        assert_eq!(store.list().expect("list should succeed"), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_missing_workflow_loads_none() {
        let (_guard, store) = store();
        assert!(store.load("nope").expect("load should succeed").is_none());
    }

    #[test]
    fn test_delete() {
        let (_guard, store) = store();
        store
            .save("gone", &json!({}))
            .expect("save should succeed");

        assert!(store.delete("gone").expect("delete should succeed"));
        assert!(!store.delete("gone").expect("second delete should succeed"));
    }

    #[test]
    fn test_name_sanitization() {
        assert!(sanitize_workflow_name("fine-name_01").is_ok());
        assert!(sanitize_workflow_name("").is_err());
        assert!(sanitize_workflow_name("  ").is_err());
        assert!(sanitize_workflow_name("has.json").is_err());
        assert!(sanitize_workflow_name("a/b").is_err());
        assert!(sanitize_workflow_name("a\\b").is_err());
        assert!(sanitize_workflow_name("../escape").is_err());
    }

    #[test]
    fn test_list_without_directory_is_empty() {
        let (_guard, store) = store();
        assert!(store.list().expect("list should succeed").is_empty());
    }
}
