use super::{Entry, MetadataStore};
use crate::manifest::Manifest;
use crate::path;
use crate::{DriveError, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Namespace held in a process-local map. Nothing survives a restart.
#[derive(Debug)]
pub struct MemoryMetadataStore {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            path::ROOT.to_string(),
            Entry::directory(path::ROOT, Utc::now()),
        );
        Self {
            entries: Mutex::new(entries),
        }
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn require_parent_dir(entries: &BTreeMap<String, Entry>, target: &str) -> Result<()> {
    let parent = path::parent(target)
        .ok_or_else(|| DriveError::InvalidRequest("the root has no parent".to_string()))?;
    match entries.get(parent) {
        None => Err(DriveError::NotFound(parent.to_string())),
        Some(entry) if !entry.is_dir() => Err(DriveError::NotADirectory(parent.to_string())),
        Some(_) => Ok(()),
    }
}

fn has_children(entries: &BTreeMap<String, Entry>, dir: &str) -> bool {
    entries
        .keys()
        .any(|key| path::parent(key) == Some(dir))
}

impl MetadataStore for MemoryMetadataStore {
    fn get(&self, path: &str) -> Result<Option<Entry>> {
        Ok(self.entries().get(path).cloned())
    }

    fn create_dir(&self, target: &str) -> Result<Entry> {
        let mut entries = self.entries();
        if entries.contains_key(target) {
            return Err(DriveError::AlreadyExists(target.to_string()));
        }
        require_parent_dir(&entries, target)?;

        let entry = Entry::directory(target, Utc::now());
        entries.insert(target.to_string(), entry.clone());
        Ok(entry)
    }

    fn create_file(&self, target: &str) -> Result<Entry> {
        let mut entries = self.entries();
        match entries.get(target) {
            Some(entry) if entry.is_file() => return Ok(entry.clone()),
            Some(_) => return Err(DriveError::IsADirectory(target.to_string())),
            None => {}
        }
        require_parent_dir(&entries, target)?;

        let entry = Entry::file(target, Utc::now());
        entries.insert(target.to_string(), entry.clone());
        Ok(entry)
    }

    fn list(&self, dir: &str) -> Result<Vec<Entry>> {
        let entries = self.entries();
        match entries.get(dir) {
            None => return Err(DriveError::NotFound(dir.to_string())),
            Some(entry) if !entry.is_dir() => {
                return Err(DriveError::NotADirectory(dir.to_string()));
            }
            Some(_) => {}
        }

        let mut children: Vec<Entry> = entries
            .values()
            .filter(|entry| path::parent(&entry.path) == Some(dir))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(children)
    }

    fn commit_manifest(
        &self,
        target: &str,
        expected_version: u64,
        manifest: &Manifest,
        modified_at: DateTime<Utc>,
    ) -> Result<Entry> {
        let mut entries = self.entries();
        let entry = entries
            .get_mut(target)
            .ok_or_else(|| DriveError::NotFound(target.to_string()))?;
        if entry.is_dir() {
            return Err(DriveError::IsADirectory(target.to_string()));
        }
        if entry.version != expected_version {
            return Err(DriveError::Conflict(format!(
                "{} is at version {}, expected {}",
                target, entry.version, expected_version
            )));
        }

        entry.size = manifest.size;
        entry.manifest = Some(manifest.clone());
        entry.version += 1;
        entry.modified_at = modified_at;
        Ok(entry.clone())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        if path::is_root(from) {
            return Err(DriveError::InvalidRequest(
                "the root cannot be renamed".to_string(),
            ));
        }

        let mut entries = self.entries();
        if !entries.contains_key(from) {
            return Err(DriveError::NotFound(from.to_string()));
        }
        if from == to {
            return Ok(());
        }
        if path::is_descendant(to, from) {
            return Err(DriveError::InvalidRequest(format!(
                "cannot move {} under itself",
                from
            )));
        }
        if entries.contains_key(to) {
            return Err(DriveError::AlreadyExists(to.to_string()));
        }
        require_parent_dir(&entries, to)?;

        let moved: Vec<String> = entries
            .keys()
            .filter(|key| key.as_str() == from || path::is_descendant(key, from))
            .cloned()
            .collect();
        for old in moved {
            if let Some(mut entry) = entries.remove(&old) {
                entry.path = format!("{}{}", to, &old[from.len()..]);
                entries.insert(entry.path.clone(), entry);
            }
        }
        Ok(())
    }

    fn remove_file(&self, target: &str) -> Result<Entry> {
        let mut entries = self.entries();
        match entries.get(target) {
            None => Err(DriveError::NotFound(target.to_string())),
            Some(entry) if entry.is_dir() => Err(DriveError::IsADirectory(target.to_string())),
            Some(_) => entries
                .remove(target)
                .ok_or_else(|| DriveError::NotFound(target.to_string())),
        }
    }

    fn remove_dir(&self, target: &str) -> Result<()> {
        if path::is_root(target) {
            return Err(DriveError::InvalidRequest(
                "the root cannot be removed".to_string(),
            ));
        }

        let mut entries = self.entries();
        match entries.get(target) {
            None => return Err(DriveError::NotFound(target.to_string())),
            Some(entry) if !entry.is_dir() => {
                return Err(DriveError::NotADirectory(target.to_string()));
            }
            Some(_) => {}
        }
        if has_children(&entries, target) {
            return Err(DriveError::DirectoryNotEmpty(target.to_string()));
        }

        entries.remove(target);
        Ok(())
    }
}
