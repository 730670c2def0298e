//! Contract with the local merge-tree storage engine.
//!
//! The replication core never touches the on-disk part format; it drives the
//! local engine through this narrow synchronous interface. `MemoryStore` is
//! the in-process implementation the tests run on: parts are file maps, rows
//! are text lines in `data.bin`, and predicates match by substring.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{EngineError, Result};
use crate::mutation::MutationCommand;
use crate::part::{ActivePartSet, PartChecksums, PartInfo};

/// One materialized part: identity, schema, payload, checksums.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Part {
    pub info: PartInfo,
    pub columns: Vec<String>,
    pub rows: u64,
    pub files: BTreeMap<String, Vec<u8>>,
    pub checksums: PartChecksums,
}

impl Part {
    /// Build a part, deriving checksums from the files.
    pub fn build(
        info: PartInfo,
        columns: Vec<String>,
        files: BTreeMap<String, Vec<u8>>,
    ) -> Self {
        let mut checksums = PartChecksums::default();
        let mut rows = 0;
        for (name, bytes) in &files {
            checksums.add_file(name.clone(), bytes);
            if name == "data.bin" {
                rows = bytes.split(|b| *b == b'\n').filter(|l| !l.is_empty()).count() as u64;
            }
        }
        Self {
            info,
            columns,
            rows,
            files,
            checksums,
        }
    }

    /// Build a part holding `rows` as lines of `data.bin`.
    pub fn from_rows(info: PartInfo, columns: Vec<String>, rows: &[String]) -> Self {
        let mut data = Vec::new();
        for row in rows {
            data.extend_from_slice(row.as_bytes());
            data.push(b'\n');
        }
        let mut files = BTreeMap::new();
        files.insert("data.bin".to_string(), data);
        files.insert(
            "columns.txt".to_string(),
            columns.join("\n").into_bytes(),
        );
        Self::build(info, columns, files)
    }

    /// An empty placeholder part for a lost block range.
    pub fn empty(info: PartInfo) -> Self {
        Self::from_rows(info, Vec::new(), &[])
    }

    pub fn data_lines(&self) -> Vec<String> {
        self.files
            .get("data.bin")
            .map(|bytes| {
                String::from_utf8_lossy(bytes)
                    .lines()
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Recompute checksums and compare against the recorded ones.
    pub fn verify(&self) -> Result<()> {
        let mut fresh = PartChecksums::default();
        for (name, bytes) in &self.files {
            fresh.add_file(name.clone(), bytes);
        }
        if fresh != self.checksums {
            return Err(EngineError::ChecksumMismatch(self.info.name()));
        }
        Ok(())
    }
}

/// Synchronous contract the replication core drives the local engine with.
pub trait LocalStore: Send + Sync {
    /// Make a built part active, replacing any parts it covers.
    fn commit_part(&self, part: Part) -> Result<()>;

    /// Move an active part to the detached area.
    fn rename_and_detach(&self, part_name: &str) -> Result<()>;

    /// Drop an active part outright.
    fn remove_part(&self, part_name: &str) -> Result<()>;

    /// Merge active source parts into `target`. Does not commit.
    fn merge_parts(&self, source_names: &[String], target: &PartInfo) -> Result<Part>;

    /// Rewrite one part under `commands`, producing `target`. Does not commit.
    fn mutate_part(
        &self,
        source_name: &str,
        target: &PartInfo,
        commands: &[MutationCommand],
    ) -> Result<Part>;

    /// Rewrite one part without the named column, producing `target`.
    fn clear_column(&self, source_name: &str, target: &PartInfo, column: &str) -> Result<Part>;

    /// Adopt a new table-wide column set (ALTER). Existing parts keep their
    /// schemas; merges and mutations rewrite them onto the new set.
    fn apply_columns(&self, columns: &[String]) -> Result<()>;

    /// The current table-wide column set.
    fn table_columns(&self) -> Vec<String>;

    fn enumerate_active_parts(&self) -> Vec<PartInfo>;

    /// Recorded checksums of an active part.
    fn checksum(&self, part_name: &str) -> Result<PartChecksums>;

    /// Full part payload, for sending to peers.
    fn get_part(&self, part_name: &str) -> Result<Part>;

    /// Bytes available for merge scratch space.
    fn free_space(&self) -> u64;
}

#[derive(Default)]
struct MemoryStoreInner {
    active: ActivePartSet,
    parts: BTreeMap<String, Part>,
    detached: BTreeMap<String, Part>,
    table_columns: Vec<String>,
}

/// In-process store used by every test and by local tooling.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
    free_space: Option<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_free_space(free_space: u64) -> Self {
        Self {
            inner: Mutex::default(),
            free_space: Some(free_space),
        }
    }

    /// Test hook: damage a file so checksum verification fails.
    pub fn corrupt_part(&self, part_name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let part = inner
            .parts
            .get_mut(part_name)
            .ok_or_else(|| EngineError::PartNotFound(part_name.to_string()))?;
        let data = part
            .files
            .get_mut("data.bin")
            .ok_or_else(|| EngineError::PartNotFound(format!("{part_name}/data.bin")))?;
        data.push(b'!');
        Ok(())
    }

    /// Test hook: drop a part without going through replication.
    pub fn lose_part(&self, part_name: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(part) = inner.parts.remove(part_name) {
            inner.active.remove(&part.info);
        }
    }

    pub fn detached_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().detached.keys().cloned().collect()
    }

    pub fn total_rows(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .active
            .parts()
            .filter_map(|info| inner.parts.get(&info.name()))
            .map(|p| p.rows)
            .sum()
    }

    /// All rows across active parts, sorted, for end-state comparisons.
    pub fn all_rows(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<String> = inner
            .active
            .parts()
            .filter_map(|info| inner.parts.get(&info.name()))
            .flat_map(|p| p.data_lines())
            .collect();
        rows.sort();
        rows
    }
}

impl LocalStore for MemoryStore {
    fn commit_part(&self, part: Part) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let name = part.info.name();
        if inner.parts.contains_key(&name) {
            return Err(EngineError::PartAlreadyExists(name));
        }
        match inner.active.add(part.info.clone()) {
            crate::part::AddOutcome::Added { replaced } => {
                for old in replaced {
                    inner.parts.remove(&old);
                }
            }
            crate::part::AddOutcome::Covered { by } => {
                return Err(EngineError::PartAlreadyExists(format!(
                    "{name} is covered by {by}"
                )));
            }
        }
        inner.parts.insert(name, part);
        Ok(())
    }

    fn rename_and_detach(&self, part_name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let part = inner
            .parts
            .remove(part_name)
            .ok_or_else(|| EngineError::PartNotFound(part_name.to_string()))?;
        inner.active.remove(&part.info);
        inner.detached.insert(part_name.to_string(), part);
        Ok(())
    }

    fn remove_part(&self, part_name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let part = inner
            .parts
            .remove(part_name)
            .ok_or_else(|| EngineError::PartNotFound(part_name.to_string()))?;
        inner.active.remove(&part.info);
        Ok(())
    }

    fn merge_parts(&self, source_names: &[String], target: &PartInfo) -> Result<Part> {
        let inner = self.inner.lock().unwrap();
        let mut rows = Vec::new();
        let mut columns = Vec::new();
        for name in source_names {
            let part = inner
                .parts
                .get(name)
                .ok_or_else(|| EngineError::PartNotFound(name.clone()))?;
            if columns.is_empty() {
                columns = part.columns.clone();
            }
            rows.extend(part.data_lines());
        }
        rows.sort();
        Ok(Part::from_rows(target.clone(), columns, &rows))
    }

    fn mutate_part(
        &self,
        source_name: &str,
        target: &PartInfo,
        commands: &[MutationCommand],
    ) -> Result<Part> {
        let inner = self.inner.lock().unwrap();
        let part = inner
            .parts
            .get(source_name)
            .ok_or_else(|| EngineError::PartNotFound(source_name.to_string()))?;
        let mut rows = part.data_lines();
        for command in commands {
            match command {
                MutationCommand::Delete { predicate } => {
                    rows.retain(|row| !row.contains(predicate.as_str()));
                }
                MutationCommand::Update {
                    column,
                    expression,
                    predicate,
                } => {
                    for row in rows.iter_mut() {
                        if row.contains(predicate.as_str()) {
                            *row = row.replace(column.as_str(), expression.as_str());
                        }
                    }
                }
            }
        }
        Ok(Part::from_rows(target.clone(), part.columns.clone(), &rows))
    }

    fn clear_column(&self, source_name: &str, target: &PartInfo, column: &str) -> Result<Part> {
        let inner = self.inner.lock().unwrap();
        let part = inner
            .parts
            .get(source_name)
            .ok_or_else(|| EngineError::PartNotFound(source_name.to_string()))?;
        let columns: Vec<String> = part
            .columns
            .iter()
            .filter(|c| c.as_str() != column)
            .cloned()
            .collect();
        let rows = part.data_lines();
        Ok(Part::from_rows(target.clone(), columns, &rows))
    }

    fn apply_columns(&self, columns: &[String]) -> Result<()> {
        self.inner.lock().unwrap().table_columns = columns.to_vec();
        Ok(())
    }

    fn table_columns(&self) -> Vec<String> {
        self.inner.lock().unwrap().table_columns.clone()
    }

    fn enumerate_active_parts(&self) -> Vec<PartInfo> {
        self.inner
            .lock()
            .unwrap()
            .active
            .parts()
            .cloned()
            .collect()
    }

    fn checksum(&self, part_name: &str) -> Result<PartChecksums> {
        let inner = self.inner.lock().unwrap();
        let part = inner
            .parts
            .get(part_name)
            .ok_or_else(|| EngineError::PartNotFound(part_name.to_string()))?;
        // Recompute from payload so local corruption is visible.
        let mut fresh = PartChecksums::default();
        for (name, bytes) in &part.files {
            fresh.add_file(name.clone(), bytes);
        }
        Ok(fresh)
    }

    fn get_part(&self, part_name: &str) -> Result<Part> {
        let inner = self.inner.lock().unwrap();
        inner
            .parts
            .get(part_name)
            .cloned()
            .ok_or_else(|| EngineError::PartNotFound(part_name.to_string()))
    }

    fn free_space(&self) -> u64 {
        self.free_space.unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str) -> PartInfo {
        PartInfo::parse(name).unwrap()
    }

    #[test]
    fn commit_replaces_covered_parts() {
        let store = MemoryStore::new();
        store
            .commit_part(Part::from_rows(info("2024_0_0_0"), vec!["v".into()], &["a".into()]))
            .unwrap();
        store
            .commit_part(Part::from_rows(info("2024_1_1_0"), vec!["v".into()], &["b".into()]))
            .unwrap();
        let merged = store
            .merge_parts(
                &["2024_0_0_0".into(), "2024_1_1_0".into()],
                &info("2024_0_1_1"),
            )
            .unwrap();
        store.commit_part(merged).unwrap();

        let names: Vec<String> = store
            .enumerate_active_parts()
            .iter()
            .map(|p| p.name())
            .collect();
        assert_eq!(names, vec!["2024_0_1_1"]);
        assert_eq!(store.all_rows(), vec!["a", "b"]);
        // Covered sources are gone entirely.
        assert!(store.get_part("2024_0_0_0").is_err());
    }

    #[test]
    fn corruption_shows_in_checksums() {
        let store = MemoryStore::new();
        let part = Part::from_rows(info("2024_0_0_0"), vec!["v".into()], &["x".into()]);
        let recorded = part.checksums.clone();
        store.commit_part(part).unwrap();
        store.corrupt_part("2024_0_0_0").unwrap();
        let fresh = store.checksum("2024_0_0_0").unwrap();
        assert_ne!(recorded, fresh);
    }

    #[test]
    fn mutation_commands_rewrite_rows() {
        let store = MemoryStore::new();
        store
            .commit_part(Part::from_rows(
                info("2024_0_0_0"),
                vec!["user".into()],
                &["user=7".into(), "user=8".into()],
            ))
            .unwrap();
        let mutated = store
            .mutate_part(
                "2024_0_0_0",
                &info("2024_0_0_0_1"),
                &[MutationCommand::Delete {
                    predicate: "user=7".into(),
                }],
            )
            .unwrap();
        assert_eq!(mutated.rows, 1);
        store.commit_part(mutated).unwrap();
        assert_eq!(store.all_rows(), vec!["user=8"]);
    }
}
