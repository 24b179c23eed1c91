// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistent uuid to internal id mapping.
//!
//! The map is stored as a flat JSON object `{ "<uuid>": "<internal id>" }`,
//! one file per daemon. It is rewritten in full on every change. Only one
//! process may own a given file.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::PersistenceError;

/// Bidirectional uuid/internal id map backed by a JSON file.
#[derive(Debug)]
pub struct UuidMap {
    /// File the map is persisted to. `None` keeps the map in memory only.
    path: Option<PathBuf>,
    /// Authoritative direction, as written to disk.
    by_uuid: BTreeMap<String, String>,
    /// Reverse index.
    by_internal_id: HashMap<String, String>,
    /// Set when the last write failed, so the next mutation retries it.
    dirty: bool,
}

impl UuidMap {
    /// Creates an empty map that is never written to disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            by_uuid: BTreeMap::new(),
            by_internal_id: HashMap::new(),
            dirty: false,
        }
    }

    /// Loads the map from `path`.
    ///
    /// A missing file yields an empty map. An unreadable or malformed file
    /// is logged and also yields an empty map, which will replace the file
    /// on the next change.
    #[must_use]
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut map = Self {
            path: Some(path.clone()),
            ..Self::in_memory()
        };

        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No uuid map found, starting empty");
                return map;
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to read uuid map");
                return map;
            }
        };

        match serde_json::from_str::<BTreeMap<String, String>>(&contents) {
            Ok(entries) => {
                for (uuid, internal_id) in entries {
                    map.insert_entry(uuid, internal_id);
                }
                tracing::info!(
                    path = %path.display(),
                    entries = map.len(),
                    "Loaded uuid map"
                );
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to parse uuid map");
            }
        }

        map
    }

    /// Returns the backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_uuid.len()
    }

    /// Returns true if the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_uuid.is_empty()
    }

    /// Returns the uuid bound to `internal_id`.
    #[must_use]
    pub fn uuid_of(&self, internal_id: &str) -> Option<&str> {
        self.by_internal_id.get(internal_id).map(String::as_str)
    }

    /// Returns the internal id bound to `uuid`.
    #[must_use]
    pub fn internal_id_of(&self, uuid: &str) -> Option<&str> {
        self.by_uuid.get(uuid).map(String::as_str)
    }

    /// Binds `uuid` to `internal_id` in memory.
    ///
    /// Callers check for conflicts first; an existing binding for either
    /// side is replaced so both indexes stay inverse to each other.
    pub(crate) fn insert_entry(&mut self, uuid: String, internal_id: String) {
        if let Some(old_internal) = self.by_uuid.remove(&uuid) {
            self.by_internal_id.remove(&old_internal);
        }
        if let Some(old_uuid) = self.by_internal_id.remove(&internal_id) {
            self.by_uuid.remove(&old_uuid);
        }
        self.by_internal_id.insert(internal_id.clone(), uuid.clone());
        self.by_uuid.insert(uuid, internal_id);
        self.dirty = true;
    }

    /// Returns true if a previous write failed or an entry changed since.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Writes the whole map to disk.
    ///
    /// The file is written next to its destination and renamed over it, so a
    /// crash never leaves a truncated map behind.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the directory cannot be created or the
    /// file cannot be written. The in-memory map is unaffected and stays
    /// dirty.
    pub fn persist(&mut self) -> Result<(), PersistenceError> {
        let Some(path) = self.path.clone() else {
            self.dirty = false;
            return Ok(());
        };

        let io_err = |source| PersistenceError::Io {
            path: path.display().to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let contents = serde_json::to_string_pretty(&self.by_uuid)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents).map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)?;

        self.dirty = false;
        tracing::debug!(path = %path.display(), entries = self.len(), "Stored uuid map");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let map = UuidMap::load(dir.path().join("absent.json"));
        assert!(map.is_empty());
        assert!(!map.is_dirty());
    }

    #[test]
    fn persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uuidmap").join("zwave.json");

        let mut map = UuidMap::load(&path);
        map.insert_entry("u-1".into(), "node-1".into());
        map.persist().unwrap();
        assert!(!map.is_dirty());

        let reloaded = UuidMap::load(&path);
        assert_eq!(reloaded.uuid_of("node-1"), Some("u-1"));
        assert_eq!(reloaded.internal_id_of("u-1"), Some("node-1"));
    }

    #[test]
    fn file_format_is_flat_uuid_to_internal_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knx.json");

        let mut map = UuidMap::load(&path);
        map.insert_entry("u-1".into(), "1/2/3".into());
        map.persist().unwrap();

        let raw: BTreeMap<String, String> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw["u-1"], "1/2/3");
    }

    #[test]
    fn malformed_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "not json").unwrap();
        assert!(UuidMap::load(&path).is_empty());
    }

    #[test]
    fn rebinding_keeps_indexes_inverse() {
        let mut map = UuidMap::in_memory();
        map.insert_entry("u-1".into(), "a".into());
        map.insert_entry("u-1".into(), "b".into());

        assert_eq!(map.internal_id_of("u-1"), Some("b"));
        assert_eq!(map.uuid_of("a"), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn failed_write_stays_dirty() {
        let dir = tempfile::tempdir().unwrap();
        // A directory in place of the file makes the rename fail.
        let path = dir.path().join("taken.json");
        fs::create_dir_all(&path).unwrap();

        let mut map = UuidMap::load(&path);
        map.insert_entry("u-1".into(), "a".into());
        assert!(map.persist().is_err());
        assert!(map.is_dirty());
        assert_eq!(map.uuid_of("a"), Some("u-1"));
    }
}
