//! # Directory Store
//!
//! Trait-based persistence for entity and group records. The store is
//! serialization-agnostic from the tree's point of view: records go in,
//! records come out, discovery lists what exists. Two backends:
//!
//! - **MemoryStore**: in-process maps (tests, development - lost on exit)
//! - **FileStore**: one binary file per record, replaced atomically
//!   (single-host production)
//!
//! ## Consistency model
//!
//! The tree is the single writer and performs write-through: a mutation
//! lands here first and is committed to the in-memory index only if the
//! store accepted it. Backends therefore only need atomicity per record,
//! not transactions.
//!
//! ## Example
//!
//! ```rust
//! use netauth_core::store::{DirectoryStore, MemoryStore};
//! use netauth_core::entity::Entity;
//!
//! let mut store = MemoryStore::new();
//! store.save_entity(&Entity::new("camille", 1)).unwrap();
//! assert_eq!(store.discover_entity_ids().unwrap(), vec!["camille"]);
//! ```

use crate::entity::Entity;
use crate::group::Group;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown entity")]
    UnknownEntity,

    #[error("unknown group")]
    UnknownGroup,

    #[error("record name {0:?} cannot be used on this backend")]
    BadRecordName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Outcome of a backend health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    pub ok: bool,
    pub detail: String,
}

// ============================================================================
// TRAIT: DirectoryStore
// ============================================================================

/// Durable key-to-record persistence for the directory.
///
/// Implementations must guarantee:
/// 1. Per-record atomicity: a save either fully replaces the record or
///    leaves the previous version intact.
/// 2. Load-after-save: a successful save is visible to the next load.
/// 3. Discovery reflects exactly the records that would load.
pub trait DirectoryStore: Send {
    fn save_entity(&mut self, entity: &Entity) -> Result<()>;
    fn load_entity(&self, id: &str) -> Result<Entity>;
    fn delete_entity(&mut self, id: &str) -> Result<()>;
    fn discover_entity_ids(&self) -> Result<Vec<String>>;

    fn save_group(&mut self, group: &Group) -> Result<()>;
    fn load_group(&self, name: &str) -> Result<Group>;
    fn delete_group(&mut self, name: &str) -> Result<()>;
    fn discover_group_names(&self) -> Result<Vec<String>>;

    fn health(&self) -> HealthStatus;
}

// ============================================================================
// MEMORY STORE (tests, development)
// ============================================================================

/// In-memory store. Contents vanish with the process.
#[derive(Default)]
pub struct MemoryStore {
    entities: HashMap<String, Entity>,
    groups: HashMap<String, Group>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

impl DirectoryStore for MemoryStore {
    fn save_entity(&mut self, entity: &Entity) -> Result<()> {
        self.entities.insert(entity.id.clone(), entity.clone());
        Ok(())
    }

    fn load_entity(&self, id: &str) -> Result<Entity> {
        self.entities.get(id).cloned().ok_or(StoreError::UnknownEntity)
    }

    fn delete_entity(&mut self, id: &str) -> Result<()> {
        self.entities.remove(id).map(|_| ()).ok_or(StoreError::UnknownEntity)
    }

    fn discover_entity_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.entities.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn save_group(&mut self, group: &Group) -> Result<()> {
        self.groups.insert(group.name.clone(), group.clone());
        Ok(())
    }

    fn load_group(&self, name: &str) -> Result<Group> {
        self.groups.get(name).cloned().ok_or(StoreError::UnknownGroup)
    }

    fn delete_group(&mut self, name: &str) -> Result<()> {
        self.groups.remove(name).map(|_| ()).ok_or(StoreError::UnknownGroup)
    }

    fn discover_group_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.groups.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn health(&self) -> HealthStatus {
        HealthStatus {
            ok: true,
            detail: format!(
                "memory store: {} entities, {} groups",
                self.entities.len(),
                self.groups.len()
            ),
        }
    }
}

// ============================================================================
// FILE STORE (single-host production)
// ============================================================================

/// File-backed store: `entities/` and `groups/` under a root directory,
/// one bincode file per record named by its id or name.
///
/// Writes go to a hidden temp file in the same directory and are renamed
/// over the target, so readers observe either the old record or the new
/// one, never a torn write. Discovery is a directory listing that skips
/// hidden files.
pub struct FileStore {
    entity_dir: PathBuf,
    group_dir: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `root`, creating the layout if needed.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        let entity_dir = root.join("entities");
        let group_dir = root.join("groups");
        fs::create_dir_all(&entity_dir)?;
        fs::create_dir_all(&group_dir)?;
        Ok(FileStore { entity_dir, group_dir })
    }

    fn record_path(dir: &Path, name: &str) -> Result<PathBuf> {
        // Record names become file names verbatim, so anything that could
        // escape the directory or collide with temp files is refused.
        if name.is_empty()
            || name.starts_with('.')
            || name.contains('/')
            || name.contains('\\')
            || name.contains('\0')
        {
            return Err(StoreError::BadRecordName(name.to_string()));
        }
        Ok(dir.join(name))
    }

    fn write_record<T: Serialize>(dir: &Path, name: &str, record: &T) -> Result<()> {
        let path = Self::record_path(dir, name)?;
        let bytes = bincode::serialize(record).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let tmp = dir.join(format!(".{}.tmp", name));
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_record<T: DeserializeOwned>(dir: &Path, name: &str, missing: StoreError) -> Result<T> {
        let path = Self::record_path(dir, name)?;
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(missing),
            Err(e) => return Err(e.into()),
        };
        bincode::deserialize(&bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn remove_record(dir: &Path, name: &str, missing: StoreError) -> Result<()> {
        let path = Self::record_path(dir, name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(missing),
            Err(e) => Err(e.into()),
        }
    }

    fn list_records(dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for dent in fs::read_dir(dir)? {
            let dent = dent?;
            let name = dent.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }
}

impl DirectoryStore for FileStore {
    fn save_entity(&mut self, entity: &Entity) -> Result<()> {
        Self::write_record(&self.entity_dir, &entity.id, entity)
    }

    fn load_entity(&self, id: &str) -> Result<Entity> {
        Self::read_record(&self.entity_dir, id, StoreError::UnknownEntity)
    }

    fn delete_entity(&mut self, id: &str) -> Result<()> {
        Self::remove_record(&self.entity_dir, id, StoreError::UnknownEntity)
    }

    fn discover_entity_ids(&self) -> Result<Vec<String>> {
        Self::list_records(&self.entity_dir)
    }

    fn save_group(&mut self, group: &Group) -> Result<()> {
        Self::write_record(&self.group_dir, &group.name, group)
    }

    fn load_group(&self, name: &str) -> Result<Group> {
        Self::read_record(&self.group_dir, name, StoreError::UnknownGroup)
    }

    fn delete_group(&mut self, name: &str) -> Result<()> {
        Self::remove_record(&self.group_dir, name, StoreError::UnknownGroup)
    }

    fn discover_group_names(&self) -> Result<Vec<String>> {
        Self::list_records(&self.group_dir)
    }

    fn health(&self) -> HealthStatus {
        let ok = self.entity_dir.is_dir() && self.group_dir.is_dir();
        HealthStatus {
            ok,
            detail: if ok {
                format!("file store at {}", self.entity_dir.parent().unwrap_or(&self.entity_dir).display())
            } else {
                "file store directories missing".to_string()
            },
        }
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Which store backend to construct.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    Memory,
    File(PathBuf),
}

/// Build a store from configuration.
pub fn create_store(config: StoreConfig) -> Result<Box<dyn DirectoryStore>> {
    match config {
        StoreConfig::Memory => Ok(Box::new(MemoryStore::new())),
        StoreConfig::File(root) => Ok(Box::new(FileStore::new(root)?)),
    }
}
