//! Replication slots
//!
//! A slot pins log (and, through `xmin`, row versions) for one consumer
//! across disconnects. Slots are kept in memory and, when a directory is
//! configured, mirrored as one JSON file per slot:
//!
//! ```text
//! <dir>/<name>.json
//! ```
//!
//! Ephemeral slots exist only while being built. One that survives a
//! crash is removed on the next load.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::errors::{ReplicationError, ReplicationResult};
use crate::observability::{log_event_with_fields, Event};
use crate::wal::LogPosition;

/// Longest accepted slot name.
pub const MAX_SLOT_NAME_LEN: usize = 64;

/// Physical or logical slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SlotKind {
    Physical,
    Logical {
        plugin: String,
        database: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotPersistency {
    Ephemeral,
    Persistent,
}

/// State of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationSlot {
    pub name: String,
    pub kind: SlotKind,
    pub persistency: SlotPersistency,
    /// Oldest position the consumer may still need.
    pub restart_lsn: LogPosition,
    /// Logical only: position up to which changes were confirmed.
    pub confirmed_flush: LogPosition,
    pub xmin: u64,
}

impl ReplicationSlot {
    pub fn is_logical(&self) -> bool {
        matches!(self.kind, SlotKind::Logical { .. })
    }
}

/// Check a slot name against `[a-z0-9_]{1,64}`.
pub fn validate_slot_name(name: &str) -> ReplicationResult<()> {
    if name.is_empty() {
        return Err(ReplicationError::slot(format!(
            "replication slot name \"{}\" is too short",
            name
        )));
    }
    if name.len() > MAX_SLOT_NAME_LEN {
        return Err(ReplicationError::slot(format!(
            "replication slot name \"{}\" is too long",
            name
        )));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
    {
        return Err(ReplicationError::slot(format!(
            "replication slot name \"{}\" contains invalid character",
            name
        )));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Slots {
    by_name: HashMap<String, ReplicationSlot>,
    active: HashSet<String>,
    dirty: HashSet<String>,
}

/// Owner of every slot on the server.
#[derive(Debug)]
pub struct SlotManager {
    dir: Option<PathBuf>,
    slots: Mutex<Slots>,
}

impl SlotManager {
    /// Slots that vanish with the process.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            slots: Mutex::new(Slots::default()),
        }
    }

    /// Load slots from `dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns a slot error if the directory or a slot file cannot be read.
    pub fn open(dir: &Path) -> ReplicationResult<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            ReplicationError::io(&format!("could not create directory \"{}\"", dir.display()), &e)
        })?;
        let entries = fs::read_dir(dir).map_err(|e| {
            ReplicationError::io(&format!("could not open directory \"{}\"", dir.display()), &e)
        })?;

        let mut slots = Slots::default();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path).map_err(|e| {
                ReplicationError::io(&format!("could not read file \"{}\"", path.display()), &e)
            })?;
            let slot: ReplicationSlot = serde_json::from_str(&content).map_err(|e| {
                ReplicationError::slot(format!(
                    "replication slot file \"{}\" is corrupt: {}",
                    path.display(),
                    e
                ))
            })?;
            if slot.persistency == SlotPersistency::Ephemeral {
                let _ = fs::remove_file(&path);
                continue;
            }
            slots.by_name.insert(slot.name.clone(), slot);
        }

        Ok(Self {
            dir: Some(dir.to_path_buf()),
            slots: Mutex::new(slots),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn slot_path(&self, name: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{}.json", name)))
    }

    fn write_slot(&self, slot: &ReplicationSlot) -> ReplicationResult<()> {
        let Some(path) = self.slot_path(&slot.name) else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(slot).map_err(|e| {
            ReplicationError::slot(format!("could not serialize slot \"{}\": {}", slot.name, e))
        })?;
        let tmp = path.with_extension("json.tmp");
        let mut file = File::create(&tmp).map_err(|e| {
            ReplicationError::io(&format!("could not create file \"{}\"", tmp.display()), &e)
        })?;
        file.write_all(json.as_bytes()).map_err(|e| {
            ReplicationError::io(&format!("could not write file \"{}\"", tmp.display()), &e)
        })?;
        file.sync_all().map_err(|e| {
            ReplicationError::io(&format!("could not fsync file \"{}\"", tmp.display()), &e)
        })?;
        fs::rename(&tmp, &path).map_err(|e| {
            ReplicationError::io(&format!("could not rename file \"{}\"", tmp.display()), &e)
        })
    }

    fn remove_file(&self, name: &str) -> ReplicationResult<()> {
        match self.slot_path(name) {
            Some(path) if path.exists() => fs::remove_file(&path).map_err(|e| {
                ReplicationError::io(&format!("could not remove file \"{}\"", path.display()), &e)
            }),
            _ => Ok(()),
        }
    }

    /// Create a slot. Persistent slots are written immediately.
    pub fn create(
        &self,
        name: &str,
        kind: SlotKind,
        persistency: SlotPersistency,
        restart_lsn: LogPosition,
    ) -> ReplicationResult<ReplicationSlot> {
        validate_slot_name(name)?;
        let slot = ReplicationSlot {
            name: name.to_string(),
            kind,
            persistency,
            restart_lsn,
            confirmed_flush: LogPosition::INVALID,
            xmin: 0,
        };
        {
            let mut slots = self.lock();
            if slots.by_name.contains_key(name) {
                return Err(ReplicationError::slot(format!(
                    "replication slot \"{}\" already exists",
                    name
                )));
            }
            slots.by_name.insert(name.to_string(), slot.clone());
        }
        if persistency == SlotPersistency::Persistent {
            if let Err(e) = self.write_slot(&slot) {
                self.lock().by_name.remove(name);
                return Err(e);
            }
        }
        let kind = if slot.is_logical() { "logical" } else { "physical" };
        log_event_with_fields(Event::SlotCreated, &[("slot", name), ("kind", kind)]);
        Ok(slot)
    }

    /// Turn an ephemeral slot into a persistent one.
    pub fn persist(&self, name: &str) -> ReplicationResult<()> {
        let slot = {
            let mut slots = self.lock();
            let slot = slots.by_name.get_mut(name).ok_or_else(|| not_found(name))?;
            slot.persistency = SlotPersistency::Persistent;
            slot.clone()
        };
        self.write_slot(&slot)
    }

    /// Drop a slot that no session is using.
    pub fn drop_slot(&self, name: &str) -> ReplicationResult<()> {
        {
            let mut slots = self.lock();
            if !slots.by_name.contains_key(name) {
                return Err(not_found(name));
            }
            if slots.active.contains(name) {
                return Err(ReplicationError::slot(format!(
                    "replication slot \"{}\" is active",
                    name
                )));
            }
            slots.by_name.remove(name);
            slots.dirty.remove(name);
        }
        self.remove_file(name)?;
        log_event_with_fields(Event::SlotDropped, &[("slot", name)]);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<ReplicationSlot> {
        self.lock().by_name.get(name).cloned()
    }

    pub fn list(&self) -> Vec<ReplicationSlot> {
        let mut all: Vec<_> = self.lock().by_name.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Mark a slot as in use by the calling session.
    pub fn acquire(&self, name: &str) -> ReplicationResult<ReplicationSlot> {
        let mut slots = self.lock();
        let slot = slots.by_name.get(name).cloned().ok_or_else(|| not_found(name))?;
        if !slots.active.insert(name.to_string()) {
            return Err(ReplicationError::slot(format!(
                "replication slot \"{}\" is already active",
                name
            )));
        }
        Ok(slot)
    }

    /// Give a slot back. Ephemeral slots are dropped, dirty ones saved.
    pub fn release(&self, name: &str) -> ReplicationResult<()> {
        let (ephemeral, dirty) = {
            let mut slots = self.lock();
            slots.active.remove(name);
            let dirty = slots.dirty.remove(name);
            let ephemeral = slots
                .by_name
                .get(name)
                .map(|s| s.persistency == SlotPersistency::Ephemeral)
                .unwrap_or(false);
            (ephemeral, dirty)
        };
        if ephemeral {
            self.drop_slot(name)
        } else if dirty {
            self.save(name)
        } else {
            Ok(())
        }
    }

    fn save(&self, name: &str) -> ReplicationResult<()> {
        let slot = self.get(name).ok_or_else(|| not_found(name))?;
        if slot.persistency == SlotPersistency::Persistent {
            self.write_slot(&slot)?;
        }
        Ok(())
    }

    /// Write every modified persistent slot.
    pub fn checkpoint(&self) -> ReplicationResult<()> {
        let names: Vec<String> = self.lock().dirty.drain().collect();
        for name in names {
            self.save(&name)?;
        }
        Ok(())
    }

    fn modify<F: FnOnce(&mut ReplicationSlot) -> bool>(&self, name: &str, f: F) -> bool {
        let mut slots = self.lock();
        let changed = match slots.by_name.get_mut(name) {
            Some(slot) => f(slot),
            None => false,
        };
        if changed {
            slots.dirty.insert(name.to_string());
        }
        changed
    }

    /// Advance a physical slot to the standby's flush position.
    ///
    /// A position exactly on a segment boundary is not recorded.
    pub fn confirm_physical(&self, name: &str, flush: LogPosition, segment_size: u64) -> bool {
        if !flush.is_valid() || flush.is_segment_boundary(segment_size) {
            return false;
        }
        self.modify(name, |slot| {
            if slot.restart_lsn != flush {
                slot.restart_lsn = flush;
                true
            } else {
                false
            }
        })
    }

    /// Advance a logical slot's confirmed position.
    pub fn confirm_logical(&self, name: &str, flush: LogPosition) -> bool {
        self.modify(name, |slot| {
            if flush > slot.confirmed_flush {
                slot.confirmed_flush = flush;
                true
            } else {
                false
            }
        })
    }

    /// Raise the slot xmin from hot-standby feedback.
    pub fn advance_xmin(&self, name: &str, xmin: u64) -> bool {
        if xmin == 0 {
            return false;
        }
        self.modify(name, |slot| {
            if slot.xmin == 0 || slot.xmin < xmin {
                slot.xmin = xmin;
                true
            } else {
                false
            }
        })
    }

    /// Oldest restart position over all slots, for log retention.
    pub fn required_position(&self) -> Option<LogPosition> {
        self.lock()
            .by_name
            .values()
            .map(|s| s.restart_lsn)
            .filter(|p| p.is_valid())
            .min()
    }
}

fn not_found(name: &str) -> ReplicationError {
    ReplicationError::slot(format!("replication slot \"{}\" does not exist", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SEG: u64 = 16 * 1024 * 1024;

    #[test]
    fn test_slot_name_rules() {
        assert!(validate_slot_name("standby_1").is_ok());
        assert!(validate_slot_name("").is_err());
        assert!(validate_slot_name("Upper").is_err());
        assert!(validate_slot_name("with-dash").is_err());
        assert!(validate_slot_name(&"a".repeat(65)).is_err());
        assert!(validate_slot_name(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn test_duplicate_create_fails() {
        let mgr = SlotManager::in_memory();
        mgr.create("s", SlotKind::Physical, SlotPersistency::Persistent, LogPosition::INVALID)
            .unwrap();
        let err = mgr
            .create("s", SlotKind::Physical, SlotPersistency::Persistent, LogPosition::INVALID)
            .unwrap_err();
        assert!(err.message.contains("already exists"));
    }

    #[test]
    fn test_physical_confirm_skips_segment_boundary() {
        let mgr = SlotManager::in_memory();
        mgr.create("s", SlotKind::Physical, SlotPersistency::Persistent, LogPosition::INVALID)
            .unwrap();
        assert!(!mgr.confirm_physical("s", LogPosition::new(SEG * 2), SEG));
        assert!(mgr.confirm_physical("s", LogPosition::new(SEG * 2 + 8), SEG));
        assert_eq!(mgr.get("s").unwrap().restart_lsn, LogPosition::new(SEG * 2 + 8));
        assert!(!mgr.confirm_physical("s", LogPosition::new(SEG * 2 + 8), SEG));
    }

    #[test]
    fn test_logical_confirm_only_moves_forward() {
        let mgr = SlotManager::in_memory();
        let kind = SlotKind::Logical {
            plugin: "raw".into(),
            database: None,
        };
        mgr.create("l", kind, SlotPersistency::Persistent, LogPosition::INVALID)
            .unwrap();
        assert!(mgr.confirm_logical("l", LogPosition::new(100)));
        assert!(!mgr.confirm_logical("l", LogPosition::new(50)));
        assert_eq!(mgr.get("l").unwrap().confirmed_flush, LogPosition::new(100));
    }

    #[test]
    fn test_xmin_advances_only() {
        let mgr = SlotManager::in_memory();
        mgr.create("s", SlotKind::Physical, SlotPersistency::Persistent, LogPosition::INVALID)
            .unwrap();
        assert!(mgr.advance_xmin("s", 10));
        assert!(!mgr.advance_xmin("s", 5));
        assert!(!mgr.advance_xmin("s", 0));
        assert_eq!(mgr.get("s").unwrap().xmin, 10);
    }

    #[test]
    fn test_active_slot_cannot_be_dropped_and_ephemeral_dies_on_release() {
        let mgr = SlotManager::in_memory();
        mgr.create("e", SlotKind::Physical, SlotPersistency::Ephemeral, LogPosition::INVALID)
            .unwrap();
        mgr.acquire("e").unwrap();
        assert!(mgr.acquire("e").is_err());
        assert!(mgr.drop_slot("e").is_err());
        mgr.release("e").unwrap();
        assert!(mgr.get("e").is_none());
    }

    #[test]
    fn test_persistent_slots_survive_reload() {
        let dir = TempDir::new().unwrap();
        {
            let mgr = SlotManager::open(dir.path()).unwrap();
            mgr.create("keep", SlotKind::Physical, SlotPersistency::Persistent, LogPosition::new(42))
                .unwrap();
            mgr.create("temp", SlotKind::Physical, SlotPersistency::Ephemeral, LogPosition::INVALID)
                .unwrap();
            mgr.confirm_physical("keep", LogPosition::new(4096), SEG);
            mgr.checkpoint().unwrap();
        }
        let mgr = SlotManager::open(dir.path()).unwrap();
        assert_eq!(mgr.get("keep").unwrap().restart_lsn, LogPosition::new(4096));
        assert!(mgr.get("temp").is_none());
        assert_eq!(mgr.required_position(), Some(LogPosition::new(4096)));
    }

    #[test]
    fn test_drop_removes_file() {
        let dir = TempDir::new().unwrap();
        let mgr = SlotManager::open(dir.path()).unwrap();
        mgr.create("gone", SlotKind::Physical, SlotPersistency::Persistent, LogPosition::INVALID)
            .unwrap();
        assert!(dir.path().join("gone.json").exists());
        mgr.drop_slot("gone").unwrap();
        assert!(!dir.path().join("gone.json").exists());
        assert!(mgr.drop_slot("gone").is_err());
    }
}
