//! JSON-file Persistent Store. The whole table is rewritten on every change
//! (temp file + rename), which is fine for the handful of beacons a host runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use beacon_core::{ActiveState, BeaconDefinition, PersistentStore, StoreError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Table {
    next_id: u64,
    beacons: BTreeMap<u64, BeaconDefinition>,
}

pub struct JsonFileStore {
    path: PathBuf,
    table: Table,
}

impl JsonFileStore {
    /// Open `path`, starting empty if it does not exist yet.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let table = match std::fs::read_to_string(path) {
            Ok(s) => serde_json::from_str(&s).map_err(backend)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Table::default(),
            Err(e) => return Err(backend(e)),
        };
        Ok(Self {
            path: path.to_path_buf(),
            table,
        })
    }

    /// Write `table` to disk, then adopt it. Memory is untouched on failure.
    fn commit(&mut self, table: Table) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(backend)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(&table).map_err(backend)?;
        std::fs::write(&tmp, body).map_err(backend)?;
        std::fs::rename(&tmp, &self.path).map_err(backend)?;
        self.table = table;
        Ok(())
    }
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl PersistentStore for JsonFileStore {
    fn insert(&mut self, definition: &BeaconDefinition) -> Result<u64, StoreError> {
        let mut table = self.table.clone();
        table.next_id += 1;
        let id = table.next_id;
        let mut row = definition.clone();
        row.assign_id(id);
        table.beacons.insert(id, row);
        self.commit(table)?;
        Ok(id)
    }

    fn update(&mut self, definition: &BeaconDefinition) -> Result<(), StoreError> {
        let mut table = self.table.clone();
        let row = table
            .beacons
            .get_mut(&definition.id())
            .ok_or(StoreError::NotFound(definition.id()))?;
        *row = definition.clone();
        self.commit(table)
    }

    fn delete(&mut self, id: u64) -> Result<(), StoreError> {
        let mut table = self.table.clone();
        if table.beacons.remove(&id).is_some() {
            self.commit(table)?;
        }
        Ok(())
    }

    fn load_all(&self, active_only: bool) -> Result<Vec<BeaconDefinition>, StoreError> {
        Ok(self
            .table
            .beacons
            .values()
            .filter(|d| !active_only || d.active_state != ActiveState::Stopped)
            .cloned()
            .collect())
    }

    fn load(&self, id: u64) -> Result<Option<BeaconDefinition>, StoreError> {
        Ok(self.table.beacons.get(&id).cloned())
    }
}
