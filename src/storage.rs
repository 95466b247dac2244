//! Nonvolatile byte storage.
//!
//! Keys are the EEPROM addresses the cv-depot firmware uses. Multi-byte
//! encoding is up to the caller; the store keeps opaque byte strings.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

pub type StorageKey = u16;

pub const ADDR_MIDI_CH_1: StorageKey = 0x08;
pub const ADDR_KEY_ASSIGNMENT_MODE: StorageKey = 0x0a;
pub const ADDR_KEY_PRIORITY: StorageKey = 0x0b;
pub const ADDR_MODULE_UID: StorageKey = 0x1c;
pub const ADDR_NAME: StorageKey = 0x20;
pub const ADDR_GATE_TYPE: StorageKey = 0x60;

pub trait Storage {
    fn load(&self, key: StorageKey) -> Option<Vec<u8>>;
    fn save(&mut self, key: StorageKey, data: &[u8]) -> Result<()>;
}

/// Volatile store, used by tests and when no storage path is configured.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    cells: BTreeMap<StorageKey, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn load(&self, key: StorageKey) -> Option<Vec<u8>> {
        self.cells.get(&key).cloned()
    }

    fn save(&mut self, key: StorageKey, data: &[u8]) -> Result<()> {
        self.cells.insert(key, data.to_vec());
        Ok(())
    }
}

/// Store backed by a YAML file mapping keys to hex strings.
///
/// The whole file is rewritten on every save, which is fine for the handful of
/// cells a module persists.
pub struct FileStorage {
    path: PathBuf,
    cells: BTreeMap<StorageKey, String>,
}

impl FileStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let cells = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| {
                AppError::storage(format!("File read error in {:?}: {}", path, e))
            })?;
            serde_yaml::from_str::<Option<BTreeMap<StorageKey, String>>>(&content)
                .map_err(|e| AppError::storage(format!("YAML parse error in {:?}: {}", path, e)))?
                .unwrap_or_default()
        } else {
            BTreeMap::new()
        };
        log::debug!("Storage opened; path={:?}, cells={}", path, cells.len());
        Ok(Self { path, cells })
    }

    fn flush(&self) -> Result<()> {
        let content = serde_yaml::to_string(&self.cells)
            .map_err(|e| AppError::storage(format!("YAML encode error: {}", e)))?;
        fs::write(&self.path, content)
            .map_err(|e| AppError::storage(format!("File write error in {:?}: {}", self.path, e)))
    }
}

impl Storage for FileStorage {
    fn load(&self, key: StorageKey) -> Option<Vec<u8>> {
        let cell = self.cells.get(&key)?;
        match hex::decode(cell) {
            Ok(data) => Some(data),
            Err(e) => {
                log::warn!("Corrupted storage cell {:02x}: {}", key, e);
                None
            }
        }
    }

    fn save(&mut self, key: StorageKey, data: &[u8]) -> Result<()> {
        self.cells.insert(key, hex::encode(data));
        self.flush()
    }
}
