use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::analog3::{A3_MAX_CONFIG_DATA_LENGTH, PropertyId};
use crate::analog3::schema::{COMMON_PROPERTIES, DefaultValue, PropertyDef, ValueType};
use crate::error::{AppError, Result};
use crate::storage::{ADDR_GATE_TYPE, ADDR_KEY_ASSIGNMENT_MODE, ADDR_KEY_PRIORITY, ADDR_MIDI_CH_1};

pub const MODULE_TYPE_CV_DEPOT: u16 = 1;

/// Sign-in retry while no assignment arrives.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignInConfig {
    pub initial_interval_ms: u32,
    pub max_interval_ms: u32,
    pub max_attempts: u32,
    pub jitter_ms: u32,
}

impl Default for SignInConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 200,
            max_interval_ms: 3200,
            max_attempts: 8,
            jitter_ms: 50,
        }
    }
}

impl SignInConfig {
    /// Delay before retry number `attempt` (zero based), without jitter.
    pub fn backoff(&self, attempt: u32) -> u32 {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_interval_ms
            .saturating_mul(factor)
            .min(self.max_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    pub module_type: u16,
    pub module_type_name: String,
    /// Name written when the stored name is empty.
    pub default_name: String,
    pub frame_queue_capacity: usize,
    pub task_queue_capacity: usize,
    pub deferred_capacity: usize,
    pub session_idle_timeout_ms: u32,
    pub sign_in: SignInConfig,
    /// Seed for the UID generator. Entropy is used when absent.
    pub seed: Option<u64>,
    /// YAML file backing nonvolatile storage. Memory only when absent.
    pub storage_path: Option<PathBuf>,
    /// Module specific properties, appended after the common ones.
    pub properties: Vec<PropertyDef>,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            module_type: MODULE_TYPE_CV_DEPOT,
            module_type_name: "cv-depot".to_string(),
            default_name: "cv-depot".to_string(),
            frame_queue_capacity: 8,
            task_queue_capacity: 8,
            deferred_capacity: 8,
            session_idle_timeout_ms: 2000,
            sign_in: SignInConfig::default(),
            seed: None,
            storage_path: None,
            properties: cv_depot_properties(),
        }
    }
}

fn cv_depot_properties() -> Vec<PropertyDef> {
    vec![
        PropertyDef::new(3, "num_voices", ValueType::U8).with_default(DefaultValue::Number(2)),
        PropertyDef::new(4, "key_assignment_mode", ValueType::U8)
            .with_enum(&["DUOPHONIC", "UNISON", "PARALLEL"])
            .persisted_at(ADDR_KEY_ASSIGNMENT_MODE),
        PropertyDef::new(5, "key_priority", ValueType::U8)
            .with_enum(&["LATER", "HIGH", "LOW"])
            .persisted_at(ADDR_KEY_PRIORITY),
        PropertyDef::new(6, "midi_channels", ValueType::VectorU8)
            .with_capacity(2)
            .persisted_at(ADDR_MIDI_CH_1)
            .with_default(DefaultValue::Bytes(vec![0, 1])),
        PropertyDef::new(7, "gate_type", ValueType::U8)
            .with_enum(&["VELOCITY", "LEGACY"])
            .persisted_at(ADDR_GATE_TYPE),
    ]
}

impl ModuleConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| AppError::config(format!("File read error in {:?}: {}", path, e)))?;
        let config = serde_yaml::from_str::<ModuleConfig>(&content)
            .map_err(|e| AppError::config(format!("YAML parse error in {:?}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    /// The full property table: common properties followed by the module's own.
    pub fn property_table(&self) -> Vec<PropertyDef> {
        let mut table: Vec<PropertyDef> = COMMON_PROPERTIES
            .iter()
            .cloned()
            .map(|def| {
                if def.id == u8::from(PropertyId::ModuleType) {
                    def.with_default(DefaultValue::Number(self.module_type as u32))
                } else {
                    def
                }
            })
            .collect();
        table.extend(self.properties.iter().cloned());
        table
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_queue_capacity == 0
            || self.task_queue_capacity == 0
            || self.deferred_capacity == 0
        {
            return Err(AppError::config("Queue capacities must be positive".to_string()));
        }
        if self.default_name.len() >= A3_MAX_CONFIG_DATA_LENGTH {
            return Err(AppError::config(format!(
                "Default name is too long: {}",
                self.default_name
            )));
        }
        if self.sign_in.initial_interval_ms == 0 {
            return Err(AppError::config("Sign-in interval must be positive".to_string()));
        }
        let table = self.property_table();
        if table.len() > u8::MAX as usize {
            return Err(AppError::config(format!("Too many properties: {}", table.len())));
        }
        let mut ids = BTreeSet::new();
        for def in &table {
            if !ids.insert(def.id) {
                return Err(AppError::config(format!(
                    "Duplicate property id {} ({})",
                    def.id, def.name
                )));
            }
            if let Some(capacity) = def.capacity {
                if capacity == 0 || capacity as usize > A3_MAX_CONFIG_DATA_LENGTH {
                    return Err(AppError::config(format!(
                        "Capacity of ({}) {} must be within 1..={}",
                        def.id, def.name, A3_MAX_CONFIG_DATA_LENGTH
                    )));
                }
            }
            let default = def.default_bytes()?;
            if !def.accepts(&default) {
                return Err(AppError::config(format!(
                    "Default of ({}) {} is out of enum range",
                    def.id, def.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_cv_depot() {
        let config = ModuleConfig::default();
        config.validate().unwrap();
        let table = config.property_table();
        assert_eq!(table.len(), 8);
        assert_eq!(table[1].id, u8::from(PropertyId::ModuleType));
        assert_eq!(table[1].default_bytes().unwrap(), vec![0x00, 0x01]);
        assert_eq!(table[6].name, "midi_channels");
        assert_eq!(table[6].max_length(), 2);
    }

    #[test]
    fn test_load_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("module.yaml");
        fs::write(
            &path,
            "
module_type: 9
module_type_name: test-module
default_name: tester
session_idle_timeout_ms: 500
sign_in:
  max_attempts: 3
seed: 42
properties:
  - id: 3
    name: mode
    value_type: u8
    enum: [A, B]
    persist_key: 64
  - id: 4
    name: steps
    value_type: vector_u8
    capacity: 16
",
        )
        .unwrap();
        let config = ModuleConfig::load(&path).unwrap();
        assert_eq!(config.module_type, 9);
        assert_eq!(config.default_name, "tester");
        assert_eq!(config.session_idle_timeout_ms, 500);
        assert_eq!(config.sign_in.max_attempts, 3);
        assert_eq!(config.sign_in.initial_interval_ms, 200);
        assert_eq!(config.frame_queue_capacity, 8);
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.properties.len(), 2);
        assert_eq!(config.properties[0].persist_key, Some(0x40));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut config = ModuleConfig::default();
        config.properties.push(PropertyDef::new(2, "shadow", ValueType::U8));
        let Err(e) = config.validate() else {
            panic!("duplicate id must be rejected");
        };
        assert!(e.message.contains("Duplicate"));
    }

    #[test]
    fn test_oversized_capacity_rejected() {
        let mut config = ModuleConfig::default();
        config
            .properties
            .push(PropertyDef::new(9, "big", ValueType::VectorU8).with_capacity(65));
        assert!(config.validate().is_err());

        let mut config = ModuleConfig::default();
        config
            .properties
            .push(PropertyDef::new(9, "none", ValueType::VectorU8).with_capacity(0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_deferred_capacity_rejected() {
        let mut config = ModuleConfig::default();
        config.deferred_capacity = 0;
        let Err(e) = config.validate() else {
            panic!("an empty deferred queue must be rejected");
        };
        assert_eq!(e.error_type, crate::error::ErrorType::ConfigError);
    }

    #[test]
    fn test_backoff() {
        let sign_in = SignInConfig::default();
        assert_eq!(sign_in.backoff(0), 200);
        assert_eq!(sign_in.backoff(2), 800);
        assert_eq!(sign_in.backoff(5), 3200);
        assert_eq!(sign_in.backoff(40), 3200);
    }
}
