use lazy_static::lazy_static;
use serde::Deserialize;

use super::{A3_MAX_CONFIG_DATA_LENGTH, PropertyId};
use crate::error::{AppError, ErrorType, Result};
use crate::storage::{ADDR_MODULE_UID, ADDR_NAME, StorageKey};

/// Analog3 module configuration value types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    U8,
    U16,
    U32,
    Text,
    VectorU8,
}

impl ValueType {
    /// Byte width of integer types, None for variable length types.
    pub fn integer_width(&self) -> Option<usize> {
        match self {
            ValueType::U8 => Some(1),
            ValueType::U16 => Some(2),
            ValueType::U32 => Some(4),
            ValueType::Text | ValueType::VectorU8 => None,
        }
    }

    pub fn to_hex(&self, data: &[u8]) -> String {
        match self {
            ValueType::U8 | ValueType::U16 | ValueType::U32 => hex::encode(data),
            ValueType::Text => String::from_utf8_lossy(data).to_string(),
            ValueType::VectorU8 => data
                .iter()
                .map(|val| format!("{:02x}", val))
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// Initial value of a property, used when nothing is persisted for it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum DefaultValue {
    Number(u32),
    Text(String),
    Bytes(Vec<u8>),
}

/// Property schema
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PropertyDef {
    pub id: u8,
    pub name: String,
    pub value_type: ValueType,
    #[serde(rename = "enum")]
    pub enum_names: Option<Vec<String>>,
    #[serde(default)]
    pub read_only: bool,
    pub persist_key: Option<StorageKey>,
    /// Maximum number of elements for vector properties.
    pub capacity: Option<u8>,
    pub default: Option<DefaultValue>,
}

impl PropertyDef {
    pub fn new(id: u8, name: &str, value_type: ValueType) -> Self {
        Self {
            id,
            name: name.to_string(),
            value_type,
            enum_names: None,
            read_only: false,
            persist_key: None,
            capacity: None,
            default: None,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn persisted_at(mut self, key: StorageKey) -> Self {
        self.persist_key = Some(key);
        self
    }

    pub fn with_enum(mut self, names: &[&str]) -> Self {
        self.enum_names = Some(names.iter().map(|name| name.to_string()).collect());
        self
    }

    pub fn with_capacity(mut self, capacity: u8) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_default(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }

    /// Maximum number of value bytes the property can hold.
    pub fn max_length(&self) -> usize {
        match self.value_type {
            ValueType::U8 | ValueType::U16 | ValueType::U32 => {
                self.value_type.integer_width().unwrap_or(0)
            }
            // one byte is reserved for the local terminator
            ValueType::Text => A3_MAX_CONFIG_DATA_LENGTH - 1,
            ValueType::VectorU8 => match self.capacity {
                Some(capacity) => (capacity as usize).min(A3_MAX_CONFIG_DATA_LENGTH),
                None => A3_MAX_CONFIG_DATA_LENGTH,
            },
        }
    }

    /// Serialized form of the default value. Integers are big-endian.
    pub fn default_bytes(&self) -> Result<Vec<u8>> {
        let bytes = match (&self.default, self.value_type) {
            (None, ValueType::Text) | (None, ValueType::VectorU8) => Vec::new(),
            (None, value_type) => vec![0; value_type.integer_width().unwrap_or(0)],
            (Some(DefaultValue::Number(value)), ValueType::U8) => {
                let Ok(value) = u8::try_from(*value) else {
                    return Err(self.invalid_default());
                };
                vec![value]
            }
            (Some(DefaultValue::Number(value)), ValueType::U16) => {
                let Ok(value) = u16::try_from(*value) else {
                    return Err(self.invalid_default());
                };
                value.to_be_bytes().to_vec()
            }
            (Some(DefaultValue::Number(value)), ValueType::U32) => value.to_be_bytes().to_vec(),
            (Some(DefaultValue::Text(value)), ValueType::Text) => value.as_bytes().to_vec(),
            (Some(DefaultValue::Bytes(value)), ValueType::VectorU8) => value.clone(),
            _ => return Err(self.invalid_default()),
        };
        if bytes.len() > self.max_length() {
            return Err(self.invalid_default());
        }
        Ok(bytes)
    }

    /// Checks an enum-typed value against its names. Always true for plain properties.
    pub fn accepts(&self, data: &[u8]) -> bool {
        let Some(enum_names) = &self.enum_names else {
            return true;
        };
        match self.value_type {
            ValueType::U8 | ValueType::VectorU8 => {
                data.iter().all(|value| (*value as usize) < enum_names.len())
            }
            _ => true,
        }
    }

    /// Human readable rendering of a serialized value, used in logs.
    pub fn describe(&self, data: &[u8]) -> String {
        match &self.enum_names {
            Some(enum_names) => data
                .iter()
                .map(|value| match enum_names.get(*value as usize) {
                    Some(name) => format!("{} ({})", name, value),
                    None => "VALUE_OUT_OF_ENUM_RANGE".to_string(),
                })
                .collect::<Vec<_>>()
                .join(", "),
            None => self.value_type.to_hex(data),
        }
    }

    fn invalid_default(&self) -> AppError {
        AppError::new(
            ErrorType::ConfigError,
            format!(
                "Invalid default for property ({}) {}: {:?}",
                self.id, self.name, self.default
            ),
        )
    }
}

lazy_static! {
    pub static ref COMMON_PROPERTIES: Vec<PropertyDef> = vec![
        PropertyDef::new(PropertyId::ModuleUid.into(), "module_uid", ValueType::U32)
            .read_only()
            .persisted_at(ADDR_MODULE_UID),
        PropertyDef::new(PropertyId::ModuleType.into(), "module_type", ValueType::U16).read_only(),
        PropertyDef::new(PropertyId::Name.into(), "name", ValueType::Text).persisted_at(ADDR_NAME),
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_properties() {
        assert_eq!(COMMON_PROPERTIES.len(), 3);
        let uid = &COMMON_PROPERTIES[0];
        assert_eq!(uid.id, 0);
        assert_eq!(uid.name, "module_uid");
        assert_eq!(uid.value_type, ValueType::U32);
        assert!(uid.read_only);
        let name = &COMMON_PROPERTIES[2];
        assert_eq!(name.value_type, ValueType::Text);
        assert!(!name.read_only);
        assert_eq!(name.max_length(), 63);
    }

    #[test]
    fn test_parse_property_def() {
        let yaml = "
id: 4
name: key_assignment_mode
value_type: u8
enum: [DUOPHONIC, UNISON, PARALLEL]
persist_key: 10
default: 1
";
        let def: PropertyDef = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.id, 4);
        assert_eq!(def.value_type, ValueType::U8);
        assert!(!def.read_only);
        assert_eq!(def.persist_key, Some(0x0a));
        assert_eq!(def.default_bytes().unwrap(), vec![1]);
        assert!(def.accepts(&[2]));
        assert!(!def.accepts(&[3]));
        assert_eq!(def.describe(&[1]), "UNISON (1)");
    }

    #[test]
    fn test_default_bytes() {
        let def = PropertyDef::new(8, "depth", ValueType::U16).with_default(DefaultValue::Number(0x1234));
        assert_eq!(def.default_bytes().unwrap(), vec![0x12, 0x34]);

        let def = PropertyDef::new(8, "depth", ValueType::U8).with_default(DefaultValue::Number(256));
        assert!(def.default_bytes().is_err());

        let def = PropertyDef::new(6, "channels", ValueType::VectorU8)
            .with_capacity(2)
            .with_default(DefaultValue::Bytes(vec![0, 1, 2]));
        assert!(def.default_bytes().is_err());

        let def = PropertyDef::new(9, "flag", ValueType::U32);
        assert_eq!(def.default_bytes().unwrap(), vec![0, 0, 0, 0]);
    }
}
