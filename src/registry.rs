//! The module's property table.
//!
//! Each slot pairs a [`PropertyDef`] with its live value, kept in wire form:
//! big-endian bytes for integers, raw bytes for text and vectors. Writes are
//! validated per type and handed to the slot's [`Commit`] hook.

use crate::analog3::schema::{PropertyDef, ValueType};
use crate::error::{AppError, ErrorType, Result};
use crate::storage::Storage;

/// Change hook invoked with the final bytes of an accepted write.
pub trait Commit: Send {
    fn apply(&mut self, def: &PropertyDef, data: &[u8], storage: &mut dyn Storage) -> Result<()>;
}

/// Saves the value under the property's persist key, if it has one.
pub struct Persist;

impl Commit for Persist {
    fn apply(&mut self, def: &PropertyDef, data: &[u8], storage: &mut dyn Storage) -> Result<()> {
        match def.persist_key {
            Some(key) => storage.save(key, &to_persisted(def, data)),
            None => Ok(()),
        }
    }
}

/// Stored form of a value. Strings carry a length prefix, everything else is
/// kept as is.
fn to_persisted(def: &PropertyDef, data: &[u8]) -> Vec<u8> {
    match def.value_type {
        ValueType::Text => {
            let mut out = Vec::with_capacity(data.len() + 1);
            out.push(data.len() as u8);
            out.extend_from_slice(data);
            out
        }
        _ => data.to_vec(),
    }
}

fn from_persisted(def: &PropertyDef, raw: &[u8]) -> Option<Vec<u8>> {
    match def.value_type {
        ValueType::U8 | ValueType::U16 | ValueType::U32 => {
            let width = def.value_type.integer_width()?;
            (raw.len() == width).then(|| raw.to_vec())
        }
        ValueType::Text => {
            let (length, rest) = raw.split_first()?;
            let length = (*length as usize).min(rest.len()).min(def.max_length());
            Some(rest[..length].to_vec())
        }
        ValueType::VectorU8 => Some(raw[..raw.len().min(def.max_length())].to_vec()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Applied,
    Ignored,
}

struct Slot {
    def: PropertyDef,
    value: Vec<u8>,
    commit: Option<Box<dyn Commit>>,
}

pub struct Registry {
    slots: Vec<Slot>,
}

impl Registry {
    /// Builds the table in the given order. Writable properties get the
    /// [`Persist`] hook.
    pub fn new(defs: Vec<PropertyDef>) -> Result<Self> {
        let mut slots: Vec<Slot> = Vec::with_capacity(defs.len());
        for def in defs {
            if slots.iter().any(|slot| slot.def.id == def.id) {
                return Err(AppError::config(format!(
                    "Duplicate property id {} ({})",
                    def.id, def.name
                )));
            }
            let value = def.default_bytes()?;
            let commit: Option<Box<dyn Commit>> = if def.read_only {
                None
            } else {
                Some(Box::new(Persist))
            };
            slots.push(Slot { def, value, commit });
        }
        Ok(Self { slots })
    }

    /// Replaces the change hook of a property.
    pub fn set_commit(&mut self, id: u8, commit: Box<dyn Commit>) -> Result<()> {
        let slot = self.slot_mut(id)?;
        slot.commit = Some(commit);
        Ok(())
    }

    /// Restores persisted values. Cells that are absent or malformed keep the
    /// default.
    pub fn load_persisted(&mut self, storage: &dyn Storage) {
        for slot in self.slots.iter_mut() {
            let Some(key) = slot.def.persist_key else {
                continue;
            };
            let Some(raw) = storage.load(key) else {
                continue;
            };
            match from_persisted(&slot.def, &raw) {
                Some(value) => slot.value = value,
                None => log::warn!(
                    "Ignoring malformed stored value of ({}) {}: {}",
                    slot.def.id,
                    slot.def.name,
                    hex::encode(&raw)
                ),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Definition at a table position.
    pub fn def_at(&self, index: usize) -> Option<&PropertyDef> {
        self.slots.get(index).map(|slot| &slot.def)
    }

    pub fn def(&self, id: u8) -> Option<&PropertyDef> {
        self.slot(id).ok().map(|slot| &slot.def)
    }

    pub fn get(&self, id: u8) -> Result<(ValueType, Vec<u8>)> {
        let slot = self.slot(id)?;
        Ok((slot.def.value_type, slot.value.clone()))
    }

    /// Whether a remote write to `id` would be considered at all.
    pub fn is_writable(&self, id: u8) -> bool {
        self.slot(id).is_ok_and(|slot| !slot.def.read_only)
    }

    /// Applies a remote write. Unknown ids, read-only properties and values
    /// that do not fit the type are ignored.
    pub fn set(&mut self, id: u8, raw: &[u8], storage: &mut dyn Storage) -> SetOutcome {
        let slot = match self.writable_slot_mut(id) {
            Ok(slot) => slot,
            Err(e) => {
                log::warn!("Write ignored: {}", e);
                return SetOutcome::Ignored;
            }
        };
        let value = match normalize(&slot.def, raw) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Write to ({}) {} ignored: {}", id, slot.def.name, e);
                return SetOutcome::Ignored;
            }
        };
        log::info!(
            "Property ({}) {} set to {}",
            id,
            slot.def.name,
            slot.def.describe(&value)
        );
        slot.value = value;
        if let Some(commit) = slot.commit.as_mut() {
            if let Err(e) = commit.apply(&slot.def, &slot.value, storage) {
                log::warn!("Commit of ({}) {} failed: {}", id, slot.def.name, e);
            }
        }
        SetOutcome::Applied
    }

    /// Overwrites a live value owned by another component, bypassing access
    /// policy and the change hook.
    pub fn refresh(&mut self, id: u8, value: Vec<u8>) -> Result<()> {
        let slot = self.slot_mut(id)?;
        slot.value = value;
        Ok(())
    }

    fn writable_slot_mut(&mut self, id: u8) -> Result<&mut Slot> {
        let slot = self.slot_mut(id)?;
        if slot.def.read_only {
            return Err(AppError::new(
                ErrorType::A3ReadOnlyProperty,
                format!("({}) {} is read only", id, slot.def.name),
            ));
        }
        Ok(slot)
    }

    fn slot(&self, id: u8) -> Result<&Slot> {
        self.slots
            .iter()
            .find(|slot| slot.def.id == id)
            .ok_or_else(|| AppError::unknown_property(id))
    }

    fn slot_mut(&mut self, id: u8) -> Result<&mut Slot> {
        self.slots
            .iter_mut()
            .find(|slot| slot.def.id == id)
            .ok_or_else(|| AppError::unknown_property(id))
    }
}

/// Validates raw wire bytes against the property type and returns the value
/// to store.
fn normalize(def: &PropertyDef, raw: &[u8]) -> Result<Vec<u8>> {
    let value = match def.value_type {
        ValueType::U8 | ValueType::U16 | ValueType::U32 => {
            let width = def.value_type.integer_width().unwrap_or(0);
            if raw.len() != width {
                return Err(AppError::new(
                    ErrorType::A3InvalidValue,
                    format!("expected {} bytes, got {}", width, raw.len()),
                ));
            }
            raw.to_vec()
        }
        ValueType::Text => {
            let end = raw.iter().position(|c| *c == 0).unwrap_or(raw.len());
            raw[..end.min(def.max_length())].to_vec()
        }
        ValueType::VectorU8 => raw[..raw.len().min(def.max_length())].to_vec(),
    };
    if !def.accepts(&value) {
        return Err(AppError::new(
            ErrorType::A3InvalidValue,
            format!("value out of range: {}", hex::encode(&value)),
        ));
    }
    Ok(value)
}
