//! Property lookup tables built from discovery data.
//!
//! The name → id mapping is not consistent across devices, so each
//! object caches its own table (and the enum name → value maps of its
//! enum properties) at discovery time.

use std::collections::HashMap;

use crate::control::{PropInfo, PropertyId};
use crate::error::Error;

#[derive(Debug, Default, Clone)]
pub(crate) struct PropTable {
    by_name: HashMap<String, PropertyId>,
    enums: HashMap<PropertyId, Vec<(String, u64)>>,
    initial: HashMap<PropertyId, u64>,
}

impl PropTable {
    pub(crate) fn from_props(props: &[PropInfo]) -> Self {
        let mut table = PropTable::default();
        for prop in props {
            table.by_name.insert(prop.name.clone(), prop.id);
            table.initial.insert(prop.id, prop.value);
            if !prop.enum_values.is_empty() {
                table.enums.insert(prop.id, prop.enum_values.clone());
            }
        }
        table
    }

    pub(crate) fn get(&self, name: &str) -> Option<PropertyId> {
        self.by_name.get(name).copied()
    }

    pub(crate) fn require(&self, object: u32, name: &'static str) -> Result<PropertyId, Error> {
        self.get(name).ok_or(Error::MissingProperty { object, name })
    }

    pub(crate) fn initial_value(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(|id| self.initial.get(&id).copied())
    }

    pub(crate) fn enum_values(&self, name: &str) -> Option<&[(String, u64)]> {
        self.get(name)
            .and_then(|id| self.enums.get(&id))
            .map(|v| v.as_slice())
    }

    /// Value of an enum entry by name, e.g. the "Enabled" entry of
    /// "privacy-screen sw-state".
    pub(crate) fn enum_value(&self, prop: &str, entry: &str) -> Option<u64> {
        self.enum_values(prop)?
            .iter()
            .find(|(name, _)| name == entry)
            .map(|(_, value)| *value)
    }
}
