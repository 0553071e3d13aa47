//! Persisted name tables
//!
//! `CheckboxCatalog` maps a guessed file name (a cleaned checkbox label) to
//! the checkbox id on the study-data page. `ChannelMapping` maps the same
//! guessed names to the file names the portal actually delivers. Both are
//! flat JSON objects loaded read-only.

use crate::error::{PpmiError, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

fn load_flat_json(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        PpmiError::name_resolution(path.display().to_string(), format!("cannot read table: {}", e))
    })?;
    parse_flat_json(&content).map_err(|reason| {
        PpmiError::name_resolution(path.display().to_string(), reason)
    })
}

fn parse_flat_json(content: &str) -> std::result::Result<BTreeMap<String, String>, String> {
    serde_json::from_str(content)
        .map_err(|e| format!("not a flat JSON object of strings: {}", e))
}

/// Write a table as a pretty-printed flat JSON object.
pub fn write_table(path: &Path, table: &BTreeMap<String, String>) -> Result<()> {
    let content = serde_json::to_string_pretty(table)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Guessed label -> real file name, with its derived reverse table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelMapping {
    guessed_to_real: BTreeMap<String, String>,
    real_to_guessed: HashMap<String, String>,
}

impl ChannelMapping {
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_map(load_flat_json(path)?)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let map = parse_flat_json(content)
            .map_err(|reason| PpmiError::name_resolution("<mapping>", reason))?;
        Self::from_map(map)
    }

    /// Build from a table, rejecting two guessed names pointing at one real name.
    pub fn from_map(guessed_to_real: BTreeMap<String, String>) -> Result<Self> {
        let mut real_to_guessed = HashMap::with_capacity(guessed_to_real.len());
        for (guessed, real) in &guessed_to_real {
            if let Some(previous) = real_to_guessed.insert(real.clone(), guessed.clone()) {
                return Err(PpmiError::name_resolution(
                    real.clone(),
                    format!(
                        "mapping is malformed: both '{}' and '{}' map to it",
                        previous, guessed
                    ),
                ));
            }
        }
        Ok(Self {
            guessed_to_real,
            real_to_guessed,
        })
    }

    pub fn real_name(&self, guessed: &str) -> Option<&str> {
        self.guessed_to_real.get(guessed).map(String::as_str)
    }

    pub fn guessed_name(&self, real: &str) -> Option<&str> {
        self.real_to_guessed.get(real).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.guessed_to_real.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guessed_to_real.is_empty()
    }
}

/// Guessed file name -> checkbox id on the study-data page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckboxCatalog {
    ids: BTreeMap<String, String>,
}

impl CheckboxCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self {
            ids: load_flat_json(path)?,
        })
    }

    pub fn from_map(ids: BTreeMap<String, String>) -> Self {
        Self { ids }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ids.keys().map(String::as_str)
    }

    /// Checkbox id for `identifier`, given either as a guessed name or as a
    /// real file name known to `mapping`.
    pub fn resolve(&self, identifier: &str, mapping: &ChannelMapping) -> Result<String> {
        if let Some(id) = self.ids.get(identifier) {
            return Ok(id.clone());
        }
        let guessed = mapping.guessed_name(identifier).ok_or_else(|| {
            PpmiError::name_resolution(identifier, "unsupported file name")
        })?;
        self.ids.get(guessed).cloned().ok_or_else(|| {
            PpmiError::name_resolution(
                identifier,
                format!("maps to '{}' which has no checkbox", guessed),
            )
        })
    }

    /// Resolve every identifier, failing on the first unknown one.
    pub fn resolve_all(&self, identifiers: &[String], mapping: &ChannelMapping) -> Result<Vec<String>> {
        identifiers
            .iter()
            .map(|identifier| self.resolve(identifier, mapping))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
