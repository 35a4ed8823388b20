//! Strata Persisted Document — v1 Frozen Format
//!
//! This crate defines the canonical on-disk shape of a workbench item
//! tree. The format is JSON and **frozen at v1**: changes require a
//! version bump in `DOCUMENT_VERSION` and backward-compatibility
//! handling in the engine's deserializer.
//!
//! The document is a recursive tagged union: groups carry `children`,
//! layers carry a `class` tag plus their serialized settings, shared
//! settings carry the wrapped setting's `class` tag plus its value.
//!
//! # Usage
//!
//! ```ignore
//! use strata_protocol::{PersistedDocument, SerializedItem};
//!
//! let doc: PersistedDocument = serde_json::from_str(&text)?;
//! let json = serde_json::to_string_pretty(&doc)?;
//! ```

use std::collections::BTreeMap;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// Current document version. Increment for breaking changes.
pub const DOCUMENT_VERSION: u32 = 1;

// =============================================================================
// Setting values
// =============================================================================

/// A single setting value.
///
/// This is the unit of deep equality throughout the engine: two values
/// compare equal iff they would serialize identically. Floats use
/// `OrderedFloat` so the type has total `Eq` and `Hash`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    /// Unset / no valid value.
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat<f64>),
    Text(String),
    List(Vec<SettingValue>),
}

impl SettingValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SettingValue::Null)
    }

    /// Text contents, if this is a `Text` value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SettingValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            SettingValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            SettingValue::Float(f) => Some(f.into_inner()),
            SettingValue::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for SettingValue {
    fn from(s: &str) -> Self {
        SettingValue::Text(s.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(s: String) -> Self {
        SettingValue::Text(s)
    }
}

impl From<i64> for SettingValue {
    fn from(n: i64) -> Self {
        SettingValue::Int(n)
    }
}

impl From<f64> for SettingValue {
    fn from(f: f64) -> Self {
        SettingValue::Float(OrderedFloat(f))
    }
}

impl From<bool> for SettingValue {
    fn from(b: bool) -> Self {
        SettingValue::Bool(b)
    }
}

// =============================================================================
// Serialized items
// =============================================================================

/// One node of the persisted item tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SerializedItem {
    View(SerializedGroup),
    SettingsGroup(SerializedGroup),
    DeltaSurface(SerializedGroup),
    Layer(SerializedLayer),
    SharedSetting(SerializedSharedSetting),
    ColorScale(SerializedColorScale),
}

impl SerializedItem {
    /// Stable item id, regardless of variant.
    pub fn id(&self) -> u64 {
        match self {
            SerializedItem::View(g)
            | SerializedItem::SettingsGroup(g)
            | SerializedItem::DeltaSurface(g) => g.id,
            SerializedItem::Layer(l) => l.id,
            SerializedItem::SharedSetting(s) => s.id,
            SerializedItem::ColorScale(c) => c.id,
        }
    }

    /// Display name, regardless of variant.
    pub fn name(&self) -> &str {
        match self {
            SerializedItem::View(g)
            | SerializedItem::SettingsGroup(g)
            | SerializedItem::DeltaSurface(g) => &g.name,
            SerializedItem::Layer(l) => &l.name,
            SerializedItem::SharedSetting(s) => &s.name,
            SerializedItem::ColorScale(c) => &c.name,
        }
    }
}

/// A group-capability item: view, settings group, or delta surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedGroup {
    pub id: u64,
    pub name: String,
    pub visible: bool,
    pub expanded: bool,
    /// Display color, e.g. "#1f77b4". Absent on items with no color.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub children: Vec<SerializedItem>,
}

/// A data layer: class tag plus its serialized settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedLayer {
    pub id: u64,
    pub name: String,
    pub visible: bool,
    pub expanded: bool,
    /// Registered layer class name. Lookup key for reconstruction.
    pub class: String,
    /// Setting key tag -> stored value. BTreeMap for stable output.
    #[serde(default)]
    pub settings: BTreeMap<String, SettingValue>,
}

/// A shared setting: wrapped setting class tag plus its value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedSharedSetting {
    pub id: u64,
    pub name: String,
    pub visible: bool,
    pub expanded: bool,
    /// Registered setting class name. Lookup key for reconstruction.
    pub class: String,
    pub value: SettingValue,
}

/// A color scale item. The scale definition itself is owned by the
/// visualization layer and carried opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedColorScale {
    pub id: u64,
    pub name: String,
    pub visible: bool,
    pub expanded: bool,
    pub scale: serde_json::Value,
}

/// Top-level persisted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedDocument {
    #[serde(default = "default_document_version")]
    pub version: u32,
    pub items: Vec<SerializedItem>,
}

fn default_document_version() -> u32 {
    1
}

impl PersistedDocument {
    pub fn new(items: Vec<SerializedItem>) -> Self {
        Self {
            version: DOCUMENT_VERSION,
            items,
        }
    }
}
