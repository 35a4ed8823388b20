//! Tree items: the arena node type and the per-kind payloads.
//!
//! Items live in the root manager's arena keyed by [`ItemId`]; ids are
//! assigned monotonically and never reused, so a stale id held by a UI
//! binding or a pending completion simply misses instead of aliasing a
//! new item.

use std::fmt;

use serde::{Deserialize, Serialize};
use strata_protocol::SettingValue;

use crate::context::SettingsContext;
use crate::fetch::{DataProvider, Orchestrator};
use crate::setting::Setting;

/// Arena key for one tree item. Monotonic per manager, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity fields common to every item kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemIdentity {
    pub name: String,
    pub visible: bool,
    pub expanded: bool,
    /// Display color, e.g. "#1f77b4". Groups only; `None` elsewhere.
    pub color: Option<String>,
}

impl ItemIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visible: true,
            expanded: true,
            color: None,
        }
    }
}

/// Behavior variant of a group node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupKind {
    /// Plain visual container.
    View,
    /// Container whose shared-setting children govern descendants.
    SettingsGroup,
    /// Composite that derives a difference surface from two child
    /// layers; direct layer children are subordinated (they resolve
    /// settings but do not fetch for themselves).
    DeltaSurface,
}

/// Group payload: kind plus the ordered child list.
pub struct GroupData {
    pub kind: GroupKind,
    pub(crate) children: Vec<ItemId>,
}

impl GroupData {
    pub fn new(kind: GroupKind) -> Self {
        Self {
            kind,
            children: Vec::new(),
        }
    }

    pub fn children(&self) -> &[ItemId] {
        &self.children
    }
}

/// Layer payload: class tag, settings context, provider, fetch state.
pub struct LayerData {
    pub class: String,
    pub context: SettingsContext,
    pub provider: Box<dyn DataProvider>,
    pub orchestrator: Orchestrator,
}

/// Shared-setting payload: class tag plus the setting whose value is
/// intersected across sibling/descendant layers and pushed down as an
/// override.
pub struct SharedSettingData {
    pub class: String,
    pub setting: Setting,
    /// Layers currently overridden by this shared setting. Tracked so a
    /// recompute can withdraw overrides from layers that left the
    /// participant set.
    pub(crate) applied_to: Vec<ItemId>,
}

impl SharedSettingData {
    pub fn new(class: impl Into<String>, setting: Setting) -> Self {
        Self {
            class: class.into(),
            setting,
            applied_to: Vec::new(),
        }
    }
}

/// Color-scale payload: an opaque scale definition consumed by the
/// rendering side.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorScaleData {
    pub scale: serde_json::Value,
}

/// Kind-specific payload of an item.
pub enum ItemKind {
    Group(GroupData),
    Layer(LayerData),
    SharedSetting(SharedSettingData),
    ColorScale(ColorScaleData),
}

impl ItemKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ItemKind::Group(g) => match g.kind {
                GroupKind::View => "view",
                GroupKind::SettingsGroup => "settings-group",
                GroupKind::DeltaSurface => "delta-surface",
            },
            ItemKind::Layer(_) => "layer",
            ItemKind::SharedSetting(_) => "shared-setting",
            ItemKind::ColorScale(_) => "color-scale",
        }
    }
}

/// One arena node.
pub struct Item {
    pub(crate) id: ItemId,
    pub(crate) identity: ItemIdentity,
    pub(crate) parent: Option<ItemId>,
    /// Set while the item is reachable from the root. Mutating
    /// operations on detached items are rejected.
    pub(crate) attached: bool,
    pub(crate) kind: ItemKind,
}

impl Item {
    pub(crate) fn new(id: ItemId, identity: ItemIdentity, kind: ItemKind) -> Self {
        Self {
            id,
            identity,
            parent: None,
            attached: false,
            kind,
        }
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn is_visible(&self) -> bool {
        self.identity.visible
    }

    pub fn is_expanded(&self) -> bool {
        self.identity.expanded
    }

    pub fn color(&self) -> Option<&str> {
        self.identity.color.as_deref()
    }

    pub fn parent(&self) -> Option<ItemId> {
        self.parent
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn kind(&self) -> &ItemKind {
        &self.kind
    }

    pub fn as_group(&self) -> Option<&GroupData> {
        match &self.kind {
            ItemKind::Group(g) => Some(g),
            _ => None,
        }
    }

    pub(crate) fn as_group_mut(&mut self) -> Option<&mut GroupData> {
        match &mut self.kind {
            ItemKind::Group(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_layer(&self) -> Option<&LayerData> {
        match &self.kind {
            ItemKind::Layer(l) => Some(l),
            _ => None,
        }
    }

    pub(crate) fn as_layer_mut(&mut self) -> Option<&mut LayerData> {
        match &mut self.kind {
            ItemKind::Layer(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_shared_setting(&self) -> Option<&SharedSettingData> {
        match &self.kind {
            ItemKind::SharedSetting(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn as_shared_setting_mut(&mut self) -> Option<&mut SharedSettingData> {
        match &mut self.kind {
            ItemKind::SharedSetting(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_color_scale(&self) -> Option<&ColorScaleData> {
        match &self.kind {
            ItemKind::ColorScale(c) => Some(c),
            _ => None,
        }
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("id", &self.id)
            .field("name", &self.identity.name)
            .field("kind", &self.kind.kind_name())
            .field("parent", &self.parent)
            .field("attached", &self.attached)
            .finish()
    }
}
