use std::fmt;

use crate::item::ItemId;

/// Errors surfaced by tree mutation, registry lookup, and
/// (de)serialization. Fetch failures are NOT represented here — they are
/// per-layer status, never errors at the API boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeError {
    /// Item id not present in the arena.
    UnknownItem(ItemId),
    /// Operation requires group capability, item has none.
    NotAGroup(ItemId),
    /// Operation requires a layer.
    NotALayer(ItemId),
    /// Item has no parent group (detached), but the operation needs one.
    DetachedItem(ItemId),
    /// Child is already attached somewhere in the tree.
    AlreadyAttached(ItemId),
    /// Insert/move index out of bounds.
    IndexOutOfBounds { index: usize, len: usize },
    /// Moving the item under the given destination would make it its
    /// own ancestor.
    WouldCycle(ItemId),
    /// Layer class name missing from the registry during deserialization.
    UnknownLayerClass(String),
    /// Setting class name missing from the registry during deserialization.
    UnknownSettingClass(String),
    /// Layer has no setting under the given key.
    UnknownSettingKey(String),
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownItem(id) => write!(f, "unknown item: {id}"),
            Self::NotAGroup(id) => write!(f, "item {id} is not a group"),
            Self::NotALayer(id) => write!(f, "item {id} is not a layer"),
            Self::DetachedItem(id) => write!(f, "item {id} is detached from the tree"),
            Self::AlreadyAttached(id) => write!(f, "item {id} is already attached"),
            Self::IndexOutOfBounds { index, len } => {
                write!(f, "index {index} out of bounds (len {len})")
            }
            Self::WouldCycle(id) => write!(f, "moving item {id} there would create a cycle"),
            Self::UnknownLayerClass(name) => write!(f, "unregistered layer class: '{name}'"),
            Self::UnknownSettingClass(name) => write!(f, "unregistered setting class: '{name}'"),
            Self::UnknownSettingKey(name) => write!(f, "no setting with key '{name}'"),
        }
    }
}

impl std::error::Error for TreeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = TreeError::UnknownLayerClass("seismic".into());
        assert_eq!(err.to_string(), "unregistered layer class: 'seismic'");

        let err = TreeError::IndexOutOfBounds { index: 5, len: 2 };
        assert_eq!(err.to_string(), "index 5 out of bounds (len 2)");
    }
}
