//! Settings: typed value slots with an available-value set and an
//! optional override.
//!
//! A setting's *effective* value is the override when present, else the
//! plain value. Writes are gated on deep equality so that no-op writes
//! produce zero notifications.

use std::fmt;

use serde::{Deserialize, Serialize};
use strata_protocol::SettingValue;

/// Identity of one configurable slot within a layer.
///
/// A closed enum rather than free-form strings: the original system
/// keyed settings by string tags returned from each setting class,
/// which allowed mis-tagged classes to alias each other's keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingKey {
    Ensemble,
    Realization,
    Attribute,
    SurfaceName,
    TimePoint,
    StatisticFunction,
    GridLines,
    Sensitivity,
    ColorScale,
}

impl SettingKey {
    pub const ALL: [SettingKey; 9] = [
        SettingKey::Ensemble,
        SettingKey::Realization,
        SettingKey::Attribute,
        SettingKey::SurfaceName,
        SettingKey::TimePoint,
        SettingKey::StatisticFunction,
        SettingKey::GridLines,
        SettingKey::Sensitivity,
        SettingKey::ColorScale,
    ];

    /// Stable string tag used in persisted documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::Ensemble => "ensemble",
            SettingKey::Realization => "realization",
            SettingKey::Attribute => "attribute",
            SettingKey::SurfaceName => "surface_name",
            SettingKey::TimePoint => "time_point",
            SettingKey::StatisticFunction => "statistic_function",
            SettingKey::GridLines => "grid_lines",
            SettingKey::Sensitivity => "sensitivity",
            SettingKey::ColorScale => "color_scale",
        }
    }

    /// Inverse of [`SettingKey::as_str`].
    pub fn parse(tag: &str) -> Option<SettingKey> {
        Self::ALL.iter().copied().find(|k| k.as_str() == tag)
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configurable, observable value slot.
///
/// Field semantics:
/// - `available`: the legal value set, order-significant. Empty means
///   "unknown / not yet loaded", not "nothing is legal".
/// - `overridden`: injected by a shared setting; takes precedence for
///   all readers while the underlying `value` is preserved beneath it.
/// - `loading`: an upstream helper dependency is still resolving.
/// - `persisted`: the value was restored from a document and has not
///   yet been confirmed against a loaded available set.
#[derive(Debug, Clone, PartialEq)]
pub struct Setting {
    key: SettingKey,
    value: SettingValue,
    available: Vec<SettingValue>,
    overridden: Option<SettingValue>,
    loading: bool,
    persisted: bool,
}

impl Setting {
    pub fn new(key: SettingKey) -> Self {
        Self {
            key,
            value: SettingValue::Null,
            available: Vec::new(),
            overridden: None,
            loading: false,
            persisted: false,
        }
    }

    pub fn with_value(key: SettingKey, value: impl Into<SettingValue>) -> Self {
        let mut setting = Self::new(key);
        setting.value = value.into();
        setting
    }

    pub fn key(&self) -> SettingKey {
        self.key
    }

    /// The underlying value, ignoring any override.
    pub fn value(&self) -> &SettingValue {
        &self.value
    }

    /// Override if present, else the plain value.
    pub fn effective_value(&self) -> &SettingValue {
        self.overridden.as_ref().unwrap_or(&self.value)
    }

    pub fn available_values(&self) -> &[SettingValue] {
        &self.available
    }

    pub fn overridden_value(&self) -> Option<&SettingValue> {
        self.overridden.as_ref()
    }

    pub fn is_overridden(&self) -> bool {
        self.overridden.is_some()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// A setting is valid when its effective value is set, its legal
    /// value set is known, and the effective value is a member of it.
    pub fn is_valid(&self) -> bool {
        !self.loading
            && !self.effective_value().is_null()
            && self.available.contains(self.effective_value())
    }

    /// Write the plain value. Returns false (and changes nothing) when
    /// the new value deep-equals the current one.
    pub(crate) fn set_value(&mut self, value: SettingValue) -> bool {
        if value == self.value {
            return false;
        }
        self.value = value;
        self.persisted = false;
        true
    }

    /// Install or clear the override. Unlike `set_value` this is not
    /// equality-gated here: adding or removing an override changes what
    /// every reader observes even when the underlying value is equal,
    /// so callers decide when to suppress.
    pub(crate) fn set_overridden(&mut self, value: Option<SettingValue>) {
        self.overridden = value;
    }

    pub(crate) fn set_available(&mut self, values: Vec<SettingValue>) -> bool {
        if values == self.available {
            return false;
        }
        self.available = values;
        true
    }

    pub(crate) fn set_loading(&mut self, loading: bool) -> bool {
        if loading == self.loading {
            return false;
        }
        self.loading = loading;
        true
    }

    /// Mark as restored-from-document: the value is held but excluded
    /// from resolution until an available set confirms it.
    pub(crate) fn mark_persisted(&mut self) {
        self.persisted = true;
    }

    /// The available set confirmed the persisted value; it becomes a
    /// normal value again.
    pub(crate) fn confirm_persisted(&mut self) {
        self.persisted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_tags_roundtrip() {
        for key in SettingKey::ALL {
            assert_eq!(SettingKey::parse(key.as_str()), Some(key));
        }
        assert_eq!(SettingKey::parse("no_such_key"), None);
    }

    #[test]
    fn test_noop_write() {
        let mut s = Setting::with_value(SettingKey::Ensemble, "E1");
        assert!(!s.set_value(SettingValue::from("E1")));
        assert!(s.set_value(SettingValue::from("E2")));
        assert_eq!(s.value(), &SettingValue::from("E2"));
    }

    #[test]
    fn test_override_precedence_and_fallback() {
        let mut s = Setting::with_value(SettingKey::Attribute, "depth");
        s.set_overridden(Some(SettingValue::from("time")));
        assert_eq!(s.effective_value(), &SettingValue::from("time"));
        // Underlying value preserved beneath the override.
        assert_eq!(s.value(), &SettingValue::from("depth"));

        s.set_overridden(None);
        assert_eq!(s.effective_value(), &SettingValue::from("depth"));
    }

    #[test]
    fn test_validity_requires_membership() {
        let mut s = Setting::with_value(SettingKey::Ensemble, "E1");
        assert!(!s.is_valid(), "empty available set means unknown");

        s.set_available(vec![SettingValue::from("E1"), SettingValue::from("E2")]);
        assert!(s.is_valid());

        s.set_value(SettingValue::from("E9"));
        assert!(!s.is_valid());

        s.set_loading(true);
        assert!(!s.is_valid());
    }

    #[test]
    fn test_available_write_gated_on_equality() {
        let mut s = Setting::new(SettingKey::Realization);
        assert!(s.set_available(vec![SettingValue::Int(0)]));
        assert!(!s.set_available(vec![SettingValue::Int(0)]));
    }

    #[test]
    fn test_persisted_flag_lifecycle() {
        let mut s = Setting::with_value(SettingKey::TimePoint, "2020-01-01");
        s.mark_persisted();
        assert!(s.is_persisted());
        s.confirm_persisted();
        assert!(!s.is_persisted());

        // A fresh write also clears the flag.
        s.mark_persisted();
        s.set_value(SettingValue::from("2021-01-01"));
        assert!(!s.is_persisted());
    }
}
