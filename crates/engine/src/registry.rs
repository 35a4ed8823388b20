//! Class registries: the lookup tables deserialization uses to turn
//! persisted class tags back into live definitions.
//!
//! Registered explicitly by the application at startup rather than
//! discovered, so the set of constructible classes is visible in one
//! place and an unknown tag in a document is a hard error instead of a
//! silently dropped item.

use rustc_hash::FxHashMap;

use crate::context::LayerDefinition;
use crate::error::TreeError;
use crate::setting::SettingKey;

type LayerFactory = Box<dyn Fn() -> LayerDefinition>;

/// Layer class tag -> definition factory.
#[derive(Default)]
pub struct LayerRegistry {
    factories: FxHashMap<String, LayerFactory>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: &str, factory: impl Fn() -> LayerDefinition + 'static) {
        self.factories.insert(class.to_string(), Box::new(factory));
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    /// Build a fresh definition for a class tag.
    pub fn create(&self, class: &str) -> Result<LayerDefinition, TreeError> {
        let factory = self
            .factories
            .get(class)
            .ok_or_else(|| TreeError::UnknownLayerClass(class.to_string()))?;
        Ok(factory())
    }
}

/// Shared-setting class tag -> the setting key it wraps.
#[derive(Default)]
pub struct SettingRegistry {
    keys: FxHashMap<String, SettingKey>,
}

impl SettingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: &str, key: SettingKey) {
        self.keys.insert(class.to_string(), key);
    }

    pub fn key_of(&self, class: &str) -> Result<SettingKey, TreeError> {
        self.keys
            .get(class)
            .copied()
            .ok_or_else(|| TreeError::UnknownSettingClass(class.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{DataProvider, FetchCtx, FetchOutcome};
    use crate::setting::Setting;

    struct StubProvider;

    impl DataProvider for StubProvider {
        fn fetch(&mut self, _ctx: &mut FetchCtx<'_>) -> FetchOutcome {
            FetchOutcome::Ready(Ok(serde_json::Value::Null))
        }
    }

    #[test]
    fn test_layer_registry_lookup() {
        let mut registry = LayerRegistry::new();
        registry.register("surface", || {
            LayerDefinition::new("surface", StubProvider)
                .with_setting(Setting::new(SettingKey::Ensemble))
        });

        assert!(registry.contains("surface"));
        let def = registry.create("surface").unwrap();
        assert_eq!(def.class(), "surface");

        assert!(matches!(
            registry.create("seismic"),
            Err(TreeError::UnknownLayerClass(class)) if class == "seismic"
        ));
    }

    #[test]
    fn test_setting_registry_lookup() {
        let mut registry = SettingRegistry::new();
        registry.register("ensemble", SettingKey::Ensemble);

        assert_eq!(registry.key_of("ensemble").unwrap(), SettingKey::Ensemble);
        assert_eq!(
            registry.key_of("attribute").unwrap_err(),
            TreeError::UnknownSettingClass("attribute".to_string())
        );
    }
}
