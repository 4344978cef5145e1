//! [`BridgeFactoryTable`] – platform type → adapter constructor.
//!
//! The table is assembled once at startup. Registering a constructor for a
//! type that already has one replaces it.

use std::collections::HashMap;

use tracing::debug;

use crate::adapter::{BridgeAdapter, BridgeConfiguration, BridgeContext, BridgeError};
use crate::test_bridge::TestBridge;

/// Constructor for one platform type.
pub type BridgeFactory = fn(BridgeContext) -> Result<Box<dyn BridgeAdapter>, BridgeError>;

#[derive(Default)]
pub struct BridgeFactoryTable {
    factories: HashMap<String, BridgeFactory>,
    configurations: HashMap<String, BridgeConfiguration>,
}

impl BridgeFactoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table knowing every adapter shipped with this crate.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.register(TestBridge::PLATFORM_TYPE, TestBridge::factory);
        table
    }

    pub fn register(&mut self, platform_type: &str, factory: BridgeFactory) {
        debug!(platform_type = %platform_type, "bridge factory registered");
        self.factories.insert(platform_type.to_string(), factory);
    }

    /// Properties handed to every adapter of `platform_type`.
    pub fn configure(&mut self, platform_type: &str, configuration: BridgeConfiguration) {
        self.configurations.insert(platform_type.to_string(), configuration);
    }

    pub fn configuration(&self, platform_type: &str) -> BridgeConfiguration {
        self.configurations.get(platform_type).cloned().unwrap_or_default()
    }

    pub fn get(&self, platform_type: &str) -> Option<BridgeFactory> {
        self.factories.get(platform_type).copied()
    }

    /// Platform types with a registered constructor, sorted.
    pub fn supported_platform_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn refusing_factory(_ctx: BridgeContext) -> Result<Box<dyn BridgeAdapter>, BridgeError> {
        Err(BridgeError::Configuration("no endpoint".into()))
    }

    #[test]
    fn defaults_include_test_bridge() {
        let table = BridgeFactoryTable::with_defaults();
        assert_eq!(table.supported_platform_types(), vec![TestBridge::PLATFORM_TYPE.to_string()]);
        assert!(table.get(TestBridge::PLATFORM_TYPE).is_some());
        assert!(table.get("http://inter-iot.eu/FIWARE").is_none());
    }

    #[test]
    fn types_are_listed_sorted_and_replaced() {
        let mut table = BridgeFactoryTable::with_defaults();
        table.register("http://a.example/Platform", refusing_factory);
        table.register("http://a.example/Platform", refusing_factory);
        assert_eq!(
            table.supported_platform_types(),
            vec!["http://a.example/Platform".to_string(), TestBridge::PLATFORM_TYPE.to_string()]
        );
    }

    #[test]
    fn unconfigured_type_gets_empty_configuration() {
        let mut table = BridgeFactoryTable::new();
        table.configure(
            "t",
            BridgeConfiguration::new(BTreeMap::from([("k".to_string(), "v".to_string())])),
        );
        assert_eq!(table.configuration("t").get("k"), Some("v"));
        assert_eq!(table.configuration("other"), BridgeConfiguration::default());
    }
}
