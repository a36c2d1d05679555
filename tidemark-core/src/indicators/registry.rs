//! Calculator registry.
//!
//! Keys are case-insensitive and stored upper-case. Custom calculators name an
//! implementation from `CUSTOM_CATALOG`; the reference is resolved when the
//! calculator is defined, so an unknown reference fails at definition time.

use super::momentum::{self, MomentumV1};
use super::{Atr, Boll, Calculator, Ma, Macd, Rsi};
use crate::domain::IndicatorDefinition;
use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

type Constructor = fn(IndicatorDefinition) -> Arc<dyn Calculator>;

/// Implementations available to custom definitions, by reference name.
pub const CUSTOM_CATALOG: &[(&str, Constructor)] = &[(momentum::IMPL_REF, momentum_v1)];

fn momentum_v1(definition: IndicatorDefinition) -> Arc<dyn Calculator> {
    Arc::new(MomentumV1::new(definition))
}

fn normalize_key(key: &str) -> String {
    key.trim().to_uppercase()
}

#[derive(Default)]
pub struct CalculatorRegistry {
    calculators: RwLock<BTreeMap<String, Arc<dyn Calculator>>>,
}

impl CalculatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding MA, RSI, MACD, BOLL and ATR.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        let builtins: [Arc<dyn Calculator>; 5] = [
            Arc::new(Ma::new()),
            Arc::new(Rsi::new()),
            Arc::new(Macd::new()),
            Arc::new(Boll::new()),
            Arc::new(Atr::new()),
        ];
        let mut map = registry.calculators.write();
        for calc in builtins {
            map.insert(normalize_key(&calc.definition().key), calc);
        }
        drop(map);
        registry
    }

    /// Register a calculator under its definition key.
    pub fn register(&self, calculator: Arc<dyn Calculator>) -> CoreResult<()> {
        let key = normalize_key(&calculator.definition().key);
        if key.is_empty() {
            return Err(CoreError::InvalidArgument("indicator key is blank".into()));
        }
        let mut map = self.calculators.write();
        if map.contains_key(&key) {
            return Err(CoreError::DuplicateIndicator(key));
        }
        map.insert(key, calculator);
        Ok(())
    }

    /// Bind `definition` to the catalog implementation named `impl_ref` and register it.
    pub fn define_custom(
        &self,
        mut definition: IndicatorDefinition,
        impl_ref: &str,
    ) -> CoreResult<Arc<dyn Calculator>> {
        let wanted = impl_ref.trim().to_lowercase();
        let constructor = CUSTOM_CATALOG
            .iter()
            .find(|(name, _)| *name == wanted)
            .map(|(_, ctor)| *ctor)
            .ok_or_else(|| CoreError::UnknownImplementation(impl_ref.to_string()))?;
        definition.key = normalize_key(&definition.key);
        if definition.source_label.is_empty() {
            definition.source_label = "custom".to_string();
        }
        let key = definition.key.clone();
        let calculator = constructor(definition);
        self.register(calculator.clone())?;
        info!(key = %key, impl_ref = %wanted, "custom indicator defined");
        Ok(calculator)
    }

    pub fn get(&self, key: &str) -> CoreResult<Arc<dyn Calculator>> {
        self.calculators
            .read()
            .get(&normalize_key(key))
            .cloned()
            .ok_or_else(|| CoreError::UnknownIndicator(key.to_string()))
    }

    /// Definitions of every registered calculator, ordered by key.
    pub fn list(&self) -> Vec<IndicatorDefinition> {
        self.calculators
            .read()
            .values()
            .map(|c| c.definition().clone())
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.calculators.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let registry = CalculatorRegistry::with_builtins();
        assert_eq!(registry.keys(), vec!["ATR", "BOLL", "MA", "MACD", "RSI"]);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = CalculatorRegistry::with_builtins();
        assert_eq!(registry.get("macd").unwrap().definition().key, "MACD");
        assert!(matches!(
            registry.get("nope"),
            Err(CoreError::UnknownIndicator(_))
        ));
    }

    #[test]
    fn custom_definition_resolves_catalog() {
        let registry = CalculatorRegistry::with_builtins();
        let def = IndicatorDefinition::new("mom20", "Momentum 20").default_target("600519");
        let calc = registry.define_custom(def, "MOMENTUM_V1").unwrap();
        assert_eq!(calc.definition().key, "MOM20");
        assert_eq!(calc.definition().source_label, "custom");
        assert!(registry.get("Mom20").is_ok());
    }

    #[test]
    fn unknown_impl_ref_fails_at_definition() {
        let registry = CalculatorRegistry::new();
        let err = registry
            .define_custom(IndicatorDefinition::new("X", "x"), "app.indicators.custom:Missing")
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::UnknownImplementation(_)));
        assert!(registry.list().is_empty());
    }

    #[test]
    fn duplicate_key_rejected() {
        let registry = CalculatorRegistry::with_builtins();
        let err = registry
            .define_custom(IndicatorDefinition::new("ma", "shadow"), "momentum_v1")
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::DuplicateIndicator(k) if k == "MA"));
    }
}
