//! Indicator definitions and calculator parameters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Parameters passed to a calculator, merged over its defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndicatorParams(BTreeMap<String, serde_json::Value>);

impl IndicatorParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|v| v.as_str())
    }

    /// Window-style integer parameter, clamped to at least 1.
    ///
    /// Accepts integers, floats (truncated) and numeric strings.
    pub fn window(&self, name: &str, default: usize) -> usize {
        let value = match self.0.get(name) {
            Some(serde_json::Value::Number(n)) => n
                .as_u64()
                .map(|v| v as usize)
                .or_else(|| n.as_i64().map(|v| v.max(0) as usize))
                .or_else(|| n.as_f64().map(|v| v.max(0.0) as usize)),
            Some(serde_json::Value::String(s)) => s.trim().parse::<usize>().ok(),
            _ => None,
        };
        value.unwrap_or(default).max(1)
    }

    pub fn float(&self, name: &str, default: f64) -> f64 {
        match self.0.get(name) {
            Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(default),
            Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().unwrap_or(default),
            _ => default,
        }
    }

    /// `self` layered over `defaults`: explicit values win.
    pub fn merged_over(&self, defaults: &IndicatorParams) -> IndicatorParams {
        let mut merged = defaults.0.clone();
        merged.extend(self.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        IndicatorParams(merged)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }
}

impl FromIterator<(String, serde_json::Value)> for IndicatorParams {
    fn from_iter<I: IntoIterator<Item = (String, serde_json::Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Registered metadata for one calculator. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorDefinition {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub default_target: String,
    #[serde(default)]
    pub default_params: IndicatorParams,
    #[serde(default = "allow_by_default")]
    pub allow_target_override: bool,
    #[serde(default)]
    pub source_label: String,
}

fn allow_by_default() -> bool {
    true
}

impl IndicatorDefinition {
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            description: String::new(),
            default_target: String::new(),
            default_params: IndicatorParams::new(),
            allow_target_override: true,
            source_label: String::new(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn default_target(mut self, target: impl Into<String>) -> Self {
        self.default_target = target.into();
        self
    }

    pub fn default_params(mut self, params: IndicatorParams) -> Self {
        self.default_params = params;
        self
    }

    pub fn allow_target_override(mut self, allow: bool) -> Self {
        self.allow_target_override = allow;
        self
    }

    pub fn source_label(mut self, label: impl Into<String>) -> Self {
        self.source_label = label.into();
        self
    }
}
