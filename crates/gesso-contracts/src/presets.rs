use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::models::best_match_in;

/// A named bundle of parameter assignments. Prompt-like entries may
/// carry a `{value}` placeholder that the interpreter splices the
/// in-flight tag result into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    pub param_map: BTreeMap<String, String>,
}

impl Preset {
    pub fn new(name: &str, param_map: BTreeMap<String, String>) -> Self {
        Self {
            name: name.to_string(),
            param_map,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PresetStore {
    presets: IndexMap<String, Preset>,
}

impl PresetStore {
    pub fn new(presets: Vec<Preset>) -> Self {
        let mut map = IndexMap::new();
        for preset in presets {
            map.insert(preset.name.clone(), preset);
        }
        Self { presets: map }
    }

    pub fn get(&self, name: &str) -> Option<&Preset> {
        self.presets.get(name)
    }

    pub fn insert(&mut self, preset: Preset) {
        self.presets.insert(preset.name.clone(), preset);
    }

    pub fn list_names(&self) -> Vec<String> {
        self.presets.keys().cloned().collect()
    }

    pub fn best_match(&self, query: &str) -> Option<&Preset> {
        let name = best_match_in(query, self.presets.keys().map(String::as_str))?;
        self.presets.get(&name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PresetStore {
        let mut params = BTreeMap::new();
        params.insert("prompt".to_string(), "ultra {value} hires".to_string());
        params.insert("cfg_scale".to_string(), "9".to_string());
        PresetStore::new(vec![
            Preset::new("stylize", params),
            Preset::new("stylize-extreme", BTreeMap::new()),
        ])
    }

    #[test]
    fn fuzzy_lookup_prefers_exact_then_shortest() {
        let store = store();
        assert_eq!(store.best_match("stylize").unwrap().name, "stylize");
        assert_eq!(store.best_match("STYLIZE").unwrap().name, "stylize");
        assert_eq!(store.best_match("yliz").unwrap().name, "stylize");
    }

    #[test]
    fn param_map_is_exposed() {
        let store = store();
        let preset = store.get("stylize").unwrap();
        assert_eq!(
            preset.param_map.get("prompt").map(String::as_str),
            Some("ultra {value} hires")
        );
    }
}
