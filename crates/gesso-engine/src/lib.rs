pub mod estimate;
pub mod input;
pub mod interpreter;
pub mod metadata;
pub mod sequences;
pub mod special;
pub mod splitter;
pub mod tags;
pub mod value;

use gesso_contracts::params::ParamRegistry;
use gesso_contracts::{AssetRegistry, PresetStore, WildcardStore};

pub use estimate::process_prompt_like_for_length;
pub use input::Input;
pub use interpreter::{preparse_prompts, process_prompt_like, ParseContext, Phase};
pub use sequences::{SeqKey, SequenceStore};
pub use tags::{TagHandler, TagRegistry, TagResult};
pub use value::ParamValue;

/// The read-only collaborators and shared state one request needs:
/// descriptor registry, asset registries keyed by subtype, wildcard
/// and preset stores, the cross-request sequence store, and the tag
/// handler/estimator tables (built once, read-only afterwards).
pub struct Services {
    pub params: ParamRegistry,
    pub models: AssetRegistry,
    pub loras: AssetRegistry,
    pub embeddings: AssetRegistry,
    pub wildcards: WildcardStore,
    pub presets: PresetStore,
    pub sequences: SequenceStore,
    pub tags: TagRegistry,
    pub estimators: estimate::EstimatorRegistry,
}

impl Services {
    pub fn new(
        params: ParamRegistry,
        models: AssetRegistry,
        loras: AssetRegistry,
        embeddings: AssetRegistry,
        wildcards: WildcardStore,
        presets: PresetStore,
    ) -> Self {
        Self {
            params,
            models,
            loras,
            embeddings,
            wildcards,
            presets,
            sequences: SequenceStore::new(),
            tags: TagRegistry::new(),
            estimators: estimate::EstimatorRegistry::new(),
        }
    }

    pub fn registry_for(&self, subtype: &str) -> Option<&AssetRegistry> {
        match subtype {
            "Stable-Diffusion" | "Model" => Some(&self.models),
            "LoRA" => Some(&self.loras),
            "Embedding" => Some(&self.embeddings),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use gesso_contracts::params::standard_params;
    use gesso_contracts::{
        AssetRegistry, AssetSpec, Preset, PresetStore, Session, WildcardStore,
    };

    use crate::{Input, Services};

    pub fn services() -> Services {
        services_with_wildcards(WildcardStore::new("/nonexistent/gesso-test-wildcards"))
    }

    pub fn services_with_wildcards(wildcards: WildcardStore) -> Services {
        let models = AssetRegistry::new(vec![
            AssetSpec::new("OfficialStableDiffusion/sd_xl_base_1.0", "Stable-Diffusion"),
            AssetSpec::new("anime/sd_xl_anime", "Stable-Diffusion").with_trigger("anime style"),
        ]);
        let loras = AssetRegistry::new(vec![
            AssetSpec::new("detail", "LoRA").with_trigger("highly detailed"),
            AssetSpec::new("paint-splash", "LoRA"),
        ]);
        let embeddings = AssetRegistry::new(vec![
            AssetSpec::new("easy-negative", "Embedding"),
            AssetSpec::new("bad hands", "Embedding"),
        ]);

        let mut stylize = BTreeMap::new();
        stylize.insert("prompt".to_string(), "ultra {value} hires".to_string());
        stylize.insert("cfg_scale".to_string(), "9".to_string());
        let mut base_kit = BTreeMap::new();
        base_kit.insert("model".to_string(), "sd_xl_anime".to_string());
        base_kit.insert("images".to_string(), "4".to_string());
        base_kit.insert("steps".to_string(), "40".to_string());
        let presets = PresetStore::new(vec![
            Preset::new("stylize", stylize),
            Preset::new("base-kit", base_kit),
        ]);

        Services::new(
            standard_params(),
            models,
            loras,
            embeddings,
            wildcards,
            presets,
        )
    }

    pub fn input() -> Input {
        Input::new(Arc::new(Session::new("tester")))
    }

    pub fn set(input: &mut Input, services: &Services, id: &str, text: &str) {
        let desc = services.params.require(id).unwrap();
        input.set_raw(desc, text, services).unwrap();
    }
}
