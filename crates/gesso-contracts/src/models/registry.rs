use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A named generation asset: a base model, LoRA, or embedding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSpec {
    pub name: String,
    pub kind: String,
    pub trigger_phrase: Option<String>,
}

impl AssetSpec {
    pub fn new(name: &str, kind: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            trigger_phrase: None,
        }
    }

    pub fn with_trigger(mut self, phrase: &str) -> Self {
        self.trigger_phrase = Some(phrase.to_string());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct AssetRegistry {
    assets: IndexMap<String, AssetSpec>,
}

impl AssetRegistry {
    pub fn new(assets: Vec<AssetSpec>) -> Self {
        let mut map = IndexMap::new();
        for asset in assets {
            map.insert(asset.name.clone(), asset);
        }
        Self { assets: map }
    }

    pub fn get(&self, name: &str) -> Option<&AssetSpec> {
        self.assets.get(name)
    }

    pub fn insert(&mut self, asset: AssetSpec) {
        self.assets.insert(asset.name.clone(), asset);
    }

    pub fn list_names(&self) -> Vec<String> {
        self.assets.keys().cloned().collect()
    }

    pub fn trigger_phrase(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|asset| asset.trigger_phrase.as_deref())
    }

    /// Fuzzy lookup honoring path separators normalized to `/` and
    /// case-insensitive comparison.
    pub fn best_match(&self, query: &str) -> Option<&AssetSpec> {
        let name = best_match_in(query, self.assets.keys().map(String::as_str))?;
        self.assets.get(&name)
    }
}

/// Pick the best candidate for `query` out of `candidates`.
///
/// Match classes, strongest first: exact, path-suffix (`…/query`),
/// bare-filename, substring. Within a class the shortest candidate
/// wins so `detail` prefers `detail` over `detail-v2-extended`.
pub fn best_match_in<'a>(
    query: &str,
    candidates: impl Iterator<Item = &'a str>,
) -> Option<String> {
    let needle = normalize_asset_name(query);
    if needle.is_empty() {
        return None;
    }

    let suffix = format!("/{needle}");
    let mut best: Option<(u8, usize, &str)> = None;
    for candidate in candidates {
        let haystack = normalize_asset_name(candidate);
        let rank = if haystack == needle {
            0
        } else if haystack.ends_with(&suffix) {
            1
        } else if haystack
            .rsplit('/')
            .next()
            .map_or(false, |file| file == needle)
        {
            2
        } else if haystack.contains(&needle) {
            3
        } else {
            continue;
        };
        if best.map_or(true, |(r, len, _)| (rank, haystack.len()) < (r, len)) {
            best = Some((rank, haystack.len(), candidate));
        }
    }
    best.map(|(_, _, candidate)| candidate.to_string())
}

fn normalize_asset_name(name: &str) -> String {
    name.trim().replace('\\', "/").to_ascii_lowercase()
}
