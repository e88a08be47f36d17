use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gesso_contracts::params::standard_params;
use gesso_contracts::{
    AssetRegistry, AssetSpec, EventLog, Preset, PresetStore, Session, WildcardStore,
};
use gesso_engine::{process_prompt_like_for_length, Input, Services};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(
    name = "gesso",
    version,
    about = "Prompt-template expansion for image generation requests"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Expand(ExpandArgs),
    Estimate(EstimateArgs),
}

#[derive(Debug, Parser)]
struct ExpandArgs {
    /// Request JSON: a flat object of parameter id -> value.
    #[arg(long)]
    request: PathBuf,
    /// Assets JSON with models/loras/embeddings/presets.
    #[arg(long)]
    assets: Option<PathBuf>,
    /// Directory of wildcard .txt files.
    #[arg(long)]
    wildcards: Option<PathBuf>,
    /// Append request events to this JSONL file.
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = "local")]
    user: String,
    /// Also print the raw metadata string.
    #[arg(long)]
    metadata: bool,
}

#[derive(Debug, Parser)]
struct EstimateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    assets: Option<PathBuf>,
    #[arg(long)]
    wildcards: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("gesso error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Expand(args) => run_expand(args),
        Command::Estimate(args) => run_estimate(args),
    }
}

fn run_expand(args: ExpandArgs) -> Result<i32> {
    let services = build_services(args.assets.as_deref(), args.wildcards.as_deref())?;
    let payload = read_json_object(&args.request)?;

    let mut session = Session::new(&args.user);
    if let Some(events) = &args.events {
        session = session.with_events(EventLog::new(events, Uuid::new_v4().to_string()));
    }
    let mut input = Input::new(Arc::new(session));
    input.load_json_object(&payload, &services)?;
    input.apply_special_logic(&services)?;
    input.preparse_prompts(&services)?;

    if let Some(prompt) = param_text(&input, &services, "prompt") {
        println!("prompt: {prompt}");
    }
    if let Some(negative) = param_text(&input, &services, "negativeprompt") {
        println!("negativeprompt: {negative}");
    }
    if args.metadata {
        println!("{}", input.gen_raw_metadata(&services));
    }
    Ok(0)
}

fn run_estimate(args: EstimateArgs) -> Result<i32> {
    let services = build_services(args.assets.as_deref(), args.wildcards.as_deref())?;
    println!("{}", process_prompt_like_for_length(&args.prompt, &services));
    Ok(0)
}

fn param_text(input: &Input, services: &Services, id: &str) -> Option<String> {
    let desc = services.params.get(id)?;
    input.try_get(desc).map(|value| value.to_text())
}

fn build_services(assets: Option<&Path>, wildcards: Option<&Path>) -> Result<Services> {
    let wildcards = WildcardStore::new(wildcards.unwrap_or(Path::new("wildcards")));
    let (models, loras, embeddings, presets) = match assets {
        Some(path) => load_assets(path)?,
        None => (
            AssetRegistry::default(),
            AssetRegistry::default(),
            AssetRegistry::default(),
            PresetStore::default(),
        ),
    };
    Ok(Services::new(
        standard_params(),
        models,
        loras,
        embeddings,
        wildcards,
        presets,
    ))
}

fn load_assets(
    path: &Path,
) -> Result<(AssetRegistry, AssetRegistry, AssetRegistry, PresetStore)> {
    let payload = read_json_object(path)?;
    let models = asset_registry(payload.get("models"), "Stable-Diffusion");
    let loras = asset_registry(payload.get("loras"), "LoRA");
    let embeddings = asset_registry(payload.get("embeddings"), "Embedding");

    let mut presets = Vec::new();
    if let Some(rows) = payload.get("presets").and_then(Value::as_array) {
        for row in rows {
            let Some(name) = row.get("name").and_then(Value::as_str) else {
                continue;
            };
            let mut param_map = BTreeMap::new();
            if let Some(params) = row.get("params").and_then(Value::as_object) {
                for (id, value) in params {
                    let text = match value {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    };
                    param_map.insert(id.clone(), text);
                }
            }
            presets.push(Preset::new(name, param_map));
        }
    }
    Ok((models, loras, embeddings, PresetStore::new(presets)))
}

fn asset_registry(rows: Option<&Value>, kind: &str) -> AssetRegistry {
    let mut registry = AssetRegistry::default();
    let Some(rows) = rows.and_then(Value::as_array) else {
        return registry;
    };
    for row in rows {
        let Some(name) = row.get("name").and_then(Value::as_str) else {
            continue;
        };
        let mut asset = AssetSpec::new(name, kind);
        if let Some(phrase) = row.get("trigger_phrase").and_then(Value::as_str) {
            asset = asset.with_trigger(phrase);
        }
        registry.insert(asset);
    }
    registry
}

fn read_json_object(path: &Path) -> Result<Map<String, Value>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let parsed: Value = serde_json::from_str(&raw)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    parsed
        .as_object()
        .cloned()
        .with_context(|| format!("{} is not a JSON object", path.display()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn assets_file_builds_registries_and_presets() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("assets.json");
        std::fs::write(
            &path,
            serde_json::to_string_pretty(&json!({
                "models": [{"name": "anime/sd_xl_anime", "trigger_phrase": "anime style"}],
                "loras": [{"name": "detail"}],
                "embeddings": [{"name": "easy-negative"}],
                "presets": [{"name": "stylize", "params": {"cfg_scale": 9}}]
            }))?,
        )?;

        let (models, loras, embeddings, presets) = load_assets(&path)?;
        assert_eq!(models.trigger_phrase("anime/sd_xl_anime"), Some("anime style"));
        assert_eq!(loras.list_names(), vec!["detail"]);
        assert_eq!(embeddings.list_names(), vec!["easy-negative"]);
        assert_eq!(
            presets.get("stylize").unwrap().param_map.get("cfg_scale"),
            Some(&"9".to_string())
        );
        Ok(())
    }

    #[test]
    fn expand_runs_end_to_end() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let request = temp.path().join("request.json");
        std::fs::write(
            &request,
            serde_json::to_string(&json!({
                "prompt": "a <random:red|blue> car",
                "seed": 42
            }))?,
        )?;

        let services = build_services(None, None)?;
        let payload = read_json_object(&request)?;
        let mut input = Input::new(Arc::new(Session::new("tester")));
        input.load_json_object(&payload, &services)?;
        input.apply_special_logic(&services)?;
        input.preparse_prompts(&services)?;

        let prompt = param_text(&input, &services, "prompt").unwrap();
        assert!(["a red car", "a blue car"].contains(&prompt.as_str()));
        Ok(())
    }
}
