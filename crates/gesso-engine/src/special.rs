use anyhow::Result;
use gesso_contracts::RequestEvent;
use rand::Rng;

use crate::input::{parse_resolution, Input};
use crate::splitter::{find_closing, split_tag_interior};
use crate::value::ParamValue;
use crate::Services;

/// Parameters a preset may assign before the request is routed to a
/// backend.
pub const MUST_LOAD_EARLY_PARAMS: &[&str] =
    &["model", "images", "internalbackendtype", "exactbackendid"];

/// Ordered normalization passes, run once per request before
/// dispatch.
pub fn apply_special_logic(input: &mut Input, services: &Services) -> Result<()> {
    materialize_seed(input, services)?;
    materialize_variation_seed(input, services)?;
    split_raw_resolution(input, services)?;
    align_lora_arrays(input, services)?;
    apply_early_presets(input, services)?;
    Ok(())
}

fn materialize_seed(input: &mut Input, services: &Services) -> Result<()> {
    let current = input.get_i64("seed").unwrap_or(-1);
    if input.raw_original_seed.is_none() {
        input.raw_original_seed = Some(current);
    }
    if current == -1 {
        let desc = services.params.require("seed")?;
        let fresh = fresh_seed();
        input.set_typed(desc, ParamValue::Int64(fresh), services)?;
        input.log_event(RequestEvent::SeedMaterialized { seed: fresh });
    }
    Ok(())
}

fn materialize_variation_seed(input: &mut Input, services: &Services) -> Result<()> {
    if input.get_i64("variation_seed") == Some(-1) {
        let desc = services.params.require("variation_seed")?;
        input.set_typed(desc, ParamValue::Int64(fresh_seed()), services)?;
    }
    Ok(())
}

fn split_raw_resolution(input: &mut Input, services: &Services) -> Result<()> {
    let Some(raw) = input.get_text("raw_resolution") else {
        return Ok(());
    };
    match parse_resolution(&raw) {
        Some((width, height)) => {
            input.set_typed(
                services.params.require("width")?,
                ParamValue::Int32(width),
                services,
            )?;
            input.set_typed(
                services.params.require("height")?,
                ParamValue::Int32(height),
                services,
            )?;
            input.remove(services.params.require("alt_resolution_height_mult")?);
            input.remove(services.params.require("raw_resolution")?);
        }
        None => {
            input.add_parser_warning("raw_resolution", format!("Invalid resolution '{raw}'"));
        }
    }
    Ok(())
}

fn align_lora_arrays(input: &mut Input, services: &Services) -> Result<()> {
    if input.value_of("loras").is_none() {
        return Ok(());
    }
    let count = input.get_list("loras").len();

    let mut weights = input.get_list("lora_weights");
    if weights.len() != count {
        input.add_parser_warning(
            "lora_weights",
            format!(
                "LoRA weights length {} does not match loras length {count}; realigning",
                weights.len()
            ),
        );
        weights.truncate(count);
        while weights.len() < count {
            weights.push("1".to_string());
        }
        input.set_typed(
            services.params.require("lora_weights")?,
            ParamValue::List(weights),
            services,
        )?;
    }

    let confinement = input.get_list("lora_section_confinement");
    if input.value_of("lora_section_confinement").is_some() && confinement.len() != count {
        input.remove(services.params.require("lora_section_confinement")?);
    }
    Ok(())
}

/// Scan the raw prompt for `<preset:…>` tags and apply only the
/// parameters a backend must see before dispatch.
fn apply_early_presets(input: &mut Input, services: &Services) -> Result<()> {
    let Some(prompt) = input.get_text("prompt") else {
        return Ok(());
    };
    let mut rest = prompt.as_str();
    while let Some(open) = rest.find('<') {
        let tail = &rest[open..];
        let Some(close) = find_closing(tail) else {
            break;
        };
        let (prefix, _pre_data, data) = split_tag_interior(&tail[1..close]);
        if let Some(data) = data {
            if prefix == "preset" || prefix == "p" {
                if let Some(preset) = services.presets.best_match(data.trim()).cloned() {
                    for (id, text) in &preset.param_map {
                        if MUST_LOAD_EARLY_PARAMS.contains(&id.as_str()) {
                            let desc = services.params.require(id)?;
                            input.set_raw(desc, text, services)?;
                        }
                    }
                }
            }
        }
        rest = &tail[close + 1..];
    }
    Ok(())
}

fn fresh_seed() -> i64 {
    rand::rng().random_range(0..(1i64 << 31))
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use crate::testutil;
    use crate::value::ParamValue;

    #[test]
    fn seed_materializes_into_31_bit_range() -> anyhow::Result<()> {
        let services = testutil::services();
        let mut input = testutil::input();
        testutil::set(&mut input, &services, "seed", "-1");
        input.apply_special_logic(&services)?;

        assert_eq!(input.raw_original_seed, Some(-1));
        let seed = input.get_i64("seed").unwrap();
        assert!((0..(1i64 << 31)).contains(&seed));
        Ok(())
    }

    #[test]
    fn missing_seed_also_materializes() -> anyhow::Result<()> {
        let services = testutil::services();
        let mut input = testutil::input();
        input.apply_special_logic(&services)?;
        assert_eq!(input.raw_original_seed, Some(-1));
        assert!(input.get_i64("seed").is_some());
        Ok(())
    }

    #[test]
    fn explicit_seed_is_preserved() -> anyhow::Result<()> {
        let services = testutil::services();
        let mut input = testutil::input();
        testutil::set(&mut input, &services, "seed", "42");
        input.apply_special_logic(&services)?;
        assert_eq!(input.get_i64("seed"), Some(42));
        assert_eq!(input.raw_original_seed, Some(42));
        Ok(())
    }

    #[test]
    fn variation_seed_minus_one_is_replaced() -> anyhow::Result<()> {
        let services = testutil::services();
        let mut input = testutil::input();
        let desc = services.params.require("variation_seed")?;
        // typed path bypasses the ignore-if sentinel deletion
        input.set_typed(desc, ParamValue::Int64(-1), &services)?;
        input.apply_special_logic(&services)?;
        let seed = input.get_i64("variation_seed").unwrap();
        assert!((0..(1i64 << 31)).contains(&seed));
        Ok(())
    }

    #[test]
    fn raw_resolution_splits_into_width_and_height() -> anyhow::Result<()> {
        let services = testutil::services();
        let mut input = testutil::input();
        testutil::set(&mut input, &services, "raw_resolution", "1024x768");
        testutil::set(&mut input, &services, "alt_resolution_height_mult", "1.5");
        input.apply_special_logic(&services)?;

        assert_eq!(input.try_get(services.params.require("width")?), Some(ParamValue::Int32(1024)));
        assert_eq!(input.try_get(services.params.require("height")?), Some(ParamValue::Int32(768)));
        assert!(input.value_of("alt_resolution_height_mult").is_none());
        assert!(input.value_of("raw_resolution").is_none());
        Ok(())
    }

    #[test]
    fn lora_weights_realign_with_warning() -> anyhow::Result<()> {
        let services = testutil::services();
        let mut input = testutil::input();
        testutil::set(&mut input, &services, "loras", "a,b,c");
        testutil::set(&mut input, &services, "lora_weights", "0.5");
        testutil::set(&mut input, &services, "lora_section_confinement", "0");
        input.apply_special_logic(&services)?;

        assert_eq!(input.get_list("lora_weights"), vec!["0.5", "1", "1"]);
        assert!(input.value_of("lora_section_confinement").is_none());
        let warnings = input.extra_meta["parser_warnings"].as_array().unwrap();
        assert!(warnings[0]
            .as_str()
            .unwrap()
            .contains("does not match loras length 3"));
        Ok(())
    }

    #[test]
    fn aligned_arrays_pass_untouched() -> anyhow::Result<()> {
        let services = testutil::services();
        let mut input = testutil::input();
        testutil::set(&mut input, &services, "loras", "a,b");
        testutil::set(&mut input, &services, "lora_weights", "0.5,0.7");
        input.apply_special_logic(&services)?;
        assert_eq!(input.get_list("lora_weights"), vec!["0.5", "0.7"]);
        assert_eq!(input.extra_meta.get("parser_warnings"), None);
        Ok(())
    }

    #[test]
    fn early_presets_apply_only_the_allowlist() -> anyhow::Result<()> {
        let services = testutil::services();
        let mut input = testutil::input();
        testutil::set(&mut input, &services, "prompt", "x <preset:base-kit> y");
        input.apply_special_logic(&services)?;

        // model and images load early; steps waits for the main pass
        assert_eq!(
            input.value_of("model").and_then(ParamValue::as_model).map(|m| m.name.as_str()),
            Some("anime/sd_xl_anime")
        );
        assert_eq!(input.get_i64("images"), Some(4));
        assert_eq!(input.value_of("steps"), None);

        // prompt text itself is untouched by the early pass
        assert_eq!(
            input.extra_meta.get("original_prompt"),
            None::<&Value>
        );
        assert_eq!(input.get_text("prompt").unwrap(), "x <preset:base-kit> y");
        Ok(())
    }
}
