use chrono::Utc;
use serde_json::{Map, Value};

use crate::input::Input;
use crate::value::ParamValue;
use crate::Services;

const EMBED_SENTINEL_OPEN: &str = "\0swarmembed:";
const EMBED_SENTINEL_CLOSE: &str = "\0end";

/// Deterministic key→value metadata for one request: stored values
/// (minus hidden descriptors and image blobs) merged with
/// `extra_meta`, plus `version` and `date` stamps.
pub fn gen_metadata_object(input: &Input, services: &Services) -> Map<String, Value> {
    let mut out = Map::new();
    for (id, value) in &input.values {
        let Some(desc) = services.params.get(id) else {
            continue;
        };
        if desc.hide_from_metadata {
            continue;
        }
        if matches!(value, ParamValue::Image(_) | ParamValue::ImageList(_)) {
            continue;
        }
        let json = match desc.metadata_format {
            Some(format) => Value::String(format(&stringify_embed_sentinels(&value.to_text()))),
            None => {
                let mut json = value.to_json();
                if let Value::String(text) = &mut json {
                    *text = stringify_embed_sentinels(text);
                }
                json
            }
        };
        if json.is_null() {
            continue;
        }
        out.insert(id.clone(), json);
    }

    for (key, value) in &input.extra_meta {
        if value.is_null() {
            continue;
        }
        let mut value = value.clone();
        if let Value::String(text) = &mut value {
            *text = stringify_embed_sentinels(text);
        }
        out.insert(key.clone(), value);
    }

    out.insert(
        "version".to_string(),
        Value::String(env!("CARGO_PKG_VERSION").to_string()),
    );
    out.insert(
        "date".to_string(),
        Value::String(Utc::now().format("%Y-%m-%d").to_string()),
    );

    for (original, current) in [
        ("original_prompt", "prompt"),
        ("original_negativeprompt", "negativeprompt"),
    ] {
        if let (Some(a), Some(b)) = (out.get(original), out.get(current)) {
            if a == b {
                out.remove(original);
            }
        }
    }
    out
}

/// The on-disk metadata string: enveloped, 2-space indented, ASCII
/// only, LF line endings.
pub fn gen_raw_metadata(input: &Input, services: &Services) -> String {
    let mut envelope = Map::new();
    envelope.insert(
        "sui_image_params".to_string(),
        Value::Object(gen_metadata_object(input, services)),
    );
    let pretty = serde_json::to_string_pretty(&Value::Object(envelope)).unwrap_or_default();
    escape_non_ascii(&pretty.replace("\r\n", "\n"))
}

/// Replace internal embed sentinels with the user-facing
/// `<embed:name>` syntax.
pub fn stringify_embed_sentinels(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(EMBED_SENTINEL_OPEN) {
        out.push_str(&rest[..start]);
        let tail = &rest[start + EMBED_SENTINEL_OPEN.len()..];
        match tail.find(EMBED_SENTINEL_CLOSE) {
            Some(end) => {
                out.push_str("<embed:");
                out.push_str(&tail[..end]);
                out.push('>');
                rest = &tail[end + EMBED_SENTINEL_CLOSE.len()..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn escape_non_ascii(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut buf = [0u16; 2];
    for ch in text.chars() {
        if (ch as u32) < 0x80 {
            out.push(ch);
        } else {
            for unit in ch.encode_utf16(&mut buf) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use crate::testutil;

    use super::*;

    #[test]
    fn hidden_and_image_params_are_skipped() -> anyhow::Result<()> {
        let services = testutil::services();
        let mut input = testutil::input();
        testutil::set(&mut input, &services, "prompt", "a cat");
        testutil::set(&mut input, &services, "lora_section_confinement", "0");
        testutil::set(&mut input, &services, "init_image", "aGVsbG8=");

        let meta = gen_metadata_object(&input, &services);
        assert_eq!(meta["prompt"], json!("a cat"));
        assert!(!meta.contains_key("lora_section_confinement"));
        assert!(!meta.contains_key("init_image"));
        assert!(meta.contains_key("version"));
        assert!(meta.contains_key("date"));
        Ok(())
    }

    #[test]
    fn metadata_format_hook_applies_to_text_form() -> anyhow::Result<()> {
        let services = testutil::services();
        let mut input = testutil::input();
        testutil::set(&mut input, &services, "cfg_scale", "9");
        testutil::set(&mut input, &services, "model", "sd_xl_anime");

        let meta = gen_metadata_object(&input, &services);
        assert_eq!(meta["cfg_scale"], json!("9"));
        assert_eq!(meta["model"], json!("anime/sd_xl_anime"));
        Ok(())
    }

    #[test]
    fn embed_sentinels_stringify_in_values_and_extra_meta() {
        assert_eq!(
            stringify_embed_sentinels("x \0swarmembed:easy-negative\0end y"),
            "x <embed:easy-negative> y"
        );
        assert_eq!(
            stringify_embed_sentinels("dangling \0swarmembed:oops"),
            "dangling \0swarmembed:oops"
        );

        let services = testutil::services();
        let mut input = testutil::input();
        testutil::set(&mut input, &services, "seed", "7");
        testutil::set(
            &mut input,
            &services,
            "prompt",
            "<embed:easy-negative> portrait",
        );
        input.preparse_prompts(&services).unwrap();
        let meta = gen_metadata_object(&input, &services);
        assert_eq!(meta["prompt"], json!("<embed:easy-negative> portrait"));
    }

    #[test]
    fn original_prompt_collapses_when_unchanged() {
        let services = testutil::services();
        let mut input = testutil::input();
        testutil::set(&mut input, &services, "seed", "7");
        testutil::set(&mut input, &services, "prompt", "plain prompt");
        input.preparse_prompts(&services).unwrap();

        let meta = gen_metadata_object(&input, &services);
        assert!(!meta.contains_key("original_prompt"));

        let mut changed = testutil::input();
        testutil::set(&mut changed, &services, "seed", "7");
        testutil::set(&mut changed, &services, "prompt", "a <random:x> b");
        changed.preparse_prompts(&services).unwrap();
        let meta = gen_metadata_object(&changed, &services);
        assert_eq!(meta["original_prompt"], json!("a <random:x> b"));
        assert_eq!(meta["prompt"], json!("a x b"));
    }

    #[test]
    fn raw_metadata_is_enveloped_ascii_lf() {
        let services = testutil::services();
        let mut input = testutil::input();
        testutil::set(&mut input, &services, "prompt", "café");

        let raw = input.gen_raw_metadata(&services);
        assert!(raw.starts_with("{\n  \"sui_image_params\": {"));
        assert!(raw.contains("caf\\u00e9"));
        assert!(!raw.contains('\r'));
        assert!(raw.is_ascii());

        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["sui_image_params"]["prompt"], json!("café"));
    }
}
