use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use indexmap::IndexMap;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use serde_json::{Map, Value};

use gesso_contracts::params::{NumericWidth, ParamDataType, ParamDescriptor};
use gesso_contracts::presets::Preset;
use gesso_contracts::session::Session;
use gesso_contracts::RequestEvent;

use crate::value::ParamValue;
use crate::Services;

/// The typed parameter map for one generation request.
///
/// Owned by a single request; not safe for concurrent mutation.
#[derive(Debug)]
pub struct Input {
    pub values: IndexMap<String, ParamValue>,
    pub extra_meta: Map<String, Value>,
    pub required_flags: BTreeSet<String>,
    pub refusal_reasons: BTreeSet<String>,
    pub raw_original_seed: Option<i64>,
    wildcard_rng: Option<Pcg64Mcg>,
    pub session: Arc<Session>,
}

impl Clone for Input {
    fn clone(&self) -> Self {
        // List-valued entries deep-copy with the map; the session
        // handle is shared. The RNG is re-derived lazily so a clone
        // replays the same deterministic stream from the start.
        Self {
            values: self.values.clone(),
            extra_meta: self.extra_meta.clone(),
            required_flags: self.required_flags.clone(),
            refusal_reasons: self.refusal_reasons.clone(),
            raw_original_seed: self.raw_original_seed,
            wildcard_rng: None,
            session: Arc::clone(&self.session),
        }
    }
}

impl Input {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            values: IndexMap::new(),
            extra_meta: Map::new(),
            required_flags: BTreeSet::new(),
            refusal_reasons: BTreeSet::new(),
            raw_original_seed: None,
            wildcard_rng: None,
            session,
        }
    }

    /// Normalize raw text into the descriptor's typed form and store
    /// it. Runs the clean hook, honors `ignore_if` (compared against
    /// the post-clean text), and records the feature flag.
    pub fn set_raw(
        &mut self,
        desc: &ParamDescriptor,
        raw: &str,
        services: &Services,
    ) -> Result<()> {
        let prev = self.values.get(&desc.id).map(ParamValue::to_text);
        let cleaned = match desc.clean {
            Some(clean) => clean(prev.as_deref(), raw),
            None => raw.to_string(),
        };
        if desc.ignore_if.as_deref() == Some(cleaned.as_str()) {
            self.values.shift_remove(&desc.id);
            return Ok(());
        }
        let value = parse_raw_value(desc, &cleaned, services)?;
        self.store(desc, value);
        Ok(())
    }

    /// Store an already-typed value. A clean hook forces the textual
    /// path so normalization cannot be bypassed.
    pub fn set_typed(
        &mut self,
        desc: &ParamDescriptor,
        value: ParamValue,
        services: &Services,
    ) -> Result<()> {
        if desc.clean.is_some() {
            return self.set_raw(desc, &value.to_text(), services);
        }
        let value = coerce_typed(desc, value)?;
        self.store(desc, value);
        Ok(())
    }

    fn store(&mut self, desc: &ParamDescriptor, value: ParamValue) {
        if let Some(flag) = &desc.feature_flag {
            self.required_flags.insert(flag.clone());
        }
        self.values.insert(desc.id.clone(), value);
    }

    pub fn try_get(&self, desc: &ParamDescriptor) -> Option<ParamValue> {
        self.values
            .get(&desc.id)
            .cloned()
            .map(|value| value.narrowed(desc.numeric_width))
    }

    /// Read with a textual default: a missing key is set from the
    /// default, read back through the normal coercion path, then
    /// removed again so the map itself stays sparse.
    pub fn get_or(
        &mut self,
        desc: &ParamDescriptor,
        default: &str,
        services: &Services,
    ) -> Result<Option<ParamValue>> {
        if let Some(value) = self.try_get(desc) {
            return Ok(Some(value));
        }
        if default.is_empty() {
            return Ok(None);
        }
        self.set_raw(desc, default, services)?;
        let value = self.try_get(desc);
        self.values.shift_remove(&desc.id);
        Ok(value)
    }

    pub fn remove(&mut self, desc: &ParamDescriptor) {
        self.values.shift_remove(&desc.id);
    }

    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        for (id, value) in &self.values {
            out.insert(id.clone(), value.to_json());
        }
        Value::Object(out)
    }

    /// Drive `set_raw` from a JSON object of id → value, the way an
    /// HTTP layer hands a request over.
    pub fn load_json_object(
        &mut self,
        payload: &Map<String, Value>,
        services: &Services,
    ) -> Result<()> {
        for (id, value) in payload {
            let desc = services.params.require(id)?;
            let Some(text) = json_value_text(desc, value) else {
                continue;
            };
            self.set_raw(desc, &text, services)?;
        }
        Ok(())
    }

    pub fn apply_preset(
        &mut self,
        preset: &Preset,
        services: &Services,
        skip: &[&str],
    ) -> Result<()> {
        for (id, text) in &preset.param_map {
            if skip.contains(&id.as_str()) {
                continue;
            }
            let desc = services.params.require(id)?;
            self.set_raw(desc, text, services)?;
        }
        Ok(())
    }

    /// The request-scoped deterministic RNG used by random/wildcard
    /// tags. Seeded from `wildcard_seed` when set, else
    /// `seed + variation_seed + 17`, reduced into 31-bit range;
    /// stable once created.
    pub fn wildcard_rng(&mut self) -> &mut Pcg64Mcg {
        if self.wildcard_rng.is_none() {
            let seed = match self.get_i64("wildcard_seed") {
                Some(seed) => seed,
                None => {
                    self.get_i64("seed").unwrap_or(0)
                        + self.get_i64("variation_seed").unwrap_or(0)
                        + 17
                }
            };
            let capped = seed.rem_euclid(1 << 31);
            self.wildcard_rng = Some(Pcg64Mcg::seed_from_u64(capped as u64));
        }
        self.wildcard_rng.as_mut().expect("wildcard rng initialized")
    }

    pub fn get_image_width(&self) -> i32 {
        if let Some((width, _)) = self.raw_resolution_dims() {
            return width;
        }
        self.get_i64("width").map(|v| v as i32).unwrap_or(512)
    }

    pub fn get_image_height(&self) -> i32 {
        if let Some((_, height)) = self.raw_resolution_dims() {
            return height;
        }
        let base = self.get_i64("height").map(|v| v as i32).unwrap_or(512);
        let mult = self
            .value_of("alt_resolution_height_mult")
            .and_then(ParamValue::as_f64)
            .unwrap_or(1.0);
        (f64::from(base) * mult).round() as i32
    }

    fn raw_resolution_dims(&self) -> Option<(i32, i32)> {
        let raw = self.value_of("raw_resolution").and_then(ParamValue::as_str)?;
        parse_resolution(raw)
    }

    /// Record a soft parser warning: kept in
    /// `extra_meta["parser_warnings"]` and mirrored to the session's
    /// event log when one is attached.
    pub fn add_parser_warning(&mut self, param: &str, message: impl Into<String>) {
        let message = message.into();
        let warnings = self
            .extra_meta
            .entry("parser_warnings")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(rows) = warnings {
            rows.push(Value::String(message.clone()));
        }
        self.log_event(RequestEvent::ParserWarning {
            param: param.to_string(),
            message,
        });
    }

    /// Best-effort append to the session's event log, when one is
    /// attached.
    pub fn log_event(&self, event: RequestEvent) {
        if let Some(log) = &self.session.events {
            let _ = log.record(event);
        }
    }

    /// Append `name` to a list in `extra_meta` if not already there.
    pub fn record_used(&mut self, meta_key: &str, name: &str) {
        let entry = self
            .extra_meta
            .entry(meta_key)
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(rows) = entry {
            if !rows.iter().any(|row| row.as_str() == Some(name)) {
                rows.push(Value::String(name.to_string()));
            }
        }
    }

    pub(crate) fn value_of(&self, id: &str) -> Option<&ParamValue> {
        self.values.get(id)
    }

    pub(crate) fn get_i64(&self, id: &str) -> Option<i64> {
        self.value_of(id).and_then(ParamValue::as_i64)
    }

    pub(crate) fn get_text(&self, id: &str) -> Option<String> {
        self.value_of(id).map(ParamValue::to_text)
    }

    pub(crate) fn get_list(&self, id: &str) -> Vec<String> {
        self.value_of(id)
            .and_then(ParamValue::as_list)
            .map(<[String]>::to_vec)
            .unwrap_or_default()
    }

    pub fn preparse_prompts(&mut self, services: &Services) -> Result<()> {
        crate::interpreter::preparse_prompts(self, services)
    }

    pub fn apply_special_logic(&mut self, services: &Services) -> Result<()> {
        crate::special::apply_special_logic(self, services)
    }

    pub fn gen_metadata_object(&self, services: &Services) -> Map<String, Value> {
        crate::metadata::gen_metadata_object(self, services)
    }

    pub fn gen_raw_metadata(&self, services: &Services) -> String {
        crate::metadata::gen_raw_metadata(self, services)
    }
}

fn parse_raw_value(
    desc: &ParamDescriptor,
    text: &str,
    services: &Services,
) -> Result<ParamValue> {
    match desc.data_type {
        ParamDataType::Integer => {
            let parsed: i64 = text
                .trim()
                .parse()
                .with_context(|| format!("parameter '{}': invalid integer '{text}'", desc.id))?;
            Ok(match desc.numeric_width {
                NumericWidth::W32 => {
                    let narrow = i32::try_from(parsed).with_context(|| {
                        format!("parameter '{}': integer '{text}' out of range", desc.id)
                    })?;
                    ParamValue::Int32(narrow)
                }
                NumericWidth::W64 => ParamValue::Int64(parsed),
            })
        }
        ParamDataType::Decimal => {
            let parsed: f64 = text
                .trim()
                .parse()
                .with_context(|| format!("parameter '{}': invalid decimal '{text}'", desc.id))?;
            Ok(match desc.numeric_width {
                NumericWidth::W32 => ParamValue::Float(parsed as f32),
                NumericWidth::W64 => ParamValue::Double(parsed),
            })
        }
        ParamDataType::Boolean => match text.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(ParamValue::Bool(true)),
            "false" => Ok(ParamValue::Bool(false)),
            _ => bail!("parameter '{}': invalid boolean '{text}'", desc.id),
        },
        ParamDataType::Text | ParamDataType::Dropdown => Ok(ParamValue::Text(text.to_string())),
        ParamDataType::Image => {
            decode_image_payload(&desc.id, text)?;
            Ok(ParamValue::Image(text.to_string()))
        }
        ParamDataType::ImageList => {
            let mut rows = Vec::new();
            for part in text.split('|') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                decode_image_payload(&desc.id, part)?;
                rows.push(part.to_string());
            }
            Ok(ParamValue::ImageList(rows))
        }
        ParamDataType::List => Ok(ParamValue::List(
            text.split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect(),
        )),
        ParamDataType::Model => {
            let subtype = desc.subtype.as_deref().unwrap_or("Stable-Diffusion");
            let registry = services.registry_for(subtype).ok_or_else(|| {
                anyhow::anyhow!("parameter '{}': no asset registry for subtype '{subtype}'", desc.id)
            })?;
            let spec = registry.best_match(text).ok_or_else(|| {
                anyhow::anyhow!("parameter '{}': no model matching '{text}'", desc.id)
            })?;
            Ok(ParamValue::Model(spec.clone()))
        }
    }
}

fn coerce_typed(desc: &ParamDescriptor, value: ParamValue) -> Result<ParamValue> {
    let value = value.narrowed(desc.numeric_width);
    let ok = match (desc.data_type, &value) {
        (ParamDataType::Integer, ParamValue::Int64(_)) => {
            desc.numeric_width == NumericWidth::W64
        }
        (ParamDataType::Integer, ParamValue::Int32(_)) => {
            desc.numeric_width == NumericWidth::W32
        }
        (ParamDataType::Decimal, ParamValue::Double(_)) => {
            desc.numeric_width == NumericWidth::W64
        }
        (ParamDataType::Decimal, ParamValue::Float(_)) => {
            desc.numeric_width == NumericWidth::W32
        }
        (ParamDataType::Boolean, ParamValue::Bool(_)) => true,
        (ParamDataType::Text | ParamDataType::Dropdown, ParamValue::Text(_)) => true,
        (ParamDataType::Image, ParamValue::Image(_)) => true,
        (ParamDataType::ImageList, ParamValue::ImageList(_)) => true,
        (ParamDataType::Model, ParamValue::Model(_) | ParamValue::ModelList(_)) => true,
        (ParamDataType::List, ParamValue::List(_)) => true,
        _ => false,
    };
    if !ok {
        bail!(
            "parameter '{}': value of type {} does not fit its declared type",
            desc.id,
            value.type_name()
        );
    }
    Ok(value)
}

fn decode_image_payload(param: &str, text: &str) -> Result<Vec<u8>> {
    let payload = match text.find(";base64,") {
        Some(idx) => &text[idx + ";base64,".len()..],
        None => text,
    };
    if payload.is_empty() {
        bail!("parameter '{param}': empty image payload");
    }
    BASE64
        .decode(payload)
        .with_context(|| format!("parameter '{param}': invalid image payload"))
}

fn json_value_text(desc: &ParamDescriptor, value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Array(rows) => {
            let parts = rows
                .iter()
                .filter_map(|row| match row {
                    Value::String(text) => Some(text.clone()),
                    Value::Number(number) => Some(number.to_string()),
                    _ => None,
                })
                .collect::<Vec<String>>();
            let joiner = if desc.data_type == ParamDataType::ImageList {
                "|"
            } else {
                ","
            };
            Some(parts.join(joiner))
        }
        Value::Object(_) => None,
    }
}

pub(crate) fn parse_resolution(raw: &str) -> Option<(i32, i32)> {
    let (width, height) = raw.split_once('x')?;
    Some((width.trim().parse().ok()?, height.trim().parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn set_raw_parses_by_descriptor_type() -> Result<()> {
        let services = testutil::services();
        let mut input = testutil::input();

        input.set_raw(services.params.require("seed")?, "42", &services)?;
        input.set_raw(services.params.require("steps")?, "30", &services)?;
        input.set_raw(services.params.require("cfg_scale")?, "7.5", &services)?;
        input.set_raw(services.params.require("loras")?, "a, b,", &services)?;

        assert_eq!(input.value_of("seed"), Some(&ParamValue::Int64(42)));
        assert_eq!(input.value_of("steps"), Some(&ParamValue::Int32(30)));
        assert_eq!(input.value_of("cfg_scale"), Some(&ParamValue::Double(7.5)));
        assert_eq!(
            input.value_of("loras"),
            Some(&ParamValue::List(vec!["a".to_string(), "b".to_string()]))
        );
        Ok(())
    }

    #[test]
    fn malformed_numeric_names_the_parameter() {
        let services = testutil::services();
        let mut input = testutil::input();
        let err = input
            .set_raw(services.params.require("seed").unwrap(), "forty", &services)
            .unwrap_err();
        assert!(err.to_string().contains("seed"));
        assert!(input.value_of("seed").is_none());
    }

    #[test]
    fn ignore_if_compares_post_clean_value() -> Result<()> {
        let services = testutil::services();
        let mut input = testutil::input();
        let desc = services.params.require("refiner_model")?;

        // ignore_if deletes rather than stores
        input.set_raw(desc, "(none)", &services)?;
        assert!(input.value_of("refiner_model").is_none());

        let variation = services.params.require("variation_seed")?;
        input.set_raw(variation, "7", &services)?;
        assert!(input.value_of("variation_seed").is_some());
        input.set_raw(variation, "-1", &services)?;
        assert!(input.value_of("variation_seed").is_none());
        Ok(())
    }

    #[test]
    fn feature_flags_are_monotone() -> Result<()> {
        let services = testutil::services();
        let mut input = testutil::input();
        let desc = services.params.require("variation_seed")?;
        input.set_raw(desc, "9", &services)?;
        assert!(input.required_flags.contains("variation_seed"));
        input.remove(desc);
        assert!(input.required_flags.contains("variation_seed"));
        Ok(())
    }

    #[test]
    fn model_resolution_stores_canonical_handle() -> Result<()> {
        let services = testutil::services();
        let mut input = testutil::input();
        let desc = services.params.require("model")?;
        input.set_raw(desc, "sd_xl_base_1.0", &services)?;
        assert_eq!(
            input.value_of("model").and_then(ParamValue::as_model).map(|m| m.name.as_str()),
            Some("OfficialStableDiffusion/sd_xl_base_1.0")
        );

        let err = input.set_raw(desc, "not-a-model", &services).unwrap_err();
        assert!(err.to_string().contains("model"));
        Ok(())
    }

    #[test]
    fn get_or_runs_default_through_coercion_then_forgets() -> Result<()> {
        let services = testutil::services();
        let mut input = testutil::input();
        let desc = services.params.require("steps")?;

        let value = input.get_or(desc, "20", &services)?;
        assert_eq!(value, Some(ParamValue::Int32(20)));
        assert!(input.value_of("steps").is_none());

        input.set_raw(desc, "12", &services)?;
        assert_eq!(input.get_or(desc, "20", &services)?, Some(ParamValue::Int32(12)));
        Ok(())
    }

    #[test]
    fn narrowing_applies_on_read() -> Result<()> {
        let services = testutil::services();
        let mut input = testutil::input();
        let desc = services.params.require("width")?;
        input.set_raw(desc, "768", &services)?;
        assert_eq!(input.try_get(desc), Some(ParamValue::Int32(768)));
        Ok(())
    }

    #[test]
    fn clone_deep_copies_lists_and_shares_session() -> Result<()> {
        let services = testutil::services();
        let mut input = testutil::input();
        input.set_raw(services.params.require("loras")?, "a,b", &services)?;

        let mut copy = input.clone();
        copy.set_raw(services.params.require("loras")?, "c", &services)?;
        assert_eq!(input.get_list("loras"), vec!["a", "b"]);
        assert_eq!(copy.get_list("loras"), vec!["c"]);
        assert!(Arc::ptr_eq(&input.session, &copy.session));
        Ok(())
    }

    #[test]
    fn wildcard_rng_is_deterministic_and_stable() -> Result<()> {
        use rand::Rng;

        let services = testutil::services();
        let mut one = testutil::input();
        let mut two = testutil::input();
        one.set_raw(services.params.require("seed")?, "42", &services)?;
        two.set_raw(services.params.require("seed")?, "42", &services)?;

        let a: u32 = one.wildcard_rng().random_range(0..1_000_000);
        let b: u32 = two.wildcard_rng().random_range(0..1_000_000);
        assert_eq!(a, b);

        // seed changes after materialization must not reseat the RNG
        one.set_raw(services.params.require("seed")?, "7", &services)?;
        let c: u32 = one.wildcard_rng().random_range(0..1_000_000);
        let d: u32 = two.wildcard_rng().random_range(0..1_000_000);
        assert_eq!(c, d);
        Ok(())
    }

    #[test]
    fn image_payloads_validate_base64() -> Result<()> {
        let services = testutil::services();
        let mut input = testutil::input();
        let desc = services.params.require("init_image")?;

        input.set_raw(desc, "aGVsbG8=", &services)?;
        assert!(matches!(input.value_of("init_image"), Some(ParamValue::Image(_))));

        assert!(input
            .set_raw(desc, "data:image/png;base64,aGVsbG8=", &services)
            .is_ok());
        assert!(input.set_raw(desc, "not base64!!!", &services).is_err());
        Ok(())
    }

    #[test]
    fn resolution_helpers_prefer_raw_resolution() -> Result<()> {
        let services = testutil::services();
        let mut input = testutil::input();
        assert_eq!(input.get_image_width(), 512);
        assert_eq!(input.get_image_height(), 512);

        input.set_raw(services.params.require("height")?, "600", &services)?;
        input.set_raw(
            services.params.require("alt_resolution_height_mult")?,
            "1.5",
            &services,
        )?;
        assert_eq!(input.get_image_height(), 900);

        input.set_raw(services.params.require("raw_resolution")?, "1024x768", &services)?;
        assert_eq!(input.get_image_width(), 1024);
        assert_eq!(input.get_image_height(), 768);
        Ok(())
    }

    #[test]
    fn parser_warnings_mirror_to_the_session_event_log() -> Result<()> {
        use gesso_contracts::EventLog;

        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let session = Session::new("tester").with_events(EventLog::new(&path, "req-9"));
        let mut input = Input::new(Arc::new(session));

        input.add_parser_warning("prompt", "Unknown wildcard 'x'");

        let content = std::fs::read_to_string(&path)?;
        let line: Value = serde_json::from_str(content.lines().next().unwrap_or(""))?;
        assert_eq!(line["event"], "parser_warning");
        assert_eq!(line["request_id"], "req-9");
        assert_eq!(line["param"], "prompt");
        assert_eq!(line["message"], "Unknown wildcard 'x'");
        Ok(())
    }

    #[test]
    fn json_roundtrip_via_load_json_object() -> Result<()> {
        let services = testutil::services();
        let mut input = testutil::input();
        input.set_raw(services.params.require("prompt")?, "a cat", &services)?;
        input.set_raw(services.params.require("seed")?, "9", &services)?;
        input.set_raw(services.params.require("loras")?, "a,b", &services)?;

        let first = input.to_json();
        let mut reloaded = testutil::input();
        reloaded.load_json_object(first.as_object().unwrap(), &services)?;
        assert_eq!(reloaded.to_json(), first);
        Ok(())
    }
}
