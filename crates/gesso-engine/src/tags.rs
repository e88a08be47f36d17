use indexmap::IndexMap;
use rand::Rng;
use rand_pcg::Pcg64Mcg;

use gesso_contracts::best_match_in;

use crate::interpreter::{ParseContext, Phase};
use crate::sequences::SeqKey;
use crate::splitter::split_smart_non_empty;
use crate::value::ParamValue;

/// What a handler did with its tag.
///
/// `Text` replaces the tag (empty string erases it). `Splice` wraps
/// the surrounding parameter value: `before` is prepended to the
/// final result and `after` appended, while the tag itself
/// contributes nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagResult {
    Text(String),
    Splice { before: String, after: String },
}

pub type HandlerFn = fn(&str, &mut ParseContext<'_>) -> Option<TagResult>;

/// A registered handler, tagged with the pass it runs in. Basic
/// handlers fire with or without `:data`; Main and Post require it.
#[derive(Clone, Copy)]
pub enum TagHandler {
    Basic(HandlerFn),
    Main(HandlerFn),
    Post(HandlerFn),
}

impl TagHandler {
    pub fn phase(&self) -> Phase {
        match self {
            TagHandler::Basic(_) => Phase::Basic,
            TagHandler::Main(_) => Phase::Main,
            TagHandler::Post(_) => Phase::Post,
        }
    }

    pub fn requires_data(&self) -> bool {
        !matches!(self, TagHandler::Basic(_))
    }

    pub fn func(&self) -> HandlerFn {
        match self {
            TagHandler::Basic(f) | TagHandler::Main(f) | TagHandler::Post(f) => *f,
        }
    }
}

pub struct TagRegistry {
    handlers: IndexMap<&'static str, TagHandler>,
}

impl Default for TagRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TagRegistry {
    pub fn new() -> Self {
        let mut handlers: IndexMap<&'static str, TagHandler> = IndexMap::new();

        handlers.insert("break", TagHandler::Basic(tag_break));
        handlers.insert("trigger", TagHandler::Basic(tag_trigger));

        handlers.insert("random", TagHandler::Main(tag_random));
        handlers.insert("alternate", TagHandler::Main(tag_alternate));
        handlers.insert("alt", TagHandler::Main(tag_alternate));
        handlers.insert("fromto", TagHandler::Main(tag_fromto));
        handlers.insert("wildcard", TagHandler::Main(tag_wildcard));
        handlers.insert("wc", TagHandler::Main(tag_wildcard));
        handlers.insert("repeat", TagHandler::Main(tag_repeat));
        handlers.insert("preset", TagHandler::Main(tag_preset));
        handlers.insert("p", TagHandler::Main(tag_preset));
        handlers.insert("embed", TagHandler::Main(tag_embed));
        handlers.insert("embedding", TagHandler::Main(tag_embed));
        handlers.insert("setvar", TagHandler::Main(tag_setvar));
        handlers.insert("var", TagHandler::Main(tag_var));
        handlers.insert("seq", TagHandler::Main(tag_seq));
        handlers.insert("wildcardseq", TagHandler::Main(tag_wildcard_seq));
        handlers.insert("wcs", TagHandler::Main(tag_wildcard_seq));

        handlers.insert("lora", TagHandler::Post(tag_lora));
        handlers.insert("segment", TagHandler::Post(tag_section));
        handlers.insert("object", TagHandler::Post(tag_section));
        handlers.insert("region", TagHandler::Post(tag_section));

        Self { handlers }
    }

    pub fn get(&self, prefix: &str) -> Option<&TagHandler> {
        self.handlers.get(prefix)
    }
}

fn tag_break(_data: &str, _ctx: &mut ParseContext) -> Option<TagResult> {
    Some(TagResult::Text("<break>".to_string()))
}

fn tag_trigger(_data: &str, ctx: &mut ParseContext) -> Option<TagResult> {
    let services = ctx.services;
    let mut phrases: Vec<String> = Vec::new();
    if let Some(spec) = ctx.input.value_of("model").and_then(ParamValue::as_model) {
        if let Some(phrase) = spec
            .trigger_phrase
            .clone()
            .or_else(|| services.models.trigger_phrase(&spec.name).map(str::to_string))
        {
            phrases.push(phrase);
        }
    }
    for name in ctx.input.get_list("loras") {
        if let Some(phrase) = services.loras.trigger_phrase(&name) {
            phrases.push(phrase.to_string());
        }
    }
    let mut joined = phrases.join(", ");
    if !joined.is_empty() {
        joined.push_str(", ");
    }
    Some(TagResult::Text(format!("{joined}\0triggerextra")))
}

fn tag_random(data: &str, ctx: &mut ParseContext) -> Option<TagResult> {
    let options = split_smart_non_empty(data);
    if options.is_empty() {
        ctx.warn("random tag has no options");
        return None;
    }
    draw_options(&options, ctx)
}

fn tag_alternate(data: &str, ctx: &mut ParseContext) -> Option<TagResult> {
    let parts = split_smart_non_empty(data);
    if parts.is_empty() {
        ctx.warn("alternate tag has no options");
        return None;
    }
    let parsed = parts
        .iter()
        .map(|part| ctx.parse(part))
        .collect::<Vec<String>>();
    Some(TagResult::Text(format!("[{}]", parsed.join("|"))))
}

fn tag_fromto(data: &str, ctx: &mut ParseContext) -> Option<TagResult> {
    let step = ctx.pre_data.trim().to_string();
    if step.parse::<f64>().is_err() {
        ctx.warn(format!("fromto step '{step}' is not numeric"));
        return None;
    }
    let parts = split_smart_non_empty(data);
    if parts.len() != 2 {
        ctx.warn("fromto tag requires exactly two parts");
        return None;
    }
    let from = ctx.parse(&parts[0]);
    let to = ctx.parse(&parts[1]);
    Some(TagResult::Text(format!("[{from}:{to}:{step}]")))
}

fn tag_wildcard(data: &str, ctx: &mut ParseContext) -> Option<TagResult> {
    let services = ctx.services;
    let name = data.trim();
    let files = services.wildcards.list_files();
    let Some(canonical) = best_match_in(name, files.iter().map(String::as_str)) else {
        ctx.warn(format!("Unknown wildcard '{name}'"));
        return None;
    };
    let options = services
        .wildcards
        .get(&canonical)
        .map(|file| file.options)
        .unwrap_or_default();
    if options.is_empty() {
        ctx.warn(format!("Wildcard '{canonical}' has no options"));
        return None;
    }
    ctx.input.record_used("used_wildcards", &canonical);
    draw_options(&options, ctx)
}

fn tag_repeat(data: &str, ctx: &mut ParseContext) -> Option<TagResult> {
    let Some((count_text, body)) = data.split_once(',') else {
        ctx.warn("repeat tag requires '<count>,<text>'");
        return None;
    };
    let Ok(count) = count_text.trim().parse::<f64>() else {
        ctx.warn(format!("repeat count '{}' is not numeric", count_text.trim()));
        return None;
    };
    // fractional counts truncate toward zero
    let count = (count.trunc() as i64).max(0);
    let mut parts = Vec::new();
    for _ in 0..count {
        parts.push(ctx.parse(body));
    }
    Some(TagResult::Text(parts.join(" ").trim().to_string()))
}

fn tag_preset(data: &str, ctx: &mut ParseContext) -> Option<TagResult> {
    if ctx.input.session.interrupt.is_interrupted() {
        ctx.fail(anyhow::anyhow!("request interrupted during preset lookup"));
        return None;
    }
    let services = ctx.services;
    let name = data.trim();
    let Some(preset) = services.presets.best_match(name).cloned() else {
        ctx.warn(format!("Unknown preset '{name}'"));
        return None;
    };
    let param_id = ctx.param_id.clone();
    if let Err(err) = ctx
        .input
        .apply_preset(&preset, services, &[param_id.as_str()])
    {
        ctx.warn(format!("Preset '{}' failed to apply: {err}", preset.name));
    }
    if let Some(model_name) = preset.param_map.get("model") {
        if let Some(spec) = services.models.best_match(model_name) {
            if let Some(phrase) = spec.trigger_phrase.clone() {
                ctx.trigger_phrase_extra.push_str(&format!("{phrase}, "));
            }
        }
    }
    match preset.param_map.get(&param_id) {
        Some(template) => {
            let (before, after) = template
                .split_once("{value}")
                .unwrap_or((template.as_str(), ""));
            Some(TagResult::Splice {
                before: before.to_string(),
                after: after.to_string(),
            })
        }
        None => Some(TagResult::Text(String::new())),
    }
}

fn tag_embed(data: &str, ctx: &mut ParseContext) -> Option<TagResult> {
    let name = data.trim().to_string();
    let names = ctx.embedding_names();
    let Some(canonical) = best_match_in(&name, names.iter().map(String::as_str)) else {
        ctx.warn(format!("Unknown embedding '{name}'"));
        return Some(TagResult::Text(String::new()));
    };
    if canonical.contains(' ') {
        ctx.warn(format!(
            "Embedding name '{canonical}' contains a space; downstream prompt syntax may not parse it"
        ));
    }
    ctx.input.record_used("used_embeddings", &canonical);
    Some(TagResult::Text(format!("\0swarmembed:{canonical}\0end")))
}

fn tag_setvar(data: &str, ctx: &mut ParseContext) -> Option<TagResult> {
    let name = ctx.pre_data.trim().to_string();
    if name.is_empty() {
        ctx.warn("setvar tag requires a variable name");
        return None;
    }
    let parsed = ctx.parse(data);
    ctx.variables.insert(name, parsed.clone());
    Some(TagResult::Text(parsed))
}

fn tag_var(data: &str, ctx: &mut ParseContext) -> Option<TagResult> {
    let name = data.trim();
    if let Some(value) = ctx.variables.get(name).cloned() {
        return Some(TagResult::Text(value));
    }
    ctx.warn(format!("Variable '{name}' is not set"));
    Some(TagResult::Text(String::new()))
}

fn tag_seq(data: &str, ctx: &mut ParseContext) -> Option<TagResult> {
    let services = ctx.services;
    let key = SeqKey::new("seq", data);
    match services
        .sequences
        .advance(key, || split_smart_non_empty(data))
    {
        Some(value) => Some(TagResult::Text(value)),
        None => {
            ctx.warn("seq tag has no options");
            None
        }
    }
}

fn tag_wildcard_seq(data: &str, ctx: &mut ParseContext) -> Option<TagResult> {
    let services = ctx.services;
    let name = data.trim();
    let files = services.wildcards.list_files();
    let Some(canonical) = best_match_in(name, files.iter().map(String::as_str)) else {
        ctx.warn(format!("Unknown wildcard '{name}'"));
        return None;
    };
    let options = services
        .wildcards
        .get(&canonical)
        .map(|file| file.options)
        .unwrap_or_default();
    if options.is_empty() {
        ctx.warn(format!("Wildcard '{canonical}' has no options"));
        return None;
    }
    ctx.input.record_used("used_wildcards", &canonical);
    let key = SeqKey::for_wildcard(&canonical, &options);
    let value = services.sequences.advance(key, || options.clone())?;
    Some(TagResult::Text(ctx.parse(&value)))
}

fn tag_lora(data: &str, ctx: &mut ParseContext) -> Option<TagResult> {
    let services = ctx.services;
    let (name, strength) = match data.rsplit_once(':') {
        Some((head, tail)) if tail.trim().parse::<f64>().is_ok() => {
            (head.trim().to_string(), tail.trim().to_string())
        }
        _ => (data.trim().to_string(), "1".to_string()),
    };
    let names = ctx.lora_names();
    let Some(canonical) = best_match_in(&name, names.iter().map(String::as_str)) else {
        ctx.warn(format!("Unknown LoRA '{name}'"));
        return None;
    };

    let mut loras = ctx.input.get_list("loras");
    let mut weights = ctx.input.get_list("lora_weights");
    let confinement = ctx
        .input
        .value_of("lora_section_confinement")
        .and_then(ParamValue::as_list)
        .map(<[String]>::to_vec);
    loras.push(canonical.clone());
    weights.push(strength);
    let mut confinement =
        confinement.unwrap_or_else(|| vec!["-1".to_string(); loras.len() - 1]);
    confinement.push(ctx.section_id.to_string());

    for (id, rows) in [
        ("loras", loras),
        ("lora_weights", weights),
        ("lora_section_confinement", confinement),
    ] {
        let Ok(desc) = services.params.require(id) else {
            ctx.warn(format!("Missing '{id}' parameter descriptor"));
            return None;
        };
        if let Err(err) = ctx
            .input
            .set_typed(desc, ParamValue::List(rows), services)
        {
            ctx.warn(format!("Failed to update '{id}': {err}"));
            return None;
        }
    }

    if let Some(phrase) = services.loras.trigger_phrase(&canonical) {
        ctx.trigger_phrase_extra.push_str(&format!("{phrase}, "));
    }
    Some(TagResult::Text(String::new()))
}

fn tag_section(data: &str, ctx: &mut ParseContext) -> Option<TagResult> {
    ctx.section_id += 1;
    let interior = &ctx.raw_current_tag[1..ctx.raw_current_tag.len() - 1];
    let head = interior
        .split_once(':')
        .map(|(head, _)| head)
        .unwrap_or(interior)
        .to_string();
    let base = match data.rfind("//cid=") {
        Some(idx) => &data[..idx],
        None => data,
    };
    Some(TagResult::Text(format!(
        "<{head}:{base}//cid={}>",
        ctx.section_id
    )))
}

/// Shared draw logic for `random` and `wildcard`: count and joiner
/// from predata, draw without replacement refilling on exhaustion,
/// `lo-hi` options short-circuit to a random number in the range.
fn draw_options(options: &[String], ctx: &mut ParseContext) -> Option<TagResult> {
    let (count, joiner) = parse_draw_predata(ctx)?;
    let mut available: Vec<usize> = (0..options.len()).collect();
    let mut picked = Vec::new();
    for _ in 0..count {
        if available.is_empty() {
            available = (0..options.len()).collect();
        }
        let slot = ctx.input.wildcard_rng().random_range(0..available.len());
        let choice = options[available.swap_remove(slot)].clone();
        if let Some(value) = numeric_range_value(&choice, ctx.input.wildcard_rng()) {
            return Some(TagResult::Text(value));
        }
        picked.push(ctx.parse(&choice));
    }
    Some(TagResult::Text(picked.join(joiner)))
}

fn parse_draw_predata(ctx: &mut ParseContext) -> Option<(usize, &'static str)> {
    let pre_data = ctx.pre_data.clone();
    let trimmed = pre_data.trim();
    if trimmed.is_empty() {
        return Some((1, " "));
    }
    let joiner = if trimmed.ends_with(',') { ", " } else { " " };
    let digits = trimmed.trim_end_matches(',').trim();
    if digits.is_empty() {
        return Some((1, joiner));
    }
    match digits.parse::<usize>() {
        Ok(count) if count >= 1 => Some((count, joiner)),
        _ => {
            ctx.warn(format!("Invalid count '{pre_data}' in tag predata"));
            None
        }
    }
}

fn numeric_range_value(option: &str, rng: &mut Pcg64Mcg) -> Option<String> {
    let dash = option
        .char_indices()
        .skip(1)
        .find(|(_, ch)| *ch == '-')
        .map(|(idx, _)| idx)?;
    let (lo, hi) = (option[..dash].trim(), option[dash + 1..].trim());
    if let (Ok(a), Ok(b)) = (lo.parse::<i64>(), hi.parse::<i64>()) {
        let (a, b) = if a <= b { (a, b) } else { (b, a) };
        return Some(rng.random_range(a..=b).to_string());
    }
    if let (Ok(a), Ok(b)) = (lo.parse::<f64>(), hi.parse::<f64>()) {
        let (a, b) = if a <= b { (a, b) } else { (b, a) };
        return Some(format!("{}", rng.random_range(a..=b)));
    }
    None
}
