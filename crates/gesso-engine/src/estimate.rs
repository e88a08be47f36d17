use indexmap::IndexMap;

use gesso_contracts::best_match_in;

use crate::sequences::SeqKey;
use crate::splitter::{find_closing, split_smart_non_empty, split_tag_interior};
use crate::Services;

const MAX_DEPTH: u32 = 1000;

pub type EstimatorFn = fn(&str, &mut EstimateContext<'_>) -> String;

/// Worst-case length estimation state. No `Input`, no RNG, no side
/// effects: sequence cursors are peeked, never advanced.
pub struct EstimateContext<'a> {
    pub services: &'a Services,
    pub pre_data: String,
    depth: u32,
}

impl<'a> EstimateContext<'a> {
    fn estimate(&mut self, text: &str) -> String {
        if self.depth >= MAX_DEPTH {
            return text.to_string();
        }
        self.depth += 1;
        let saved = std::mem::take(&mut self.pre_data);
        let out = process_estimate_pass(text, self);
        self.pre_data = saved;
        self.depth -= 1;
        out
    }
}

pub struct EstimatorRegistry {
    estimators: IndexMap<&'static str, EstimatorFn>,
}

impl Default for EstimatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EstimatorRegistry {
    pub fn new() -> Self {
        let mut estimators: IndexMap<&'static str, EstimatorFn> = IndexMap::new();
        estimators.insert("random", est_longest_option);
        estimators.insert("alternate", est_longest_option);
        estimators.insert("alt", est_longest_option);
        estimators.insert("fromto", est_longest_option);
        estimators.insert("wildcard", est_wildcard);
        estimators.insert("wc", est_wildcard);
        estimators.insert("repeat", est_repeat);
        estimators.insert("preset", est_empty);
        estimators.insert("p", est_empty);
        estimators.insert("embed", est_empty);
        estimators.insert("embedding", est_empty);
        estimators.insert("lora", est_empty);
        estimators.insert("var", est_empty);
        estimators.insert("trigger", est_empty);
        estimators.insert("setvar", est_setvar);
        estimators.insert("break", est_break);
        estimators.insert("seq", est_seq);
        estimators.insert("wildcardseq", est_wildcard_seq);
        estimators.insert("wcs", est_wildcard_seq);
        Self { estimators }
    }

    pub fn get(&self, prefix: &str) -> Option<&EstimatorFn> {
        self.estimators.get(prefix)
    }
}

/// Worst-case expansion of `text` for layout purposes. Needs no
/// session state and leaves all sequence cursors where they are.
pub fn process_prompt_like_for_length(text: &str, services: &Services) -> String {
    let mut ctx = EstimateContext {
        services,
        pre_data: String::new(),
        depth: 0,
    };
    process_estimate_pass(&text.replace('\0', ""), &mut ctx)
}

fn process_estimate_pass(text: &str, ctx: &mut EstimateContext) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        let Some(open) = rest.find('<') else {
            out.push_str(rest);
            break;
        };
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let Some(close) = find_closing(tail) else {
            out.push_str(tail);
            break;
        };
        let raw_tag = &tail[..=close];
        let (prefix, pre_data, data) = split_tag_interior(&raw_tag[1..raw_tag.len() - 1]);
        match ctx.services.estimators.get(&prefix) {
            Some(estimator) => {
                ctx.pre_data = pre_data;
                out.push_str(&estimator(data.unwrap_or(""), ctx));
            }
            None => out.push_str(raw_tag),
        }
        rest = &tail[close + 1..];
    }
    out
}

fn est_longest_option(data: &str, ctx: &mut EstimateContext) -> String {
    split_smart_non_empty(data)
        .iter()
        .map(|part| ctx.estimate(part))
        .max_by_key(String::len)
        .unwrap_or_default()
}

fn est_wildcard(data: &str, ctx: &mut EstimateContext) -> String {
    let services = ctx.services;
    let files = services.wildcards.list_files();
    let Some(canonical) = best_match_in(data.trim(), files.iter().map(String::as_str)) else {
        return String::new();
    };
    let options = services
        .wildcards
        .get(&canonical)
        .map(|file| file.options)
        .unwrap_or_default();
    options
        .iter()
        .map(|option| ctx.estimate(option))
        .max_by_key(String::len)
        .unwrap_or_default()
}

fn est_repeat(data: &str, ctx: &mut EstimateContext) -> String {
    let Some((count_text, body)) = data.split_once(',') else {
        return String::new();
    };
    let count = count_text
        .trim()
        .parse::<f64>()
        .map(|count| (count.trunc() as i64).max(0))
        .unwrap_or(0);
    let one = ctx.estimate(body);
    let mut parts = Vec::new();
    for _ in 0..count {
        parts.push(one.clone());
    }
    parts.join(" ").trim().to_string()
}

fn est_empty(_data: &str, _ctx: &mut EstimateContext) -> String {
    String::new()
}

fn est_setvar(data: &str, ctx: &mut EstimateContext) -> String {
    ctx.estimate(data)
}

fn est_break(_data: &str, _ctx: &mut EstimateContext) -> String {
    "<break>".to_string()
}

fn est_seq(data: &str, ctx: &mut EstimateContext) -> String {
    ctx.services
        .sequences
        .peek(&SeqKey::new("seq", data))
        .unwrap_or_default()
}

fn est_wildcard_seq(data: &str, ctx: &mut EstimateContext) -> String {
    let services = ctx.services;
    let files = services.wildcards.list_files();
    let Some(canonical) = best_match_in(data.trim(), files.iter().map(String::as_str)) else {
        return String::new();
    };
    let options = services
        .wildcards
        .get(&canonical)
        .map(|file| file.options)
        .unwrap_or_default();
    services
        .sequences
        .peek(&SeqKey::for_wildcard(&canonical, &options))
        .unwrap_or_default()
}
