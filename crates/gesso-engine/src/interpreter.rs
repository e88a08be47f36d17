use std::collections::HashMap;

use anyhow::{bail, Result};
use gesso_contracts::RequestEvent;
use serde_json::Value;

use crate::input::Input;
use crate::splitter::{find_closing, split_tag_interior};
use crate::tags::TagResult;
use crate::value::ParamValue;
use crate::Services;

/// Parameters run through the interpreter, in processing order.
pub const PROMPT_LIKE_PARAMS: &[&str] = &["prompt", "negativeprompt"];

const MAX_DEPTH: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Basic,
    Main,
    Post,
}

/// Per-parse state threaded through every tag handler.
pub struct ParseContext<'a> {
    pub input: &'a mut Input,
    pub services: &'a Services,
    pub param_id: String,
    pub phase: Phase,
    pub variables: HashMap<String, String>,
    pub section_id: i64,
    pub depth: u32,
    depth_warned: bool,
    pub pre_data: String,
    pub raw_current_tag: String,
    pub trigger_phrase_extra: String,
    pub add_before: String,
    pub add_after: String,
    pub failure: Option<anyhow::Error>,
    embed_names: Option<Vec<String>>,
    lora_names: Option<Vec<String>>,
}

impl<'a> ParseContext<'a> {
    pub fn new(input: &'a mut Input, services: &'a Services, param_id: &str) -> Self {
        Self {
            input,
            services,
            param_id: param_id.to_string(),
            phase: Phase::Basic,
            variables: HashMap::new(),
            section_id: 0,
            depth: 0,
            depth_warned: false,
            pre_data: String::new(),
            raw_current_tag: String::new(),
            trigger_phrase_extra: String::new(),
            add_before: String::new(),
            add_after: String::new(),
            failure: None,
            embed_names: None,
            lora_names: None,
        }
    }

    /// Recursively expand nested tag data under the current phase.
    /// Handlers MUST route nested data through here so the depth cap
    /// applies.
    pub fn parse(&mut self, text: &str) -> String {
        if self.depth >= MAX_DEPTH {
            if !self.depth_warned {
                self.depth_warned = true;
                self.warn("Recursive prompt tags exceeded the depth limit; expansion stopped");
            }
            return text.to_string();
        }
        self.depth += 1;
        let saved_pre = std::mem::take(&mut self.pre_data);
        let saved_raw = std::mem::take(&mut self.raw_current_tag);
        let out = process_pass(text, self);
        self.pre_data = saved_pre;
        self.raw_current_tag = saved_raw;
        self.depth -= 1;
        out
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let param = self.param_id.clone();
        self.input.add_parser_warning(&param, message);
    }

    pub fn fail(&mut self, error: anyhow::Error) {
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    pub fn embedding_names(&mut self) -> Vec<String> {
        if self.embed_names.is_none() {
            self.embed_names = Some(self.services.embeddings.list_names());
        }
        self.embed_names.clone().unwrap_or_default()
    }

    pub fn lora_names(&mut self) -> Vec<String> {
        if self.lora_names.is_none() {
            self.lora_names = Some(self.services.loras.list_names());
        }
        self.lora_names.clone().unwrap_or_default()
    }
}

/// Run one phase's handlers over `text`. Handler output is appended
/// without re-scanning, so literal re-emission passes through
/// untouched on this pass.
pub(crate) fn process_pass(text: &str, ctx: &mut ParseContext) -> String {
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
        match dispatch(raw_tag, ctx) {
            Some(TagResult::Text(replacement)) => out.push_str(&replacement),
            Some(TagResult::Splice { before, after }) => {
                ctx.add_before.push_str(&before);
                ctx.add_after.push_str(&after);
            }
            None => out.push_str(raw_tag),
        }
        rest = &tail[close + 1..];
        if ctx.failure.is_some() {
            out.push_str(rest);
            break;
        }
    }
    out
}

fn dispatch(raw_tag: &str, ctx: &mut ParseContext) -> Option<TagResult> {
    let interior = &raw_tag[1..raw_tag.len() - 1];
    let (prefix, pre_data, data) = split_tag_interior(interior);
    let handler = ctx.services.tags.get(&prefix)?;
    if handler.phase() != ctx.phase {
        return None;
    }
    let data = match data {
        Some(data) => data,
        None if handler.requires_data() => return None,
        None => "",
    };
    ctx.pre_data = pre_data;
    ctx.raw_current_tag = raw_tag.to_string();
    handler.func()(data, ctx)
}

/// Expand one prompt-like parameter: basic, main, then post pass,
/// splice accumulation, and trigger-phrase substitution.
pub fn process_prompt_like(
    input: &mut Input,
    param_id: &str,
    services: &Services,
) -> Result<String> {
    let raw = input.get_text(param_id).unwrap_or_default();
    let mut text = raw.replace('\0', "");
    let mut ctx = ParseContext::new(input, services, param_id);
    for phase in [Phase::Basic, Phase::Main, Phase::Post] {
        if ctx.input.session.interrupt.is_interrupted() {
            bail!("request interrupted while parsing '{param_id}'");
        }
        ctx.phase = phase;
        text = process_pass(&text, &mut ctx);
        if let Some(error) = ctx.failure.take() {
            return Err(error);
        }
    }

    let mut result = format!("{}{text}{}", ctx.add_before, ctx.add_after);
    let extra = ctx
        .trigger_phrase_extra
        .trim_end_matches(", ")
        .to_string();
    if extra.is_empty() {
        result = result
            .replace(", \0triggerextra", "")
            .replace("\0triggerextra", "");
    } else {
        result = result.replace("\0triggerextra", &extra);
    }
    Ok(result)
}

/// Expand every prompt-like parameter of the request, in order.
/// Sequence cursors the request never touches are forgotten at the
/// end.
pub fn preparse_prompts(input: &mut Input, services: &Services) -> Result<()> {
    services.sequences.clear_ran_flags();
    let outcome = preparse_inner(input, services);
    services.sequences.gc_stale();
    outcome
}

fn preparse_inner(input: &mut Input, services: &Services) -> Result<()> {
    for param_id in PROMPT_LIKE_PARAMS {
        let Some(raw) = input.get_text(param_id) else {
            continue;
        };
        let chars_in = raw.chars().count();
        input
            .extra_meta
            .insert(format!("original_{param_id}"), Value::String(raw));
        let expanded = process_prompt_like(input, param_id, services)?;
        input.log_event(RequestEvent::PromptExpanded {
            param: param_id.to_string(),
            chars_in,
            chars_out: expanded.chars().count(),
        });
        let desc = services.params.require(param_id)?;
        input.set_typed(desc, ParamValue::Text(expanded), services)?;
    }
    Ok(())
}
