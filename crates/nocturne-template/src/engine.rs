// Macro expansion over JSON documents.
//
// Tokens look like `${name}` or `${name(arg1, arg2)}`. Macros are either
// literal strings or evaluator functions. Expansion walks every string leaf
// of a JSON document; a document is only mutated if the whole expansion
// succeeds, so callers never observe a half-expanded tree.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::error::TemplateError;

/// A registered macro: a literal replacement or an evaluator.
#[derive(Clone)]
pub enum MacroValue {
    Text(String),
    Func(Arc<dyn Fn(&[String]) -> Result<String, TemplateError> + Send + Sync>),
}

impl MacroValue {
    pub fn func<F>(f: F) -> Self
    where
        F: Fn(&[String]) -> Result<String, TemplateError> + Send + Sync + 'static,
    {
        MacroValue::Func(Arc::new(f))
    }
}

impl std::fmt::Debug for MacroValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MacroValue::Text(s) => f.debug_tuple("Text").field(s).finish(),
            MacroValue::Func(_) => f.write_str("Func(..)"),
        }
    }
}

/// Expansion statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MacroStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evaluations: u64,
    pub average_evaluation_micros: f64,
}

#[derive(Default)]
struct MacroCache {
    entries: HashMap<String, String>,
    order: VecDeque<String>,
}

impl MacroCache {
    fn get(&self, key: &str) -> Option<&String> {
        self.entries.get(key)
    }

    fn insert(&mut self, key: String, value: String, max: usize) {
        if !self.entries.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.entries.insert(key, value);
        while self.entries.len() > max {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

static MACRO_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([^{}]*)\}").expect("macro pattern is valid"));

/// Safety cap on rescans of one string; nested tokens converge well below it.
const MAX_EXPANSION_PASSES: usize = 64;

pub const DEFAULT_MAX_CACHE_SIZE: usize = 1000;

/// Expands `${...}` tokens inside JSON string leaves.
pub struct MacroEngine {
    macros: RwLock<HashMap<String, MacroValue>>,
    cache: Mutex<MacroCache>,
    max_cache_size: Mutex<usize>,
    stats: Mutex<StatsInner>,
}

#[derive(Default)]
struct StatsInner {
    cache_hits: u64,
    cache_misses: u64,
    evaluations: u64,
    total_eval_micros: u128,
}

impl Default for MacroEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MacroEngine {
    pub fn new() -> Self {
        let engine = Self {
            macros: RwLock::new(HashMap::new()),
            cache: Mutex::new(MacroCache::default()),
            max_cache_size: Mutex::new(DEFAULT_MAX_CACHE_SIZE),
            stats: Mutex::new(StatsInner::default()),
        };
        engine.register_builtins();
        engine
    }

    pub fn add_macro(&self, name: &str, value: MacroValue) -> Result<(), TemplateError> {
        if name.trim().is_empty() {
            return Err(TemplateError::InvalidArgument(
                "macro name cannot be empty".to_string(),
            ));
        }
        debug!(name, "adding macro");
        self.macros
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), value);
        self.clear_cache();
        Ok(())
    }

    pub fn remove_macro(&self, name: &str) -> Result<(), TemplateError> {
        let removed = self
            .macros
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some();
        if !removed {
            return Err(TemplateError::UndefinedMacro(name.to_string()));
        }
        self.clear_cache();
        Ok(())
    }

    pub fn has_macro(&self, name: &str) -> bool {
        self.macros
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    pub fn list_macros(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .macros
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn set_max_cache_size(&self, size: usize) {
        *self
            .max_cache_size
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = size.max(1);
        self.clear_cache();
    }

    pub fn stats(&self) -> MacroStats {
        let inner = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let avg = if inner.evaluations == 0 {
            0.0
        } else {
            inner.total_eval_micros as f64 / inner.evaluations as f64
        };
        MacroStats {
            cache_hits: inner.cache_hits,
            cache_misses: inner.cache_misses,
            evaluations: inner.evaluations,
            average_evaluation_micros: avg,
        }
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner()) = StatsInner::default();
    }

    /// Expands every string leaf of the document in place. On error the
    /// document is left exactly as it was.
    pub fn process_json(&self, doc: &mut Value) -> Result<(), TemplateError> {
        let mut scratch = doc.clone();
        self.process_value(&mut scratch)?;
        *doc = scratch;
        Ok(())
    }

    /// Scans the document for keys whose value is a single macro token and
    /// registers each as a macro for the duration of this call, then expands
    /// the whole document.
    pub fn process_json_with_json_macros(&self, doc: &mut Value) -> Result<(), TemplateError> {
        let mut scratch = doc.clone();
        let registered = match self.preprocess_json_macros(&scratch) {
            Ok(names) => names,
            Err(e) => return Err(e),
        };
        let result = self.process_value(&mut scratch);
        // One-shot scope: document-defined macros never outlive this call.
        for name in &registered {
            let _ = self.remove_macro(name);
        }
        result?;
        *doc = scratch;
        Ok(())
    }

    /// Expands tokens in a bare string.
    pub fn expand(&self, input: &str) -> Result<String, TemplateError> {
        self.expand_string(input)
    }

    fn process_value(&self, value: &mut Value) -> Result<(), TemplateError> {
        match value {
            Value::String(s) => {
                *s = self.expand_string(s)?;
            }
            Value::Array(items) => {
                for item in items {
                    self.process_value(item)?;
                }
            }
            Value::Object(map) => {
                for (_, item) in map.iter_mut() {
                    self.process_value(item)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn preprocess_json_macros(&self, value: &Value) -> Result<Vec<String>, TemplateError> {
        let mut registered = Vec::new();
        self.collect_json_macros(value, &mut registered)?;
        Ok(registered)
    }

    fn collect_json_macros(
        &self,
        value: &Value,
        registered: &mut Vec<String>,
    ) -> Result<(), TemplateError> {
        match value {
            Value::Object(map) => {
                for (key, item) in map {
                    if let Value::String(s) = item {
                        if let Some(caps) = MACRO_PATTERN.captures(s) {
                            // Only a full-token value defines a macro.
                            if caps.get(0).map(|m| m.as_str()) == Some(s.as_str())
                                && !self.has_macro(key)
                            {
                                let expanded = self.expand_token(&caps[1])?;
                                self.add_macro(key, MacroValue::Text(expanded))?;
                                registered.push(key.clone());
                            }
                        }
                    } else {
                        self.collect_json_macros(item, registered)?;
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.collect_json_macros(item, registered)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn expand_string(&self, input: &str) -> Result<String, TemplateError> {
        check_balanced(input)?;
        if !input.contains("${") {
            return Ok(input.to_string());
        }

        let started = Instant::now();
        let mut result = input.to_string();
        let mut passes = 0usize;

        // Innermost tokens match first; rescanning from the start lets an
        // enclosing token resolve once its arguments have been expanded.
        while let Some(caps) = MACRO_PATTERN.captures(&result) {
            passes += 1;
            if passes > MAX_EXPANSION_PASSES {
                return Err(TemplateError::RecursionLimit(format!(
                    "macro expansion did not converge after {MAX_EXPANSION_PASSES} passes"
                )));
            }
            let whole = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
            let content = caps[1].to_string();
            let replacement = self.expand_token(&content)?;
            result.replace_range(whole.0..whole.1, &replacement);
        }

        let elapsed = started.elapsed().as_micros();
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.evaluations += 1;
        stats.total_eval_micros += elapsed;
        Ok(result)
    }

    /// Evaluates one token body (`name` or `name(args)`), consulting the cache.
    fn expand_token(&self, content: &str) -> Result<String, TemplateError> {
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(hit) = cache.get(content) {
                let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
                stats.cache_hits += 1;
                return Ok(hit.clone());
            }
        }
        {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.cache_misses += 1;
        }

        let (name, args) = parse_token(content)?;
        // Arguments are themselves macro-expandable, one level deep.
        let mut expanded_args = Vec::with_capacity(args.len());
        for arg in args {
            expanded_args.push(self.expand_string(&arg)?);
        }
        let replacement = self.evaluate(&name, &expanded_args)?;

        let max = *self
            .max_cache_size
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(content.to_string(), replacement.clone(), max);
        Ok(replacement)
    }

    fn evaluate(&self, name: &str, args: &[String]) -> Result<String, TemplateError> {
        let value = {
            let macros = self.macros.read().unwrap_or_else(|e| e.into_inner());
            macros
                .get(name)
                .cloned()
                .ok_or_else(|| TemplateError::UndefinedMacro(name.to_string()))?
        };
        match value {
            MacroValue::Text(text) => Ok(text),
            MacroValue::Func(func) => func(args).map_err(|e| match e {
                TemplateError::InvalidMacroArgs(msg) => TemplateError::InvalidMacroArgs(msg),
                other => TemplateError::Evaluation(format!("macro '{name}': {other}")),
            }),
        }
    }

    fn register_builtins(&self) {
        let register = |name: &str, value: MacroValue| {
            // Built-in names are non-empty, so this cannot fail.
            let _ = self.add_macro(name, value);
        };

        register(
            "uppercase",
            MacroValue::func(|args| {
                let first = args.first().ok_or_else(|| {
                    TemplateError::InvalidMacroArgs(
                        "uppercase requires at least 1 argument".to_string(),
                    )
                })?;
                Ok(first.to_uppercase())
            }),
        );

        register(
            "tolower",
            MacroValue::func(|args| {
                let first = args.first().ok_or_else(|| {
                    TemplateError::InvalidMacroArgs(
                        "tolower requires at least 1 argument".to_string(),
                    )
                })?;
                Ok(first.to_lowercase())
            }),
        );

        register(
            "concat",
            MacroValue::func(|args| {
                let mut result = String::new();
                for arg in args {
                    if arg.is_empty() {
                        continue;
                    }
                    if result.is_empty() {
                        result.push_str(arg);
                        continue;
                    }
                    let first = arg.chars().next().unwrap_or(' ');
                    // Punctuation glues to the previous word, except openers.
                    if first.is_ascii_punctuation() && first != '(' && first != '[' {
                        result.push_str(arg);
                    } else {
                        result.push(' ');
                        result.push_str(arg);
                    }
                }
                Ok(result)
            }),
        );

        register(
            "if",
            MacroValue::func(|args| {
                if args.len() < 3 {
                    return Err(TemplateError::InvalidMacroArgs(
                        "if requires 3 arguments".to_string(),
                    ));
                }
                Ok(if args[0] == "true" {
                    args[1].clone()
                } else {
                    args[2].clone()
                })
            }),
        );

        register(
            "length",
            MacroValue::func(|args| {
                if args.len() != 1 {
                    return Err(TemplateError::InvalidMacroArgs(
                        "length requires 1 argument".to_string(),
                    ));
                }
                Ok(args[0].chars().count().to_string())
            }),
        );

        register(
            "equals",
            MacroValue::func(|args| {
                if args.len() != 2 {
                    return Err(TemplateError::InvalidMacroArgs(
                        "equals requires 2 arguments".to_string(),
                    ));
                }
                Ok(if args[0] == args[1] { "true" } else { "false" }.to_string())
            }),
        );

        register(
            "repeat",
            MacroValue::func(|args| {
                if args.len() != 2 {
                    return Err(TemplateError::InvalidMacroArgs(
                        "repeat requires 2 arguments".to_string(),
                    ));
                }
                let times: usize = args[1].parse().map_err(|_| {
                    TemplateError::InvalidMacroArgs(format!(
                        "invalid repeat count: {}",
                        args[1]
                    ))
                })?;
                Ok(args[0].repeat(times))
            }),
        );
    }
}

/// Splits a token body into macro name and trimmed arguments.
fn parse_token(content: &str) -> Result<(String, Vec<String>), TemplateError> {
    match content.find('(') {
        None => Ok((content.trim().to_string(), Vec::new())),
        Some(pos) => {
            if !content.ends_with(')') {
                return Err(TemplateError::InvalidMacroArgs(format!(
                    "malformed macro token: {content}"
                )));
            }
            let name = content[..pos].trim().to_string();
            let args_str = &content[pos + 1..content.len() - 1];
            if args_str.trim().is_empty() {
                return Ok((name, Vec::new()));
            }
            if args_str.trim_end().ends_with(',') {
                return Err(TemplateError::InvalidMacroArgs(format!(
                    "trailing comma in macro token: {content}"
                )));
            }
            let args = args_str
                .split(',')
                .map(|a| a.trim().to_string())
                .collect();
            Ok((name, args))
        }
    }
}

/// Rejects inputs with an opening `${` that never closes.
fn check_balanced(input: &str) -> Result<(), TemplateError> {
    let mut rest = input;
    while let Some(pos) = rest.find("${") {
        let after = &rest[pos + 2..];
        match after.find('}') {
            Some(close) => rest = &after[close + 1..],
            None => {
                return Err(TemplateError::InvalidMacroArgs(format!(
                    "unbalanced macro token in: {input}"
                )))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn literal_macro_expands() {
        let engine = MacroEngine::new();
        engine
            .add_macro("observatory", MacroValue::Text("Cerro Pachon".to_string()))
            .unwrap();
        assert_eq!(
            engine.expand("site: ${observatory}").unwrap(),
            "site: Cerro Pachon"
        );
    }

    #[test]
    fn empty_macro_name_rejected() {
        let engine = MacroEngine::new();
        let err = engine
            .add_macro("  ", MacroValue::Text("x".to_string()))
            .unwrap_err();
        assert!(matches!(err, TemplateError::InvalidArgument(_)));
    }

    #[test]
    fn remove_undefined_macro_fails() {
        let engine = MacroEngine::new();
        assert!(matches!(
            engine.remove_macro("missing"),
            Err(TemplateError::UndefinedMacro(_))
        ));
    }

    #[test]
    fn builtins() {
        let engine = MacroEngine::new();
        assert_eq!(engine.expand("${uppercase(ngc253)}").unwrap(), "NGC253");
        assert_eq!(engine.expand("${tolower(M42)}").unwrap(), "m42");
        assert_eq!(engine.expand("${length(orion)}").unwrap(), "5");
        assert_eq!(engine.expand("${equals(a, a)}").unwrap(), "true");
        assert_eq!(engine.expand("${equals(a, b)}").unwrap(), "false");
        assert_eq!(engine.expand("${repeat(ab, 3)}").unwrap(), "ababab");
        assert_eq!(engine.expand("${if(true, yes, no)}").unwrap(), "yes");
        assert_eq!(engine.expand("${if(1, yes, no)}").unwrap(), "no");
    }

    #[test]
    fn concat_spacing_rules() {
        let engine = MacroEngine::new();
        assert_eq!(engine.expand("${concat(deep, sky)}").unwrap(), "deep sky");
        assert_eq!(engine.expand("${concat(M42, !, yes)}").unwrap(), "M42! yes");
    }

    #[test]
    fn nested_tokens_resolve_innermost_first() {
        let engine = MacroEngine::new();
        assert_eq!(
            engine.expand("${uppercase(${tolower(Vega)})}").unwrap(),
            "VEGA"
        );
    }

    #[test]
    fn undefined_macro_fails() {
        let engine = MacroEngine::new();
        assert!(matches!(
            engine.expand("${nope}"),
            Err(TemplateError::UndefinedMacro(_))
        ));
    }

    #[test]
    fn malformed_tokens_fail() {
        let engine = MacroEngine::new();
        assert!(matches!(
            engine.expand("prefix ${uppercase(x"),
            Err(TemplateError::InvalidMacroArgs(_))
        ));
        assert!(matches!(
            engine.expand("${uppercase(a,)}"),
            Err(TemplateError::InvalidMacroArgs(_))
        ));
        assert!(matches!(
            engine.expand("${uppercase(a}"),
            Err(TemplateError::InvalidMacroArgs(_))
        ));
    }

    #[test]
    fn token_free_string_is_fixed_point() {
        let engine = MacroEngine::new();
        let mut doc = json!({"a": "no tokens here", "b": [1, true, "plain"]});
        let before = doc.clone();
        engine.process_json(&mut doc).unwrap();
        assert_eq!(doc, before);
    }

    #[test]
    fn expansion_is_idempotent_on_expanded_documents() {
        let engine = MacroEngine::new();
        let mut doc = json!({"name": "${uppercase(m31)}"});
        engine.process_json(&mut doc).unwrap();
        let once = doc.clone();
        engine.process_json(&mut doc).unwrap();
        assert_eq!(doc, once);
    }

    #[test]
    fn failed_expansion_leaves_document_untouched() {
        let engine = MacroEngine::new();
        let mut doc = json!({"ok": "${uppercase(x)}", "bad": "${undefined_macro}"});
        let before = doc.clone();
        assert!(engine.process_json(&mut doc).is_err());
        assert_eq!(doc, before);
    }

    #[test]
    fn json_macros_are_one_shot() {
        let engine = MacroEngine::new();
        let mut doc = json!({
            "label": "${uppercase(rosette)}",
            "title": "${label}"
        });
        engine.process_json_with_json_macros(&mut doc).unwrap();
        assert_eq!(doc["label"], "ROSETTE");
        assert_eq!(doc["title"], "ROSETTE");
        // the document-scoped macro is gone afterwards
        assert!(!engine.has_macro("label"));
    }

    #[test]
    fn cache_counts_hits_and_evicts_oldest() {
        let engine = MacroEngine::new();
        engine.set_max_cache_size(2);
        engine.expand("${uppercase(a)}").unwrap();
        engine.expand("${uppercase(a)}").unwrap();
        let stats = engine.stats();
        assert_eq!(stats.cache_hits, 1);
        assert!(stats.cache_misses >= 1);

        engine.expand("${uppercase(b)}").unwrap();
        engine.expand("${uppercase(c)}").unwrap();
        assert!(engine.cache_len() <= 2);
    }

    #[test]
    fn cache_invalidated_when_table_changes() {
        let engine = MacroEngine::new();
        engine
            .add_macro("site", MacroValue::Text("north".to_string()))
            .unwrap();
        engine.expand("${site}").unwrap();
        assert!(engine.cache_len() > 0);
        engine
            .add_macro("site", MacroValue::Text("south".to_string()))
            .unwrap();
        assert_eq!(engine.cache_len(), 0);
        assert_eq!(engine.expand("${site}").unwrap(), "south");
    }

    #[test]
    fn process_json_walks_nested_structures() {
        let engine = MacroEngine::new();
        let mut doc = json!({
            "targets": [
                {"name": "${uppercase(m42)}", "tasks": [{"note": "${repeat(x, 2)}"}]}
            ]
        });
        engine.process_json(&mut doc).unwrap();
        assert_eq!(doc["targets"][0]["name"], "M42");
        assert_eq!(doc["targets"][0]["tasks"][0]["note"], "xx");
    }
}
