use std::path::Path;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde_json::{Map, Value};

use crate::logging::log;
use crate::types::{HookSpec, HooksConfig};

/// Context handed to every transform alongside the current text.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub channel: &'a str,
    pub sender: &'a str,
    pub message_id: &'a str,
    pub original_text: &'a str,
}

/// Result of one transform: new text, optionally with metadata to attach
/// to the outgoing response.
pub enum HookOutcome {
    Text(String),
    WithMetadata(String, Map<String, Value>),
}

/// A user-configured text transform. Runs in-process and is trusted, but a
/// failure is logged and skipped rather than failing the carrying message.
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, text: &str, ctx: &HookContext) -> Result<HookOutcome>;
}

/// Ordered incoming/outgoing transform chains, built once at startup.
pub struct HookPipeline {
    incoming: Vec<Box<dyn Hook>>,
    outgoing: Vec<Box<dyn Hook>>,
}

impl HookPipeline {
    pub fn empty() -> Self {
        Self {
            incoming: Vec::new(),
            outgoing: Vec::new(),
        }
    }

    /// Build the pipeline from settings. Unknown transform names are a
    /// configuration error and abort startup.
    pub fn from_config(config: &HooksConfig) -> Result<Self> {
        Ok(Self {
            incoming: config
                .incoming
                .iter()
                .map(build_hook)
                .collect::<Result<_>>()?,
            outgoing: config
                .outgoing
                .iter()
                .map(build_hook)
                .collect::<Result<_>>()?,
        })
    }

    pub fn run_incoming(
        &self,
        text: &str,
        ctx: &HookContext,
        log_file: &Path,
    ) -> (String, Map<String, Value>) {
        run_chain(&self.incoming, text, ctx, log_file)
    }

    pub fn run_outgoing(
        &self,
        text: &str,
        ctx: &HookContext,
        log_file: &Path,
    ) -> (String, Map<String, Value>) {
        run_chain(&self.outgoing, text, ctx, log_file)
    }
}

fn run_chain(
    hooks: &[Box<dyn Hook>],
    text: &str,
    ctx: &HookContext,
    log_file: &Path,
) -> (String, Map<String, Value>) {
    let mut current = text.to_string();
    let mut metadata = Map::new();

    for hook in hooks {
        match hook.apply(&current, ctx) {
            Ok(HookOutcome::Text(next)) => current = next,
            Ok(HookOutcome::WithMetadata(next, extra)) => {
                current = next;
                // Right-biased merge on key conflict
                for (k, v) in extra {
                    metadata.insert(k, v);
                }
            }
            Err(e) => {
                log(
                    "WARN",
                    &format!("Hook '{}' failed, skipping: {}", hook.name(), e),
                    log_file,
                );
            }
        }
    }

    (current, metadata)
}

fn build_hook(spec: &HookSpec) -> Result<Box<dyn Hook>> {
    let options = spec.options.as_ref();
    match spec.name.as_str() {
        "trim" => Ok(Box::new(TrimHook)),
        "max_length" => {
            let limit = options
                .and_then(|o| o.get("limit"))
                .and_then(|v| v.as_u64())
                .context("max_length hook requires a numeric 'limit' option")?;
            Ok(Box::new(MaxLengthHook {
                limit: limit as usize,
            }))
        }
        "redact" => {
            let pattern = options
                .and_then(|o| o.get("pattern"))
                .and_then(|v| v.as_str())
                .context("redact hook requires a 'pattern' option")?;
            let replacement = options
                .and_then(|o| o.get("replacement"))
                .and_then(|v| v.as_str())
                .unwrap_or("[redacted]")
                .to_string();
            Ok(Box::new(RedactHook {
                pattern: Regex::new(pattern)
                    .with_context(|| format!("redact hook pattern '{}' is invalid", pattern))?,
                replacement,
            }))
        }
        "signature" => {
            let text = options
                .and_then(|o| o.get("text"))
                .and_then(|v| v.as_str())
                .context("signature hook requires a 'text' option")?
                .to_string();
            Ok(Box::new(SignatureHook { text }))
        }
        other => bail!("Unknown hook '{}'", other),
    }
}

struct TrimHook;

impl Hook for TrimHook {
    fn name(&self) -> &str {
        "trim"
    }
    fn apply(&self, text: &str, _ctx: &HookContext) -> Result<HookOutcome> {
        Ok(HookOutcome::Text(text.trim().to_string()))
    }
}

struct MaxLengthHook {
    limit: usize,
}

impl Hook for MaxLengthHook {
    fn name(&self) -> &str {
        "max_length"
    }
    fn apply(&self, text: &str, _ctx: &HookContext) -> Result<HookOutcome> {
        if text.chars().count() <= self.limit {
            return Ok(HookOutcome::Text(text.to_string()));
        }
        let truncated: String = text.chars().take(self.limit).collect();
        let mut metadata = Map::new();
        metadata.insert("truncated".to_string(), Value::Bool(true));
        Ok(HookOutcome::WithMetadata(
            format!("{}…", truncated),
            metadata,
        ))
    }
}

struct RedactHook {
    pattern: Regex,
    replacement: String,
}

impl Hook for RedactHook {
    fn name(&self) -> &str {
        "redact"
    }
    fn apply(&self, text: &str, _ctx: &HookContext) -> Result<HookOutcome> {
        Ok(HookOutcome::Text(
            self.pattern
                .replace_all(text, self.replacement.as_str())
                .into_owned(),
        ))
    }
}

struct SignatureHook {
    text: String,
}

impl Hook for SignatureHook {
    fn name(&self) -> &str {
        "signature"
    }
    fn apply(&self, text: &str, _ctx: &HookContext) -> Result<HookOutcome> {
        Ok(HookOutcome::Text(format!("{}\n\n{}", text, self.text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx<'a>() -> HookContext<'a> {
        HookContext {
            channel: "telegram",
            sender: "Alice",
            message_id: "m1",
            original_text: "original",
        }
    }

    fn config(incoming: Vec<HookSpec>, outgoing: Vec<HookSpec>) -> HooksConfig {
        HooksConfig { incoming, outgoing }
    }

    fn spec(name: &str, options: Option<serde_json::Value>) -> HookSpec {
        HookSpec {
            name: name.to_string(),
            options,
        }
    }

    #[test]
    fn test_unknown_hook_is_config_error() {
        let result = HookPipeline::from_config(&config(vec![spec("nope", None)], vec![]));
        assert!(result.is_err());
    }

    #[test]
    fn test_chain_order_and_output() {
        let tmp = TempDir::new().unwrap();
        let pipeline = HookPipeline::from_config(&config(
            vec![
                spec("trim", None),
                spec(
                    "redact",
                    Some(serde_json::json!({"pattern": "secret-\\w+", "replacement": "[hidden]"})),
                ),
            ],
            vec![],
        ))
        .unwrap();

        let (text, _) =
            pipeline.run_incoming("  check secret-token now  ", &ctx(), &tmp.path().join("log"));
        assert_eq!(text, "check [hidden] now");
    }

    #[test]
    fn test_metadata_merges_right_biased() {
        let tmp = TempDir::new().unwrap();
        let pipeline = HookPipeline::from_config(&config(
            vec![
                spec("max_length", Some(serde_json::json!({"limit": 5}))),
                spec("max_length", Some(serde_json::json!({"limit": 3}))),
            ],
            vec![],
        ))
        .unwrap();

        let (text, metadata) =
            pipeline.run_incoming("abcdefghij", &ctx(), &tmp.path().join("log"));
        assert_eq!(text, "abc…");
        assert_eq!(metadata.get("truncated"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_signature_is_outgoing() {
        let tmp = TempDir::new().unwrap();
        let pipeline = HookPipeline::from_config(&config(
            vec![],
            vec![spec(
                "signature",
                Some(serde_json::json!({"text": "sent by hivelink"})),
            )],
        ))
        .unwrap();

        let (text, _) = pipeline.run_outgoing("done", &ctx(), &tmp.path().join("log"));
        assert!(text.ends_with("sent by hivelink"));
    }

    #[test]
    fn test_empty_pipeline_is_identity() {
        let tmp = TempDir::new().unwrap();
        let pipeline = HookPipeline::empty();
        let (text, metadata) = pipeline.run_incoming("hello", &ctx(), &tmp.path().join("log"));
        assert_eq!(text, "hello");
        assert!(metadata.is_empty());
    }
}
