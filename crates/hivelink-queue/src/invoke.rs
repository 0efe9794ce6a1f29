use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use hivelink_core::logging::log;
use hivelink_core::models::{resolve_claude_model, resolve_codex_model, resolve_opencode_model};
use hivelink_core::types::AgentConfig;

/// Run a command and capture stdout. Returns an error if the process exits non-zero.
pub async fn run_command(command: &str, args: &[&str], cwd: &Path) -> Result<String> {
    let output = Command::new(command)
        .args(args)
        .current_dir(cwd)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .output()
        .await
        .with_context(|| format!("Failed to spawn command: {}", command))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let msg = if stderr.is_empty() {
            format!("Command exited with code {:?}", output.status.code())
        } else {
            stderr
        };
        Err(anyhow::anyhow!(msg))
    }
}

/// Parse Codex JSONL output — extract the final `agent_message` text.
pub fn parse_codex_output(raw: &str) -> String {
    let mut response = String::new();
    for line in raw.trim().lines() {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(line) {
            if json.get("type").and_then(|t| t.as_str()) == Some("item.completed") {
                if let Some(item) = json.get("item") {
                    if item.get("type").and_then(|t| t.as_str()) == Some("agent_message") {
                        if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                            response = text.to_string();
                        }
                    }
                }
            }
        }
    }
    if response.is_empty() {
        "Sorry, I could not generate a response from Codex.".to_string()
    } else {
        response
    }
}

/// Parse OpenCode JSON output — keep the last `text` part.
pub fn parse_opencode_output(raw: &str) -> String {
    let mut response = String::new();
    for line in raw.trim().lines() {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(line) {
            if json.get("type").and_then(|t| t.as_str()) == Some("text") {
                if let Some(part) = json.get("part") {
                    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                        response = text.to_string();
                    }
                }
            }
        }
    }
    if response.is_empty() {
        "Sorry, I could not generate a response from OpenCode.".to_string()
    } else {
        response
    }
}

/// Resolve an agent's working directory: absolute paths as-is, relative paths
/// against the workspace root, unset means `<workspace>/<agent_id>/`.
pub fn resolve_working_dir(
    agent: &AgentConfig,
    agent_id: &str,
    workspace_path: &Path,
) -> PathBuf {
    match agent.working_directory.as_deref() {
        None | Some("") => workspace_path.join(agent_id),
        Some(dir) => {
            let wd = PathBuf::from(dir);
            if wd.is_absolute() {
                wd
            } else {
                workspace_path.join(dir)
            }
        }
    }
}

/// Load the agent's system prompt: inline text wins over a prompt file.
/// Relative prompt file paths resolve against the workspace root.
pub fn load_system_prompt(agent: &AgentConfig, workspace_path: &Path) -> Option<String> {
    if let Some(ref inline) = agent.system_prompt {
        if !inline.trim().is_empty() {
            return Some(inline.clone());
        }
    }
    let file = agent.prompt_file.as_deref()?;
    let path = PathBuf::from(file);
    let path = if path.is_absolute() {
        path
    } else {
        workspace_path.join(path)
    };
    std::fs::read_to_string(path).ok().filter(|s| !s.trim().is_empty())
}

/// The seam between the dispatcher and the provider subprocesses. Production
/// uses CliInvoker; tests drive the dispatcher with scripted stand-ins.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(
        &self,
        agent: &AgentConfig,
        agent_id: &str,
        prompt: &str,
        workspace_path: &Path,
        reset: bool,
    ) -> Result<String>;
}

/// Shells out to the provider CLI configured for the agent.
pub struct CliInvoker {
    log_file: PathBuf,
}

impl CliInvoker {
    pub fn new(log_file: PathBuf) -> Self {
        Self { log_file }
    }
}

#[async_trait]
impl AgentInvoker for CliInvoker {
    async fn invoke(
        &self,
        agent: &AgentConfig,
        agent_id: &str,
        prompt: &str,
        workspace_path: &Path,
        reset: bool,
    ) -> Result<String> {
        let working_dir = resolve_working_dir(agent, agent_id, workspace_path);
        if !working_dir.exists() {
            std::fs::create_dir_all(&working_dir)?;
            log(
                "INFO",
                &format!(
                    "Created working directory for agent {}: {}",
                    agent_id,
                    working_dir.display()
                ),
                &self.log_file,
            );
        }

        // Fresh sessions get the configured system prompt as a preamble
        let prompt = if reset {
            match load_system_prompt(agent, workspace_path) {
                Some(system) => format!("{}\n\n------\n\n{}", system.trim(), prompt),
                None => prompt.to_string(),
            }
        } else {
            prompt.to_string()
        };

        let provider = if agent.provider.is_empty() {
            "anthropic"
        } else {
            &agent.provider
        };

        match provider {
            "openai" => {
                log(
                    "INFO",
                    &format!("Using Codex CLI (agent: {})", agent_id),
                    &self.log_file,
                );
                if reset {
                    log(
                        "INFO",
                        &format!("Resetting Codex conversation for agent: {}", agent_id),
                        &self.log_file,
                    );
                }

                let model_id = resolve_codex_model(&agent.model);
                let mut args: Vec<String> = vec!["exec".to_string()];
                if !reset {
                    args.push("resume".to_string());
                    args.push("--last".to_string());
                }
                if !model_id.is_empty() {
                    args.push("--model".to_string());
                    args.push(model_id);
                }
                args.extend([
                    "--skip-git-repo-check".to_string(),
                    "--json".to_string(),
                    prompt,
                ]);

                let args_ref: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
                let output = run_command("codex", &args_ref, &working_dir).await?;
                Ok(parse_codex_output(&output))
            }
            "opencode" => {
                let model_id = resolve_opencode_model(&agent.model);
                log(
                    "INFO",
                    &format!(
                        "Using OpenCode CLI (agent: {}, model: {})",
                        agent_id, model_id
                    ),
                    &self.log_file,
                );
                if reset {
                    log(
                        "INFO",
                        &format!("Resetting OpenCode conversation for agent: {}", agent_id),
                        &self.log_file,
                    );
                }

                let mut args: Vec<String> =
                    vec!["run".to_string(), "--format".to_string(), "json".to_string()];
                if !model_id.is_empty() {
                    args.push("--model".to_string());
                    args.push(model_id);
                }
                if !reset {
                    args.push("-c".to_string());
                }
                args.push(prompt);

                let args_ref: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
                let output = run_command("opencode", &args_ref, &working_dir).await?;
                Ok(parse_opencode_output(&output))
            }
            _ => {
                // Default to Claude (Anthropic)
                log(
                    "INFO",
                    &format!("Using Claude provider (agent: {})", agent_id),
                    &self.log_file,
                );
                if reset {
                    log(
                        "INFO",
                        &format!("Resetting conversation for agent: {}", agent_id),
                        &self.log_file,
                    );
                }

                let model_id = resolve_claude_model(&agent.model);
                let mut args: Vec<String> = vec!["--dangerously-skip-permissions".to_string()];
                if !model_id.is_empty() {
                    args.push("--model".to_string());
                    args.push(model_id);
                }
                if !reset {
                    args.push("-c".to_string());
                }
                args.push("-p".to_string());
                args.push(prompt);

                let args_ref: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
                run_command("claude", &args_ref, &working_dir).await
            }
        }
    }
}
