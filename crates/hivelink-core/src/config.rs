use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::types::{AgentConfig, QueueTunables, Settings, TeamConfig};

/// All resolved paths for Hivelink directories
#[derive(Debug, Clone)]
pub struct Paths {
    /// Data directory (~/.hivelink or local .hivelink/)
    pub hivelink_home: PathBuf,
    pub db_file: PathBuf,
    pub log_file: PathBuf,
    pub settings_file: PathBuf,
    pub chats_dir: PathBuf,
    pub files_dir: PathBuf,
}

impl Paths {
    /// Resolve HIVELINK_HOME with the following precedence:
    /// 1. HIVELINK_HOME env var
    /// 2. local .hivelink/ if it has settings.json
    /// 3. ~/.hivelink/
    pub fn resolve(base_dir: &Path) -> Self {
        let hivelink_home = if let Ok(env_home) = std::env::var("HIVELINK_HOME") {
            PathBuf::from(env_home)
        } else {
            let local = base_dir.join(".hivelink");
            if local.join("settings.json").exists() {
                local
            } else {
                dirs_home().join(".hivelink")
            }
        };

        Self::at(hivelink_home)
    }

    /// Build a Paths rooted at an explicit data directory.
    pub fn at(hivelink_home: PathBuf) -> Self {
        Self {
            db_file: hivelink_home.join("queue.db"),
            log_file: hivelink_home.join("logs/daemon.log"),
            settings_file: hivelink_home.join("settings.json"),
            chats_dir: hivelink_home.join("chats"),
            files_dir: hivelink_home.join("files"),
            hivelink_home,
        }
    }

    /// Ensure the data directories exist
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.hivelink_home).context("Failed to create data dir")?;
        std::fs::create_dir_all(&self.files_dir).context("Failed to create files dir")?;
        std::fs::create_dir_all(&self.chats_dir).context("Failed to create chats dir")?;
        if let Some(dir) = self.log_file.parent() {
            std::fs::create_dir_all(dir).context("Failed to create logs dir")?;
        }
        Ok(())
    }
}

/// Get user home directory
fn dirs_home() -> PathBuf {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

/// Load and parse settings.json. A missing file yields defaults; malformed
/// JSON is a hard error so the daemon refuses to start on a broken config.
pub fn get_settings(settings_file: &Path) -> Result<Settings> {
    if !settings_file.exists() {
        return Ok(Settings::default());
    }

    let data = std::fs::read_to_string(settings_file).context("Failed to read settings.json")?;
    let settings: Settings =
        serde_json::from_str(&data).context("settings.json contains invalid JSON")?;
    Ok(settings)
}

/// Validate agent and team invariants. Called once at daemon startup;
/// violations abort the process.
pub fn validate_settings(settings: &Settings) -> Result<()> {
    let agents = get_agents(settings);
    let teams = get_teams(settings);

    for id in agents.keys() {
        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            bail!("Invalid agent id '{}': must be a lowercase slug", id);
        }
    }

    for (team_id, team) in &teams {
        let mut seen = HashSet::new();
        for member in &team.agents {
            if !seen.insert(member) {
                bail!("Team '{}' lists member '{}' twice", team_id, member);
            }
            if !agents.contains_key(member) {
                bail!("Team '{}' references unknown agent '{}'", team_id, member);
            }
        }
        if !team.agents.iter().any(|a| a == &team.leader_agent) {
            bail!(
                "Team '{}' leader '{}' is not a member",
                team_id,
                team.leader_agent
            );
        }
    }

    Ok(())
}

/// Build the default agent config, used when no agents are configured.
fn default_agent() -> AgentConfig {
    AgentConfig {
        name: "Default".to_string(),
        provider: "anthropic".to_string(),
        model: "sonnet".to_string(),
        working_directory: None,
        system_prompt: None,
        prompt_file: None,
    }
}

/// Get all configured agents. Falls back to a single "default" agent
/// if none are configured.
pub fn get_agents(settings: &Settings) -> HashMap<String, AgentConfig> {
    if let Some(ref agents) = settings.agents {
        if !agents.is_empty() {
            return agents.clone();
        }
    }
    let mut map = HashMap::new();
    map.insert("default".to_string(), default_agent());
    map
}

/// Get all configured teams.
pub fn get_teams(settings: &Settings) -> HashMap<String, TeamConfig> {
    settings.teams.clone().unwrap_or_default()
}

/// Get the workspace path from settings, with default fallback.
pub fn get_workspace_path(settings: &Settings) -> PathBuf {
    settings
        .workspace
        .as_ref()
        .and_then(|w| w.path.as_ref())
        .map(PathBuf::from)
        .unwrap_or_else(|| dirs_home().join("hivelink-workspace"))
}

/// Retry/retention tunables, falling back to defaults when absent.
pub fn get_tunables(settings: &Settings) -> QueueTunables {
    settings.queue.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_settings(dir: &Path, content: &str) -> PathBuf {
        let file = dir.join("settings.json");
        let mut f = std::fs::File::create(&file).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_get_settings_missing_file() {
        let settings = get_settings(Path::new("/nonexistent/settings.json")).unwrap();
        assert!(settings.agents.is_none());
    }

    #[test]
    fn test_get_settings_invalid_json_is_error() {
        let tmp = TempDir::new().unwrap();
        let file = write_settings(tmp.path(), "{not json");
        assert!(get_settings(&file).is_err());
    }

    #[test]
    fn test_get_settings_with_agents() {
        let tmp = TempDir::new().unwrap();
        let file = write_settings(
            tmp.path(),
            r#"{
                "agents": {
                    "coder": {
                        "name": "Coder",
                        "provider": "anthropic",
                        "model": "sonnet",
                        "working_directory": "/tmp/coder"
                    }
                }
            }"#,
        );
        let settings = get_settings(&file).unwrap();
        let agents = get_agents(&settings);
        assert!(agents.contains_key("coder"));
        assert_eq!(agents["coder"].name, "Coder");
    }

    #[test]
    fn test_get_agents_fallback_default() {
        let settings = Settings::default();
        let agents = get_agents(&settings);
        assert!(agents.contains_key("default"));
        assert_eq!(agents["default"].provider, "anthropic");
        assert_eq!(agents["default"].model, "sonnet");
    }

    #[test]
    fn test_tunables_defaults() {
        let settings = Settings::default();
        let t = get_tunables(&settings);
        assert_eq!(t.max_retries, 5);
        assert_eq!(t.stale_claim_minutes, 10);
        assert_eq!(t.conversation_max_messages, 20);
    }

    #[test]
    fn test_validate_leader_must_be_member() {
        let tmp = TempDir::new().unwrap();
        let file = write_settings(
            tmp.path(),
            r#"{
                "agents": {
                    "coder": { "name": "Coder", "provider": "anthropic", "model": "sonnet" },
                    "writer": { "name": "Writer", "provider": "anthropic", "model": "sonnet" }
                },
                "teams": {
                    "dev": { "name": "Dev", "agents": ["coder"], "leader_agent": "writer" }
                }
            }"#,
        );
        let settings = get_settings(&file).unwrap();
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    fn test_validate_unknown_member() {
        let tmp = TempDir::new().unwrap();
        let file = write_settings(
            tmp.path(),
            r#"{
                "agents": {
                    "coder": { "name": "Coder", "provider": "anthropic", "model": "sonnet" }
                },
                "teams": {
                    "dev": { "name": "Dev", "agents": ["coder", "ghost"], "leader_agent": "coder" }
                }
            }"#,
        );
        let settings = get_settings(&file).unwrap();
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    fn test_validate_ok() {
        let tmp = TempDir::new().unwrap();
        let file = write_settings(
            tmp.path(),
            r#"{
                "agents": {
                    "coder": { "name": "Coder", "provider": "anthropic", "model": "sonnet" },
                    "reviewer": { "name": "Reviewer", "provider": "openai", "model": "gpt-5.3-codex" }
                },
                "teams": {
                    "dev": { "name": "Dev", "agents": ["coder", "reviewer"], "leader_agent": "coder" }
                }
            }"#,
        );
        let settings = get_settings(&file).unwrap();
        assert!(validate_settings(&settings).is_ok());
    }

    #[test]
    fn test_paths_at() {
        let paths = Paths::at(PathBuf::from("/data/.hivelink"));
        assert_eq!(paths.db_file, PathBuf::from("/data/.hivelink/queue.db"));
        assert_eq!(
            paths.settings_file,
            PathBuf::from("/data/.hivelink/settings.json")
        );
    }
}
