use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Agent configuration from settings.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    /// Provider: "anthropic", "openai", or "opencode"
    pub provider: String,
    /// Model shortname or full ID (e.g. "sonnet", "opus", "gpt-5.3-codex")
    pub model: String,
    /// Working directory. Absolute paths are used as-is, relative paths are
    /// resolved against the workspace root. Unset means `<workspace>/<id>/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    /// Inline system prompt, prepended on session reset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Path to a file holding the system prompt. Ignored when system_prompt is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_file: Option<String>,
}

/// Team configuration from settings.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    pub name: String,
    pub agents: Vec<String>,
    pub leader_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Team context attached to a conversation or routing result.
#[derive(Debug, Clone)]
pub struct TeamContext {
    pub team_id: String,
    pub team: TeamConfig,
}

/// Root settings.json structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<WorkspaceConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agents: Option<HashMap<String, AgentConfig>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teams: Option<HashMap<String, TeamConfig>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<MonitoringConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueTunables>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<HooksConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Seconds between heartbeat self-prompts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Retry and retention tunables for the queue store and conversation engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueTunables {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_stale_claim_minutes")]
    pub stale_claim_minutes: u64,
    #[serde(default = "default_message_retention_hours")]
    pub message_retention_hours: u64,
    #[serde(default = "default_response_retention_hours")]
    pub response_retention_hours: u64,
    #[serde(default = "default_conversation_ttl_minutes")]
    pub conversation_ttl_minutes: u64,
    #[serde(default = "default_conversation_max_messages")]
    pub conversation_max_messages: u32,
    /// Responses longer than this are spilled to a file and attached.
    #[serde(default = "default_long_response_limit")]
    pub long_response_limit: usize,
}

fn default_max_retries() -> u32 {
    5
}
fn default_stale_claim_minutes() -> u64 {
    10
}
fn default_message_retention_hours() -> u64 {
    24
}
fn default_response_retention_hours() -> u64 {
    24
}
fn default_conversation_ttl_minutes() -> u64 {
    30
}
fn default_conversation_max_messages() -> u32 {
    20
}
fn default_long_response_limit() -> usize {
    4000
}

impl Default for QueueTunables {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            stale_claim_minutes: default_stale_claim_minutes(),
            message_retention_hours: default_message_retention_hours(),
            response_retention_hours: default_response_retention_hours(),
            conversation_ttl_minutes: default_conversation_ttl_minutes(),
            conversation_max_messages: default_conversation_max_messages(),
            long_response_limit: default_long_response_limit(),
        }
    }
}

/// Ordered hook transform lists from settings.json.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub incoming: Vec<HookSpec>,
    #[serde(default)]
    pub outgoing: Vec<HookSpec>,
}

/// One configured transform: a built-in name plus its options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

/// Result of routing a raw message text against the agent/team registry.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Route to a single agent with the prefix stripped.
    DirectAgent { agent_id: String, message: String },
    /// Route to a team's leader; the team context rides along.
    TeamLeader {
        agent_id: String,
        message: String,
        team: TeamContext,
    },
    /// Two or more resolvable targets were mentioned — reply with an
    /// explanation instead of invoking anything.
    MultiTarget {
        targets: Vec<String>,
        explanation: String,
    },
}

/// A single agent response in a team chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStep {
    #[serde(rename = "agentId")]
    pub agent_id: String,
    pub response: String,
}

/// In-memory conversation tracker for team chains.
/// Not serialized — lives only in the dispatcher's memory.
#[derive(Debug)]
pub struct Conversation {
    pub id: String,
    pub channel: String,
    pub sender: String,
    pub sender_id: Option<String>,
    pub original_message: String,
    pub message_id: String,
    /// Number of pending agent branches
    pub pending: i32,
    pub responses: Vec<ChainStep>,
    pub files: HashSet<String>,
    pub total_messages: u32,
    pub max_messages: u32,
    pub team_context: Option<TeamContext>,
    pub start_time: i64,
    /// How many mentions each agent sent out
    pub outgoing_mentions: HashMap<String, u32>,
}

/// Teammate mention extracted from an agent response
#[derive(Debug, Clone)]
pub struct TeammateMention {
    pub teammate_id: String,
    pub message: String,
}
