use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;

use hivelink_core::config::Paths;
use hivelink_core::events::EventBus;
use hivelink_core::hooks::{HookContext, HookPipeline};
use hivelink_core::logging::log;
use hivelink_core::now_millis;
use hivelink_core::types::{AgentConfig, Conversation, QueueTunables, TeamContext};

use crate::store::{NewMessage, NewResponse, QueueStore, QueuedMessage};

static SEND_FILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[send_file:\s*([^\]]+)\]").unwrap());
static SEND_FILE_STRIP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[send_file:\s*[^\]]+\]").unwrap());
static MENTION_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[@\S+?:\s*[\s\S]*?\]").unwrap());

/// Registry of live conversations. The map lock is brief; each conversation
/// carries its own mutex which serialises step completions and mention
/// enqueues.
pub struct Conversations {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Conversation>>>>,
}

impl Conversations {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<tokio::sync::Mutex<Conversation>>> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    pub fn insert(&self, conversation: Conversation) -> Arc<tokio::sync::Mutex<Conversation>> {
        let id = conversation.id.clone();
        let handle = Arc::new(tokio::sync::Mutex::new(conversation));
        self.inner.lock().unwrap().insert(id, Arc::clone(&handle));
        handle
    }

    pub fn remove(&self, id: &str) -> Option<Arc<tokio::sync::Mutex<Conversation>>> {
        self.inner.lock().unwrap().remove(id)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Remove and return every conversation older than the TTL.
    pub fn take_expired(&self, ttl_ms: i64) -> Vec<Arc<tokio::sync::Mutex<Conversation>>> {
        let now = now_millis();
        let mut map = self.inner.lock().unwrap();
        let expired: Vec<String> = map
            .iter()
            .filter(|(_, c)| {
                // try_lock never contends for long; a held lock means the
                // conversation is mid-step and not abandoned
                c.try_lock()
                    .map(|conv| now - conv.start_time > ttl_ms)
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        expired.into_iter().filter_map(|id| map.remove(&id)).collect()
    }
}

impl Default for Conversations {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a new Conversation. The id concatenates the originating message id
/// and a timestamp so it is unique and stable for observability.
pub fn create_conversation(
    message: &QueuedMessage,
    original_message: &str,
    team_context: Option<TeamContext>,
    max_messages: u32,
) -> Conversation {
    let conv_id = format!("{}_{}", message.message_id, now_millis());

    Conversation {
        id: conv_id,
        channel: message.channel.clone(),
        sender: message.sender.clone(),
        sender_id: message.sender_id.clone(),
        original_message: original_message.to_string(),
        message_id: message.message_id.clone(),
        pending: 1,
        responses: Vec::new(),
        files: HashSet::new(),
        total_messages: 0,
        max_messages,
        team_context,
        start_time: now_millis(),
        outgoing_mentions: HashMap::new(),
    }
}

/// Collect file references (`[send_file: path]`) from a response text.
/// Only paths that exist on disk are kept.
pub fn collect_files(response: &str, file_set: &mut HashSet<String>) {
    for caps in SEND_FILE_RE.captures_iter(response) {
        let path = caps[1].trim().to_string();
        if Path::new(&path).exists() {
            file_set.insert(path);
        }
    }
}

/// Remove `[send_file: ...]` directives from a response text.
pub fn strip_file_directives(response: &str) -> String {
    SEND_FILE_STRIP_RE.replace_all(response, "").trim().to_string()
}

/// Remove `[@agent: ...]` mention tags from a final user-facing text.
pub fn strip_mention_tags(response: &str) -> String {
    MENTION_TAG_RE.replace_all(response, "").trim().to_string()
}

/// If a response exceeds the limit, save the full text as a .md file
/// and return a truncated preview with the file attached.
pub fn handle_long_response(
    response: &str,
    existing_files: &[String],
    limit: usize,
    files_dir: &Path,
    log_file: &Path,
) -> (String, Vec<String>) {
    if response.chars().count() <= limit {
        return (response.to_string(), existing_files.to_vec());
    }

    let filename = format!("response_{}.md", now_millis());
    let file_path = files_dir.join(&filename);
    let _ = std::fs::create_dir_all(files_dir);
    let _ = std::fs::write(&file_path, response);
    log(
        "INFO",
        &format!(
            "Long response ({} chars) saved to {}",
            response.len(),
            filename
        ),
        log_file,
    );

    let preview: String = response.chars().take(limit).collect();
    let preview = format!("{}\n\n_(Full response attached as file)_", preview);
    let mut files = existing_files.to_vec();
    files.push(file_path.to_string_lossy().to_string());
    (preview, files)
}

fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..36u8);
            if idx < 10 {
                (b'0' + idx) as char
            } else {
                (b'a' + idx - 10) as char
            }
        })
        .collect()
}

/// Enqueue an internal (agent-to-agent) follow-up into the queue store.
pub fn enqueue_internal_message(
    store: &QueueStore,
    conversation_id: &str,
    from_agent: &str,
    target_agent: &str,
    message: &str,
    original: &QueuedMessage,
    log_file: &Path,
) -> Result<i64> {
    let internal = NewMessage {
        message_id: format!(
            "internal_{}_{}_{}_{}",
            conversation_id,
            target_agent,
            now_millis(),
            random_suffix(4)
        ),
        channel: original.channel.clone(),
        sender: original.sender.clone(),
        sender_id: original.sender_id.clone(),
        body: message.to_string(),
        target_agent: Some(target_agent.to_string()),
        files: Vec::new(),
        conversation_id: Some(conversation_id.to_string()),
        from_agent: Some(from_agent.to_string()),
    };

    let id = store.enqueue_message(&internal)?;
    log(
        "INFO",
        &format!(
            "Enqueued internal message: @{} -> @{}",
            from_agent, target_agent
        ),
        log_file,
    );
    Ok(id)
}

/// Compose the final user-facing reply from the chain's step records, in
/// completion order, each prefixed with the agent's display name.
pub fn compose_final_response(
    conversation: &Conversation,
    agents: &HashMap<String, AgentConfig>,
) -> String {
    if conversation.responses.len() == 1 {
        return conversation.responses[0].response.clone();
    }
    conversation
        .responses
        .iter()
        .map(|step| {
            let label = match agents.get(&step.agent_id) {
                Some(agent) => format!("{} (@{})", agent.name, step.agent_id),
                None => format!("@{}", step.agent_id),
            };
            format!("{}:\n{}", label, step.response)
        })
        .collect::<Vec<_>>()
        .join("\n\n------\n\n")
}

/// Complete a conversation: aggregate responses, run outgoing hooks once,
/// enqueue a single response row, archive the chat, emit team_chain_end.
pub fn complete_conversation(
    conversation: &Conversation,
    store: &QueueStore,
    bus: &EventBus,
    hooks: &HookPipeline,
    paths: &Paths,
    agents: &HashMap<String, AgentConfig>,
    tunables: &QueueTunables,
) -> Result<()> {
    log(
        "INFO",
        &format!(
            "Conversation {} complete -- {} response(s), {} total message(s)",
            conversation.id,
            conversation.responses.len(),
            conversation.total_messages
        ),
        &paths.log_file,
    );

    let team_id = conversation
        .team_context
        .as_ref()
        .map(|tc| tc.team_id.as_str())
        .unwrap_or("direct");
    bus.emit(
        "team_chain_end",
        serde_json::json!({
            "teamId": team_id,
            "conversationId": conversation.id,
            "totalSteps": conversation.responses.len(),
            "agents": conversation
                .responses
                .iter()
                .map(|s| s.agent_id.as_str())
                .collect::<Vec<_>>(),
        }),
    );

    if conversation.team_context.is_some() {
        save_chat_history(conversation, agents, &paths.chats_dir, &paths.log_file);
    }

    let composed = compose_final_response(conversation, agents);

    // File directives and leftover mention tags never reach the user
    let mut outbound_files: HashSet<String> = conversation.files.clone();
    collect_files(&composed, &mut outbound_files);
    let final_response = strip_mention_tags(&strip_file_directives(&composed));
    let outbound_files: Vec<String> = outbound_files.into_iter().collect();

    let (final_response, all_files) = handle_long_response(
        &final_response,
        &outbound_files,
        tunables.long_response_limit,
        &paths.files_dir,
        &paths.log_file,
    );

    let ctx = HookContext {
        channel: &conversation.channel,
        sender: &conversation.sender,
        message_id: &conversation.message_id,
        original_text: &conversation.original_message,
    };
    let (final_response, metadata) = hooks.run_outgoing(&final_response, &ctx, &paths.log_file);

    let responding_agent = conversation
        .team_context
        .as_ref()
        .map(|tc| tc.team.leader_agent.clone())
        .or_else(|| conversation.responses.last().map(|s| s.agent_id.clone()));

    store.enqueue_response(&NewResponse {
        message_id: conversation.message_id.clone(),
        channel: conversation.channel.clone(),
        sender: conversation.sender.clone(),
        sender_id: conversation.sender_id.clone(),
        body: final_response.clone(),
        original_body: conversation.original_message.clone(),
        agent: responding_agent.clone(),
        files: all_files,
        metadata: if metadata.is_empty() {
            None
        } else {
            Some(serde_json::Value::Object(metadata))
        },
    })?;

    log(
        "INFO",
        &format!(
            "Response ready [{}] {} ({} chars)",
            conversation.channel,
            conversation.sender,
            final_response.len()
        ),
        &paths.log_file,
    );
    bus.emit(
        "response_ready",
        serde_json::json!({
            "channel": conversation.channel,
            "sender": conversation.sender,
            "agentId": responding_agent,
            "responseLength": final_response.len(),
            "messageId": conversation.message_id,
        }),
    );

    Ok(())
}

/// Save the team conversation chat history to a markdown file.
fn save_chat_history(
    conversation: &Conversation,
    agents: &HashMap<String, AgentConfig>,
    chats_dir: &Path,
    log_file: &Path,
) {
    let result: Result<()> = (|| {
        let tc = conversation
            .team_context
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No team context for chat history"))?;
        let team_chats_dir = chats_dir.join(&tc.team_id);
        std::fs::create_dir_all(&team_chats_dir)?;

        let mut lines = Vec::new();
        lines.push(format!(
            "# Team Conversation: {} (@{})",
            tc.team.name, tc.team_id
        ));
        lines.push(format!("**Date:** {}", chrono::Utc::now().to_rfc3339()));
        lines.push(format!(
            "**Channel:** {} | **Sender:** {}",
            conversation.channel, conversation.sender
        ));
        lines.push(format!("**Messages:** {}", conversation.total_messages));
        lines.push(String::new());
        lines.push("------".to_string());
        lines.push(String::new());
        lines.push("## User Message".to_string());
        lines.push(String::new());
        lines.push(conversation.original_message.clone());
        lines.push(String::new());

        for step in &conversation.responses {
            let step_label = if let Some(agent) = agents.get(&step.agent_id) {
                format!("{} (@{})", agent.name, step.agent_id)
            } else {
                format!("@{}", step.agent_id)
            };
            lines.push("------".to_string());
            lines.push(String::new());
            lines.push(format!("## {}", step_label));
            lines.push(String::new());
            lines.push(step.response.clone());
            lines.push(String::new());
        }

        let date_time = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S").to_string();
        std::fs::write(
            team_chats_dir.join(format!("{}.md", date_time)),
            lines.join("\n"),
        )?;
        log("INFO", "Chat history saved", log_file);
        Ok(())
    })();

    if let Err(e) = result {
        log(
            "ERROR",
            &format!("Failed to save chat history: {}", e),
            log_file,
        );
    }
}
