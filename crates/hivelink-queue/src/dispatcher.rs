use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::mpsc;

use hivelink_core::config::{get_agents, get_teams, get_tunables, get_workspace_path, Paths};
use hivelink_core::events::EventBus;
use hivelink_core::hooks::{HookContext, HookPipeline};
use hivelink_core::logging::log;
use hivelink_core::routing::{agent_reset_flag, extract_mentions, find_team_for_agent, parse_routing};
use hivelink_core::types::{
    AgentConfig, ChainStep, QueueTunables, Resolution, Settings, TeamConfig, TeamContext,
};

use crate::conversation::{
    collect_files, complete_conversation, create_conversation, enqueue_internal_message,
    handle_long_response, strip_file_directives, Conversations,
};
use crate::invoke::AgentInvoker;
use crate::store::{MessageStatus, NewResponse, QueueStore, QueuedMessage};

/// Substituted for the agent's reply when its final invocation attempt fails.
const APOLOGY: &str =
    "Sorry, I encountered an error processing your request. Please check the daemon logs.";

/// How long an idle per-agent executor lingers before retiring.
const EXECUTOR_IDLE: std::time::Duration = std::time::Duration::from_secs(30);

/// The scheduling core: claims pending rows from the store and hands them to
/// per-agent serial executors. Work for distinct agents runs in parallel;
/// work for one agent runs strictly in claim order.
pub struct Dispatcher {
    store: Arc<QueueStore>,
    bus: Arc<EventBus>,
    hooks: Arc<HookPipeline>,
    invoker: Arc<dyn AgentInvoker>,
    conversations: Arc<Conversations>,
    agents: HashMap<String, AgentConfig>,
    teams: HashMap<String, TeamConfig>,
    workspace_path: PathBuf,
    paths: Arc<Paths>,
    tunables: QueueTunables,
    executors: Mutex<HashMap<String, mpsc::Sender<QueuedMessage>>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: &Settings,
        paths: Arc<Paths>,
        store: Arc<QueueStore>,
        bus: Arc<EventBus>,
        hooks: Arc<HookPipeline>,
        conversations: Arc<Conversations>,
        invoker: Arc<dyn AgentInvoker>,
    ) -> Self {
        Self {
            agents: get_agents(settings),
            teams: get_teams(settings),
            workspace_path: get_workspace_path(settings),
            tunables: get_tunables(settings),
            store,
            bus,
            hooks,
            invoker,
            conversations,
            paths,
            executors: Mutex::new(HashMap::new()),
        }
    }

    /// Main loop: wake on store notifications and a coarse tick, claim work,
    /// stop on ctrl-c.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.bus.emit(
            "processor_start",
            serde_json::json!({
                "agents": self.agents.keys().collect::<Vec<_>>(),
                "teams": self.teams.keys().collect::<Vec<_>>(),
            }),
        );
        self.log_registry();

        let notify = self.store.notify_handle();
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = notify.notified() => self.dispatch_pending().await,
                _ = interval.tick() => self.dispatch_pending().await,
                _ = &mut shutdown => {
                    log("INFO", "Shutting down dispatcher...", &self.paths.log_file);
                    break;
                }
            }
        }
        Ok(())
    }

    fn log_registry(&self) {
        log(
            "INFO",
            &format!("Loaded {} agent(s):", self.agents.len()),
            &self.paths.log_file,
        );
        for (id, agent) in &self.agents {
            log(
                "INFO",
                &format!(
                    "  {}: {} [{}/{}]",
                    id, agent.name, agent.provider, agent.model
                ),
                &self.paths.log_file,
            );
        }
        for (id, team) in &self.teams {
            log(
                "INFO",
                &format!(
                    "  team {}: {} [agents: {}] leader={}",
                    id,
                    team.name,
                    team.agents.join(", "),
                    team.leader_agent
                ),
                &self.paths.log_file,
            );
        }
    }

    /// Claim up to one message per agent with pending work and hand each to
    /// that agent's serial executor. An executor with a full inbox is skipped;
    /// its rows stay pending until it drains.
    pub async fn dispatch_pending(self: &Arc<Self>) {
        let agents = match self.store.pending_agents() {
            Ok(agents) => agents,
            Err(e) => {
                log(
                    "ERROR",
                    &format!("Failed to list pending agents: {}", e),
                    &self.paths.log_file,
                );
                return;
            }
        };

        for agent_id in agents {
            loop {
                let tx = self.executor_for(&agent_id);
                match tx.try_reserve() {
                    Ok(permit) => {
                        match self.store.claim_next(&agent_id) {
                            Ok(Some(row)) => permit.send(row),
                            Ok(None) => {}
                            Err(e) => log(
                                "ERROR",
                                &format!("Claim failed for {}: {}", agent_id, e),
                                &self.paths.log_file,
                            ),
                        }
                        break;
                    }
                    // Executor busy: leave the row pending for the next wake
                    Err(mpsc::error::TrySendError::Full(_)) => break,
                    // Executor retired between lookup and reserve: recreate
                    Err(mpsc::error::TrySendError::Closed(_)) => continue,
                };
            }
        }
    }

    /// Get or lazily create the serial executor for an agent.
    fn executor_for(self: &Arc<Self>, agent_id: &str) -> mpsc::Sender<QueuedMessage> {
        let mut executors = self.executors.lock().unwrap();
        if let Some(tx) = executors.get(agent_id) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }

        let (tx, rx) = mpsc::channel::<QueuedMessage>(1);
        executors.insert(agent_id.to_string(), tx.clone());

        let this = Arc::clone(self);
        let id = agent_id.to_string();
        tokio::spawn(async move {
            this.run_executor(id, rx).await;
        });

        tx
    }

    /// One agent's FIFO worker. Retires after an idle period so the executor
    /// map doesn't grow without bound.
    async fn run_executor(self: Arc<Self>, agent_id: String, mut rx: mpsc::Receiver<QueuedMessage>) {
        loop {
            let message = tokio::select! {
                m = rx.recv() => m,
                _ = tokio::time::sleep(EXECUTOR_IDLE) => {
                    self.executors.lock().unwrap().remove(&agent_id);
                    rx.close();
                    // Drain anything that raced in while we were retiring
                    while let Some(m) = rx.recv().await {
                        self.process(m).await;
                    }
                    return;
                }
            };

            match message {
                Some(m) => {
                    self.process(m).await;
                    // Nudge the claim loop: this agent may have more pending
                    self.store.notify_handle().notify_one();
                }
                None => return,
            }
        }
    }

    /// Process one claimed row. All failures funnel through fail_message;
    /// the terminal failure (dead letter) still apologises to the sender.
    pub async fn process(&self, message: QueuedMessage) {
        let id = message.id;
        if let Err(e) = self.process_inner(&message).await {
            log(
                "ERROR",
                &format!("Processing error for {} ({}): {}", message.message_id, id, e),
                &self.paths.log_file,
            );
            match self
                .store
                .fail_message(id, &e.to_string(), self.tunables.max_retries)
            {
                Ok(MessageStatus::Dead) => {
                    log(
                        "ERROR",
                        &format!(
                            "Message {} moved to dead letter after {} attempts",
                            message.message_id, self.tunables.max_retries
                        ),
                        &self.paths.log_file,
                    );
                    self.apologise(&message);
                }
                Ok(_) => {}
                Err(store_err) => log(
                    "ERROR",
                    &format!("Failed to record failure for {}: {}", id, store_err),
                    &self.paths.log_file,
                ),
            }
        }
    }

    /// The sender hears a one-line apology once the message is beyond retry.
    fn apologise(&self, message: &QueuedMessage) {
        if message.is_internal() {
            return;
        }
        let result = self.store.enqueue_response(&NewResponse {
            message_id: message.message_id.clone(),
            channel: message.channel.clone(),
            sender: message.sender.clone(),
            sender_id: message.sender_id.clone(),
            body: APOLOGY.to_string(),
            original_body: message.body.clone(),
            agent: None,
            files: Vec::new(),
            metadata: None,
        });
        if let Err(e) = result {
            log(
                "ERROR",
                &format!("Failed to enqueue apology for {}: {}", message.message_id, e),
                &self.paths.log_file,
            );
        }
    }

    async fn process_inner(&self, message: &QueuedMessage) -> Result<()> {
        // A stale-claim recovery may have put this row back in play elsewhere
        match self.store.get_message(message.id)? {
            Some(current)
                if current.status == MessageStatus::Processing
                    && current.claimed_by == message.claimed_by => {}
            _ => {
                log(
                    "WARN",
                    &format!(
                        "Skipping {}: claim no longer held",
                        message.message_id
                    ),
                    &self.paths.log_file,
                );
                return Ok(());
            }
        }

        let is_internal = message.is_internal();
        let raw_message = &message.body;
        let preview: String = raw_message.chars().take(50).collect();

        if is_internal {
            log(
                "INFO",
                &format!(
                    "Processing [internal] @{}->@{}: {}...",
                    message.from_agent.as_deref().unwrap_or("?"),
                    message.target_agent.as_deref().unwrap_or("?"),
                    preview
                ),
                &self.paths.log_file,
            );
        } else {
            log(
                "INFO",
                &format!(
                    "Processing [{}] from {}: {}...",
                    message.channel, message.sender, preview
                ),
                &self.paths.log_file,
            );
            self.bus.emit(
                "message_received",
                serde_json::json!({
                    "channel": message.channel,
                    "sender": message.sender,
                    "messageId": message.message_id,
                }),
            );
        }

        // Step 1-2: resolve the target. Pre-routed rows (adapter-tagged or
        // internal follow-ups) are trusted; everything else goes through the
        // resolver, which may short-circuit on multiple targets.
        let mut routed_team: Option<TeamContext> = None;
        let (mut agent_id, mut prompt) = match message.target_agent.as_ref() {
            Some(pre) if self.agents.contains_key(pre) => (pre.clone(), raw_message.clone()),
            _ => match parse_routing(raw_message, &self.agents, &self.teams) {
                Resolution::MultiTarget { explanation, targets } => {
                    log(
                        "INFO",
                        &format!("Multi-target message rejected: {}", targets.join(", ")),
                        &self.paths.log_file,
                    );
                    self.store.enqueue_response(&NewResponse {
                        message_id: message.message_id.clone(),
                        channel: message.channel.clone(),
                        sender: message.sender.clone(),
                        sender_id: message.sender_id.clone(),
                        body: explanation,
                        original_body: raw_message.clone(),
                        agent: None,
                        files: Vec::new(),
                        metadata: None,
                    })?;
                    self.bus.emit(
                        "response_ready",
                        serde_json::json!({
                            "channel": message.channel,
                            "sender": message.sender,
                            "messageId": message.message_id,
                            "multiTarget": targets,
                        }),
                    );
                    self.store.complete_message(message.id)?;
                    return Ok(());
                }
                Resolution::DirectAgent { agent_id, message } => (agent_id, message),
                Resolution::TeamLeader {
                    agent_id,
                    message,
                    team,
                } => {
                    routed_team = Some(team);
                    (agent_id, message)
                }
            },
        };

        // Step 3: unknown agent falls back to default, then to any agent
        if !self.agents.contains_key(&agent_id) {
            agent_id = "default".to_string();
            prompt = raw_message.clone();
        }
        if !self.agents.contains_key(&agent_id) {
            match self.agents.keys().next() {
                Some(first) => agent_id = first.clone(),
                None => anyhow::bail!("No agents configured"),
            }
        }

        let agent = self.agents[&agent_id].clone();
        log(
            "INFO",
            &format!(
                "Routing to agent: {} ({}) [{}/{}]",
                agent.name, agent_id, agent.provider, agent.model
            ),
            &self.paths.log_file,
        );
        if !is_internal {
            self.bus.emit(
                "agent_routed",
                serde_json::json!({
                    "agentId": agent_id,
                    "agentName": agent.name,
                    "provider": agent.provider,
                    "model": agent.model,
                    "isTeamRouted": routed_team.is_some(),
                }),
            );
        }

        // Step 4: team context. Internal follow-ups inherit their
        // conversation's; an orphan whose conversation was swept is a no-op.
        let team_context: Option<TeamContext> = if is_internal {
            let conversation_id = message.conversation_id.as_deref().unwrap_or_default();
            match self.conversations.get(conversation_id) {
                Some(handle) => handle.lock().await.team_context.clone(),
                None => {
                    log(
                        "WARN",
                        &format!(
                            "Dropping orphan branch for expired conversation {}",
                            conversation_id
                        ),
                        &self.paths.log_file,
                    );
                    self.store.complete_message(message.id)?;
                    return Ok(());
                }
            }
        } else {
            routed_team
                .clone()
                .or_else(|| find_team_for_agent(&agent_id, &self.teams))
        };

        // Step 5: consume the reset flag if present
        let reset_flag = agent_reset_flag(&agent_id, &self.workspace_path);
        let should_reset = reset_flag.exists();
        if should_reset {
            let _ = std::fs::remove_file(&reset_flag);
            log(
                "INFO",
                &format!("Consumed reset flag for agent {}", agent_id),
                &self.paths.log_file,
            );
        }

        // Step 6: tell the agent when sibling branches are still in flight
        if is_internal {
            if let Some(conversation_id) = message.conversation_id.as_deref() {
                if let Some(handle) = self.conversations.get(conversation_id) {
                    let others_pending = handle.lock().await.pending - 1;
                    if others_pending > 0 {
                        prompt = format!(
                            "{}\n\n------\n\n[{} other teammate response(s) are still being processed and will be delivered when ready. Do not re-mention teammates who haven't responded yet.]",
                            prompt, others_pending
                        );
                    }
                }
            }
        }

        // Step 7: incoming hooks
        let ctx = HookContext {
            channel: &message.channel,
            sender: &message.sender,
            message_id: &message.message_id,
            original_text: raw_message,
        };
        let (prompt, incoming_meta) =
            self.hooks
                .run_incoming(&prompt, &ctx, &self.paths.log_file);

        // Step 8: invoke. An error here propagates into the retry funnel.
        self.bus.emit(
            "chain_step_start",
            serde_json::json!({
                "agentId": agent_id,
                "agentName": agent.name,
                "fromAgent": message.from_agent,
            }),
        );
        let response = self
            .invoker
            .invoke(&agent, &agent_id, &prompt, &self.workspace_path, should_reset)
            .await?;
        self.bus.emit(
            "chain_step_done",
            serde_json::json!({
                "agentId": agent_id,
                "agentName": agent.name,
                "responseLength": response.len(),
            }),
        );

        // Step 9: no team context means a plain single-agent reply
        let Some(team_context) = team_context else {
            let mut outbound_files = HashSet::new();
            collect_files(&response, &mut outbound_files);
            let final_response = strip_file_directives(response.trim());
            let outbound_files: Vec<String> = outbound_files.into_iter().collect();

            let (final_response, all_files) = handle_long_response(
                &final_response,
                &outbound_files,
                self.tunables.long_response_limit,
                &self.paths.files_dir,
                &self.paths.log_file,
            );

            let (final_response, outgoing_meta) =
                self.hooks
                    .run_outgoing(&final_response, &ctx, &self.paths.log_file);
            let mut metadata = incoming_meta;
            for (k, v) in outgoing_meta {
                metadata.insert(k, v);
            }

            self.store.enqueue_response(&NewResponse {
                message_id: message.message_id.clone(),
                channel: message.channel.clone(),
                sender: message.sender.clone(),
                sender_id: message.sender_id.clone(),
                body: final_response.clone(),
                original_body: raw_message.clone(),
                agent: Some(agent_id.clone()),
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
                    "Response ready [{}] {} via agent:{} ({} chars)",
                    message.channel,
                    message.sender,
                    agent_id,
                    final_response.len()
                ),
                &self.paths.log_file,
            );
            self.bus.emit(
                "response_ready",
                serde_json::json!({
                    "channel": message.channel,
                    "sender": message.sender,
                    "agentId": agent_id,
                    "responseLength": final_response.len(),
                    "messageId": message.message_id,
                }),
            );

            self.store.complete_message(message.id)?;
            return Ok(());
        };

        // Step 10: conversation bookkeeping under the per-conversation lock
        let handle = if is_internal {
            let conversation_id = message.conversation_id.as_deref().unwrap_or_default();
            match self.conversations.get(conversation_id) {
                Some(handle) => handle,
                None => {
                    // The conversation expired while the agent was thinking
                    log(
                        "WARN",
                        &format!(
                            "Conversation {} expired mid-step; dropping branch result",
                            conversation_id
                        ),
                        &self.paths.log_file,
                    );
                    self.store.complete_message(message.id)?;
                    return Ok(());
                }
            }
        } else {
            let conversation = create_conversation(
                message,
                raw_message,
                Some(team_context.clone()),
                self.tunables.conversation_max_messages,
            );
            log(
                "INFO",
                &format!(
                    "Conversation started: {} (team: {})",
                    conversation.id, team_context.team.name
                ),
                &self.paths.log_file,
            );
            self.bus.emit(
                "team_chain_start",
                serde_json::json!({
                    "teamId": team_context.team_id,
                    "teamName": team_context.team.name,
                    "agents": team_context.team.agents,
                    "leader": team_context.team.leader_agent,
                    "conversationId": conversation.id,
                }),
            );
            self.conversations.insert(conversation)
        };

        let (conversation_id, should_complete) = {
            let mut conversation = handle.lock().await;
            conversation.responses.push(ChainStep {
                agent_id: agent_id.clone(),
                response: response.clone(),
            });
            conversation.total_messages += 1;
            collect_files(&response, &mut conversation.files);

            let mentions = extract_mentions(&response, &agent_id, &team_context.team, &self.agents);

            if !mentions.is_empty() && conversation.total_messages < conversation.max_messages {
                let mut enqueued: u32 = 0;
                for mention in &mentions {
                    log(
                        "INFO",
                        &format!("@{} -> @{} (team)", agent_id, mention.teammate_id),
                        &self.paths.log_file,
                    );
                    let internal_msg = format!(
                        "[Message from teammate @{}]:\n{}",
                        agent_id, mention.message
                    );
                    match enqueue_internal_message(
                        &self.store,
                        &conversation.id,
                        &agent_id,
                        &mention.teammate_id,
                        &internal_msg,
                        message,
                        &self.paths.log_file,
                    ) {
                        Ok(_) => {
                            enqueued += 1;
                            self.bus.emit(
                                "chain_handoff",
                                serde_json::json!({
                                    "teamId": team_context.team_id,
                                    "fromAgent": agent_id,
                                    "toAgent": mention.teammate_id,
                                    "conversationId": conversation.id,
                                }),
                            );
                            self.bus.emit(
                                "message_enqueued",
                                serde_json::json!({
                                    "internal": true,
                                    "toAgent": mention.teammate_id,
                                    "conversationId": conversation.id,
                                }),
                            );
                        }
                        Err(e) => log(
                            "ERROR",
                            &format!(
                                "Failed to enqueue follow-up @{} -> @{}: {}",
                                agent_id, mention.teammate_id, e
                            ),
                            &self.paths.log_file,
                        ),
                    }
                }
                conversation.pending += enqueued as i32;
                if enqueued > 0 {
                    conversation
                        .outgoing_mentions
                        .insert(agent_id.clone(), enqueued);
                }
            } else if !mentions.is_empty() {
                log(
                    "WARN",
                    &format!(
                        "Conversation {} hit max messages ({}) -- not enqueuing further mentions",
                        conversation.id, conversation.max_messages
                    ),
                    &self.paths.log_file,
                );
            }

            // This branch is done
            conversation.pending -= 1;
            (conversation.id.clone(), conversation.pending == 0)
        };

        if should_complete {
            if let Some(handle) = self.conversations.remove(&conversation_id) {
                let conversation = handle.lock().await;
                complete_conversation(
                    &conversation,
                    &self.store,
                    &self.bus,
                    &self.hooks,
                    &self.paths,
                    &self.agents,
                    &self.tunables,
                )?;
            }
        } else {
            let pending = handle.lock().await.pending;
            log(
                "INFO",
                &format!(
                    "Conversation {}: {} branch(es) still pending",
                    conversation_id, pending
                ),
                &self.paths.log_file,
            );
        }

        self.store.complete_message(message.id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewMessage;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::Path;
    use tempfile::TempDir;

    struct StubInvoker {
        scripts: Mutex<HashMap<String, VecDeque<String>>>,
        calls: Mutex<Vec<(String, String, bool)>>,
        failing: HashSet<String>,
    }

    impl StubInvoker {
        fn new() -> Self {
            Self {
                scripts: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                failing: HashSet::new(),
            }
        }

        fn script(self, agent_id: &str, responses: &[&str]) -> Self {
            self.scripts.lock().unwrap().insert(
                agent_id.to_string(),
                responses.iter().map(|s| s.to_string()).collect(),
            );
            self
        }

        fn failing(mut self, agent_id: &str) -> Self {
            self.failing.insert(agent_id.to_string());
            self
        }

        fn calls(&self) -> Vec<(String, String, bool)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentInvoker for StubInvoker {
        async fn invoke(
            &self,
            _agent: &AgentConfig,
            agent_id: &str,
            prompt: &str,
            _workspace_path: &Path,
            reset: bool,
        ) -> Result<String> {
            self.calls
                .lock()
                .unwrap()
                .push((agent_id.to_string(), prompt.to_string(), reset));
            if self.failing.contains(agent_id) {
                anyhow::bail!("exit code 1");
            }
            let scripted = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(agent_id)
                .and_then(|q| q.pop_front());
            Ok(scripted.unwrap_or_else(|| "ok".to_string()))
        }
    }

    struct Fixture {
        _tmp: TempDir,
        dispatcher: Arc<Dispatcher>,
        store: Arc<QueueStore>,
        conversations: Arc<Conversations>,
        invoker: Arc<StubInvoker>,
    }

    fn agent(name: &str) -> AgentConfig {
        AgentConfig {
            name: name.to_string(),
            provider: "anthropic".to_string(),
            model: "sonnet".to_string(),
            working_directory: None,
            system_prompt: None,
            prompt_file: None,
        }
    }

    fn fixture(
        agents: &[(&str, &str)],
        teams: &[(&str, &[&str], &str)],
        invoker: StubInvoker,
        tune: impl FnOnce(&mut QueueTunables),
    ) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let paths = Arc::new(Paths::at(tmp.path().join(".hivelink")));
        paths.ensure_dirs().unwrap();

        let mut settings = Settings::default();
        settings.workspace = Some(hivelink_core::types::WorkspaceConfig {
            path: Some(tmp.path().join("workspace").to_string_lossy().to_string()),
        });
        settings.agents = Some(
            agents
                .iter()
                .map(|(id, name)| (id.to_string(), agent(name)))
                .collect(),
        );
        settings.teams = Some(
            teams
                .iter()
                .map(|(id, members, leader)| {
                    (
                        id.to_string(),
                        TeamConfig {
                            name: id.to_string(),
                            agents: members.iter().map(|m| m.to_string()).collect(),
                            leader_agent: leader.to_string(),
                            description: None,
                        },
                    )
                })
                .collect(),
        );
        let mut tunables = QueueTunables::default();
        tune(&mut tunables);
        settings.queue = Some(tunables);

        let store = Arc::new(QueueStore::open(&paths.db_file).unwrap());
        let bus = Arc::new(EventBus::new(paths.log_file.clone()));
        let hooks = Arc::new(HookPipeline::empty());
        let conversations = Arc::new(Conversations::new());
        let invoker = Arc::new(invoker);

        let invoker_dyn: Arc<dyn AgentInvoker> = invoker.clone();
        let dispatcher = Arc::new(Dispatcher::new(
            &settings,
            Arc::clone(&paths),
            Arc::clone(&store),
            bus,
            hooks,
            Arc::clone(&conversations),
            invoker_dyn,
        ));

        Fixture {
            _tmp: tmp,
            dispatcher,
            store,
            conversations,
            invoker,
        }
    }

    fn external(message_id: &str, body: &str, target: Option<&str>) -> NewMessage {
        NewMessage {
            message_id: message_id.to_string(),
            channel: "telegram".to_string(),
            sender: "Alice".to_string(),
            sender_id: Some("alice-1".to_string()),
            body: body.to_string(),
            target_agent: target.map(|t| t.to_string()),
            ..Default::default()
        }
    }

    /// Drive dispatch cycles until the condition holds or the deadline hits.
    async fn drive_until<F: Fn() -> bool>(fixture: &Fixture, condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            fixture.dispatcher.dispatch_pending().await;
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_direct_reply() {
        let fixture = fixture(
            &[("assistant", "Assistant")],
            &[],
            StubInvoker::new().script("assistant", &["pong"]),
            |_| {},
        );
        fixture
            .store
            .enqueue_message(&external("m1", "ping", None))
            .unwrap();

        drive_until(&fixture, || {
            !fixture.store.pending_responses("telegram").unwrap().is_empty()
        })
        .await;

        let responses = fixture.store.pending_responses("telegram").unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].message_id, "m1");
        assert_eq!(responses[0].agent.as_deref(), Some("assistant"));
        assert_eq!(responses[0].body, "pong");

        let snapshot = fixture.store.snapshot().unwrap();
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.pending, 0);
    }

    #[tokio::test]
    async fn test_explicit_routing_strips_prefix() {
        let fixture = fixture(
            &[("assistant", "Assistant"), ("coder", "Coder")],
            &[],
            StubInvoker::new(),
            |_| {},
        );
        fixture
            .store
            .enqueue_message(&external("m1", "@coder fix the login bug", None))
            .unwrap();

        drive_until(&fixture, || {
            !fixture.store.pending_responses("telegram").unwrap().is_empty()
        })
        .await;

        let calls = fixture.invoker.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "coder");
        assert_eq!(calls[0].1, "fix the login bug");
    }

    #[tokio::test]
    async fn test_multi_target_short_circuits() {
        let fixture = fixture(
            &[("coder", "Coder"), ("writer", "Writer")],
            &[],
            StubInvoker::new(),
            |_| {},
        );
        fixture
            .store
            .enqueue_message(&external("m1", "@coder @writer please coordinate", None))
            .unwrap();

        drive_until(&fixture, || {
            !fixture.store.pending_responses("telegram").unwrap().is_empty()
        })
        .await;

        // No agent was invoked
        assert!(fixture.invoker.calls().is_empty());

        let responses = fixture.store.pending_responses("telegram").unwrap();
        assert_eq!(responses.len(), 1);
        assert!(responses[0].body.contains("@coder, @writer"));
        assert!(responses[0].body.contains("separate message"));
        assert_eq!(fixture.store.snapshot().unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_team_chain_single_handoff() {
        let fixture = fixture(
            &[("coder", "Coder"), ("reviewer", "Reviewer")],
            &[("dev", &["coder", "reviewer"], "coder")],
            StubInvoker::new()
                .script("coder", &["Done. [@reviewer: please double-check]"])
                .script("reviewer", &["LGTM, ship it."]),
            |_| {},
        );
        fixture
            .store
            .enqueue_message(&external("m1", "@dev ship it", None))
            .unwrap();

        drive_until(&fixture, || {
            !fixture.store.pending_responses("telegram").unwrap().is_empty()
        })
        .await;

        let responses = fixture.store.pending_responses("telegram").unwrap();
        assert_eq!(responses.len(), 1);
        let response = &responses[0];
        assert_eq!(response.message_id, "m1");
        // Tagged with the team leader
        assert_eq!(response.agent.as_deref(), Some("coder"));
        assert!(response.body.contains("Done."));
        assert!(response.body.contains("LGTM"));
        // Coder's step appears before reviewer's (completion order)
        assert!(response.body.find("Done.").unwrap() < response.body.find("LGTM").unwrap());

        // Conversation was torn down, both rows completed
        assert_eq!(fixture.conversations.count(), 0);
        assert_eq!(fixture.store.snapshot().unwrap().completed, 2);

        // Reviewer saw the forwarded mention
        let calls = fixture.invoker.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0, "reviewer");
        assert!(calls[1].1.contains("[Message from teammate @coder]"));
        assert!(calls[1].1.contains("please double-check"));
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_retries() {
        let fixture = fixture(
            &[("assistant", "Assistant"), ("broken", "Broken")],
            &[],
            StubInvoker::new().failing("broken"),
            |_| {},
        );
        fixture
            .store
            .enqueue_message(&external("m1", "hello", Some("broken")))
            .unwrap();

        drive_until(&fixture, || {
            !fixture.store.dead_messages().unwrap().is_empty()
        })
        .await;

        let dead = fixture.store.dead_messages().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, 5);
        assert_eq!(dead[0].last_error.as_deref(), Some("exit code 1"));
        assert_eq!(fixture.invoker.calls().len(), 5);

        // The sender got the apology exactly once
        let responses = fixture.store.pending_responses("telegram").unwrap();
        assert_eq!(responses.len(), 1);
        assert!(responses[0].body.starts_with("Sorry"));

        // Operator retry puts it back in rotation
        assert!(fixture.store.retry_dead(dead[0].id).unwrap());
        assert_eq!(fixture.store.snapshot().unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_orphan_internal_branch_is_noop() {
        let fixture = fixture(
            &[("coder", "Coder"), ("reviewer", "Reviewer")],
            &[("dev", &["coder", "reviewer"], "coder")],
            StubInvoker::new(),
            |_| {},
        );
        fixture
            .store
            .enqueue_message(&NewMessage {
                message_id: "internal_gone_reviewer_1".to_string(),
                channel: "telegram".to_string(),
                sender: "Alice".to_string(),
                sender_id: None,
                body: "[Message from teammate @coder]:\ncheck this".to_string(),
                target_agent: Some("reviewer".to_string()),
                files: Vec::new(),
                conversation_id: Some("gone_123".to_string()),
                from_agent: Some("coder".to_string()),
            })
            .unwrap();

        drive_until(&fixture, || {
            fixture.store.snapshot().unwrap().completed == 1
        })
        .await;

        assert!(fixture.invoker.calls().is_empty());
        assert!(fixture.store.pending_responses("telegram").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conversation_cap_ignores_further_mentions() {
        let fixture = fixture(
            &[("coder", "Coder"), ("reviewer", "Reviewer")],
            &[("dev", &["coder", "reviewer"], "coder")],
            StubInvoker::new().script("coder", &["Done. [@reviewer: take a look]"]),
            |t| t.conversation_max_messages = 1,
        );
        fixture
            .store
            .enqueue_message(&external("m1", "@dev ship it", None))
            .unwrap();

        drive_until(&fixture, || {
            !fixture.store.pending_responses("telegram").unwrap().is_empty()
        })
        .await;

        // Only the leader ran; the mention was dropped at the cap
        assert_eq!(fixture.invoker.calls().len(), 1);
        let responses = fixture.store.pending_responses("telegram").unwrap();
        assert_eq!(responses.len(), 1);
        assert!(responses[0].body.contains("Done."));
        assert_eq!(fixture.conversations.count(), 0);
    }

    #[tokio::test]
    async fn test_reset_flag_consumed() {
        let fixture = fixture(
            &[("assistant", "Assistant")],
            &[],
            StubInvoker::new(),
            |_| {},
        );

        let workspace = fixture.dispatcher.workspace_path.clone();
        let flag = agent_reset_flag("assistant", &workspace);
        std::fs::create_dir_all(flag.parent().unwrap()).unwrap();
        std::fs::write(&flag, "").unwrap();

        fixture
            .store
            .enqueue_message(&external("m1", "hello", Some("assistant")))
            .unwrap();

        drive_until(&fixture, || {
            !fixture.store.pending_responses("telegram").unwrap().is_empty()
        })
        .await;

        let calls = fixture.invoker.calls();
        assert!(calls[0].2, "first call after the flag should reset");
        assert!(!flag.exists(), "flag is consumed");
    }

    #[tokio::test]
    async fn test_per_agent_fifo_order() {
        let fixture = fixture(
            &[("assistant", "Assistant")],
            &[],
            StubInvoker::new(),
            |_| {},
        );
        for i in 0..4 {
            fixture
                .store
                .enqueue_message(&external(
                    &format!("m{}", i),
                    &format!("message {}", i),
                    Some("assistant"),
                ))
                .unwrap();
        }

        drive_until(&fixture, || {
            fixture.store.snapshot().unwrap().completed == 4
        })
        .await;

        let prompts: Vec<String> = fixture.invoker.calls().iter().map(|c| c.1.clone()).collect();
        assert_eq!(
            prompts,
            vec!["message 0", "message 1", "message 2", "message 3"]
        );
    }
}
