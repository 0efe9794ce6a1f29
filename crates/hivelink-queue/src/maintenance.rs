use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hivelink_core::config::Paths;
use hivelink_core::events::EventBus;
use hivelink_core::hooks::HookPipeline;
use hivelink_core::logging::log;
use hivelink_core::types::{AgentConfig, QueueTunables};

use crate::conversation::{complete_conversation, Conversations};
use crate::store::QueueStore;

const STALE_RECOVERY_TICKS: u64 = 5; // every 5 min
const PRUNE_TICKS: u64 = 60; // every 1 h
const CONVERSATION_SWEEP_TICKS: u64 = 30; // every 30 min

/// Periodic housekeeping: stale-claim recovery, row pruning, and the
/// conversation TTL sweep. Everything rides one cooperative one-minute timer
/// so the dispatcher is never starved.
#[allow(clippy::too_many_arguments)]
pub async fn run_maintenance(
    store: Arc<QueueStore>,
    conversations: Arc<Conversations>,
    bus: Arc<EventBus>,
    hooks: Arc<HookPipeline>,
    paths: Arc<Paths>,
    agents: HashMap<String, AgentConfig>,
    tunables: QueueTunables,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // First tick fires immediately; skip it so tasks start one minute in
    interval.tick().await;

    let mut tick: u64 = 0;
    loop {
        interval.tick().await;
        tick += 1;

        if tick % STALE_RECOVERY_TICKS == 0 {
            match store.recover_stale(Duration::from_secs(tunables.stale_claim_minutes * 60)) {
                Ok(0) => {}
                Ok(n) => log(
                    "INFO",
                    &format!("Recovered {} stale claim(s)", n),
                    &paths.log_file,
                ),
                Err(e) => log(
                    "ERROR",
                    &format!("Stale claim recovery failed: {}", e),
                    &paths.log_file,
                ),
            }
        }

        if tick % PRUNE_TICKS == 0 {
            match store.prune_completed(Duration::from_secs(
                tunables.message_retention_hours * 3600,
            )) {
                Ok(0) => {}
                Ok(n) => log(
                    "INFO",
                    &format!("Pruned {} completed message(s)", n),
                    &paths.log_file,
                ),
                Err(e) => log(
                    "ERROR",
                    &format!("Completed-message pruning failed: {}", e),
                    &paths.log_file,
                ),
            }
            match store.prune_acked(Duration::from_secs(
                tunables.response_retention_hours * 3600,
            )) {
                Ok(0) => {}
                Ok(n) => log(
                    "INFO",
                    &format!("Pruned {} acked response(s)", n),
                    &paths.log_file,
                ),
                Err(e) => log(
                    "ERROR",
                    &format!("Acked-response pruning failed: {}", e),
                    &paths.log_file,
                ),
            }
        }

        if tick % CONVERSATION_SWEEP_TICKS == 0 {
            sweep_conversations(
                &store,
                &conversations,
                &bus,
                &hooks,
                &paths,
                &agents,
                &tunables,
            )
            .await;
        }
    }
}

/// Remove conversations past their TTL. Whatever steps a timed-out chain
/// accumulated are flushed to the sender as a partial reply; branches that
/// complete afterwards find no conversation and no-op.
pub async fn sweep_conversations(
    store: &QueueStore,
    conversations: &Conversations,
    bus: &EventBus,
    hooks: &HookPipeline,
    paths: &Paths,
    agents: &HashMap<String, AgentConfig>,
    tunables: &QueueTunables,
) {
    let ttl_ms = (tunables.conversation_ttl_minutes * 60 * 1000) as i64;
    for handle in conversations.take_expired(ttl_ms) {
        let mut conversation = handle.lock().await;
        log(
            "WARN",
            &format!(
                "Conversation {} timed out ({} pending branch(es), {} step(s) recorded)",
                conversation.id,
                conversation.pending,
                conversation.responses.len()
            ),
            &paths.log_file,
        );
        bus.emit(
            "conversation_timeout",
            serde_json::json!({
                "conversationId": conversation.id,
                "pending": conversation.pending,
                "steps": conversation.responses.len(),
            }),
        );

        if conversation.responses.is_empty() {
            continue;
        }
        conversation.pending = 0;
        if let Err(e) =
            complete_conversation(&conversation, store, bus, hooks, paths, agents, tunables)
        {
            log(
                "ERROR",
                &format!(
                    "Failed to flush timed-out conversation {}: {}",
                    conversation.id, e
                ),
                &paths.log_file,
            );
        }
    }
}
