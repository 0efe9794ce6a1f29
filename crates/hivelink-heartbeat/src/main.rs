use std::path::PathBuf;

use anyhow::Result;

use hivelink_core::config::{get_agents, get_settings, get_workspace_path, Paths};
use hivelink_core::logging::log;
use hivelink_core::now_millis;
use hivelink_queue::invoke::resolve_working_dir;
use hivelink_queue::store::{NewMessage, QueueStore, StoreError};

const DEFAULT_PROMPT: &str = "Heartbeat check-in. Review your working directory for unfinished \
work and report anything that needs attention. Reply HEARTBEAT_OK if all is quiet.";

#[tokio::main]
async fn main() -> Result<()> {
    let base_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let paths = Paths::resolve(&base_dir);
    paths.ensure_dirs()?;

    // Separate log file for the heartbeat producer
    let log_file = paths.hivelink_home.join("logs/heartbeat.log");

    let settings = get_settings(&paths.settings_file).unwrap_or_default();
    let interval_secs = settings
        .monitoring
        .as_ref()
        .and_then(|m| m.heartbeat_interval)
        .unwrap_or(3600);

    let store = QueueStore::open(&paths.db_file)?;
    log(
        "INFO",
        &format!("Heartbeat started (interval: {}s)", interval_secs),
        &log_file,
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        // Sleep first, then check
        tokio::select! {
            _ = tokio::time::sleep(tokio::time::Duration::from_secs(interval_secs)) => {}
            _ = &mut shutdown => {
                log("INFO", "Heartbeat shutting down...", &log_file);
                break;
            }
        }

        // The daemon replies on the heartbeat channel; drain what it answered
        // since the last cycle
        drain_responses(&store, &log_file);

        log("INFO", "Heartbeat check - scanning all agents...", &log_file);

        // Reload settings each cycle
        let settings = match get_settings(&paths.settings_file) {
            Ok(s) => s,
            Err(e) => {
                log(
                    "WARN",
                    &format!("Could not read settings, skipping cycle: {}", e),
                    &log_file,
                );
                continue;
            }
        };
        let agents = get_agents(&settings);
        let workspace_path = get_workspace_path(&settings);

        for (agent_id, agent) in &agents {
            let agent_dir = resolve_working_dir(agent, agent_id, &workspace_path);

            // Agent-specific heartbeat.md overrides the default prompt
            let heartbeat_file = agent_dir.join("heartbeat.md");
            let prompt = match std::fs::read_to_string(&heartbeat_file) {
                Ok(content) if !content.trim().is_empty() => {
                    log(
                        "INFO",
                        &format!("  -> Agent @{}: using custom heartbeat.md", agent_id),
                        &log_file,
                    );
                    content
                }
                _ => DEFAULT_PROMPT.to_string(),
            };

            let result = store.enqueue_message(&NewMessage {
                message_id: format!("heartbeat-{}-{}", agent_id, now_millis()),
                channel: "heartbeat".to_string(),
                sender: "heartbeat".to_string(),
                sender_id: Some("heartbeat".to_string()),
                body: prompt,
                target_agent: Some(agent_id.clone()),
                ..Default::default()
            });

            match result {
                Ok(_) => log(
                    "INFO",
                    &format!("  -> Enqueued heartbeat for @{}", agent_id),
                    &log_file,
                ),
                // A duplicate means the previous cycle's prompt is still queued
                Err(StoreError::DuplicateId(_)) => {}
                Err(e) => log(
                    "ERROR",
                    &format!("  -> Failed to enqueue heartbeat for @{}: {}", agent_id, e),
                    &log_file,
                ),
            }
        }
    }

    Ok(())
}

/// The heartbeat producer is its own adapter: it polls the heartbeat channel,
/// logs each reply, and acks it.
fn drain_responses(store: &QueueStore, log_file: &std::path::Path) {
    let responses = match store.pending_responses("heartbeat") {
        Ok(r) => r,
        Err(e) => {
            log(
                "ERROR",
                &format!("Failed to poll heartbeat responses: {}", e),
                log_file,
            );
            return;
        }
    };

    for response in responses {
        let agent = response.agent.as_deref().unwrap_or("?");
        let preview: String = response.body.chars().take(200).collect();
        log(
            "INFO",
            &format!("Heartbeat reply from @{}: {}", agent, preview),
            log_file,
        );
        if let Err(e) = store.ack_response(response.id) {
            log(
                "ERROR",
                &format!("Failed to ack heartbeat response {}: {}", response.id, e),
                log_file,
            );
        }
    }
}
