use anyhow::Result;
use colored::Colorize;

use hivelink_core::config::Paths;
use hivelink_core::now_millis;
use hivelink_queue::store::{NewMessage, QueueStore};

use crate::random_suffix;

/// Enqueue a message from the command line. The daemon picks it up on its
/// next claim cycle; the response lands in the `cli` channel.
pub fn send_message(message: &str, agent: Option<&str>, paths: &Paths) -> Result<()> {
    if message.trim().is_empty() {
        println!("{}", "Nothing to send.".yellow());
        return Ok(());
    }

    let store = QueueStore::open(&paths.db_file)?;
    let sender = std::env::var("USER").unwrap_or_else(|_| "cli-user".to_string());
    let message_id = format!("cli-{}-{}", now_millis(), random_suffix(6));

    store.enqueue_message(&NewMessage {
        message_id: message_id.clone(),
        channel: "cli".to_string(),
        sender,
        sender_id: Some("cli".to_string()),
        body: message.to_string(),
        target_agent: agent.map(|a| a.to_string()),
        ..Default::default()
    })?;

    println!("{} {}", "Enqueued".green().bold(), message_id.dimmed());
    println!(
        "  Check for the reply with: {}",
        "hivelink responses".bright_white()
    );
    Ok(())
}

/// Print the queue status snapshot.
pub fn show_status(paths: &Paths) -> Result<()> {
    let store = QueueStore::open(&paths.db_file)?;
    let snapshot = store.snapshot()?;

    println!();
    println!("  {}", "Queue Status".green().bold());
    println!("  Pending:            {}", snapshot.pending.to_string().bright_white());
    println!("  Processing:         {}", snapshot.processing.to_string().bright_white());
    println!("  Completed:          {}", snapshot.completed.to_string().dimmed());
    let dead = if snapshot.dead > 0 {
        snapshot.dead.to_string().red().bold().to_string()
    } else {
        snapshot.dead.to_string()
    };
    println!("  Dead:               {}", dead);
    println!(
        "  Pending responses:  {}",
        snapshot.pending_responses.to_string().bright_white()
    );
    println!();
    Ok(())
}

/// Print the most recent responses, newest first.
pub fn show_responses(limit: i64, paths: &Paths) -> Result<()> {
    let store = QueueStore::open(&paths.db_file)?;
    let responses = store.recent_responses(limit)?;

    if responses.is_empty() {
        println!("{}", "No responses yet.".yellow());
        return Ok(());
    }

    for response in responses {
        let when = chrono::DateTime::from_timestamp_millis(response.created_at)
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "?".to_string());
        let agent = response.agent.as_deref().unwrap_or("-");
        println!(
            "{} [{}] {} {}",
            when.dimmed(),
            response.channel.bright_white(),
            format!("@{}", agent).green(),
            response.message_id.dimmed()
        );
        let preview: String = response.body.chars().take(160).collect();
        println!("  {}", preview);
        println!();
    }
    Ok(())
}
