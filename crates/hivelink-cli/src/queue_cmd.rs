use anyhow::Result;
use colored::Colorize;

use hivelink_core::config::Paths;
use hivelink_queue::store::QueueStore;

/// List dead-letter messages with their last error.
pub fn list_dead(paths: &Paths) -> Result<()> {
    let store = QueueStore::open(&paths.db_file)?;
    let dead = store.dead_messages()?;

    if dead.is_empty() {
        println!("{}", "Dead-letter queue is empty.".green());
        return Ok(());
    }

    println!();
    println!("  {}", "Dead Messages".red().bold());
    for message in dead {
        println!(
            "  {} {} [{}] from {}",
            format!("#{}", message.id).bright_white().bold(),
            message.message_id.dimmed(),
            message.channel,
            message.sender
        );
        let preview: String = message.body.chars().take(100).collect();
        println!("    {}", preview);
        println!(
            "    retries: {}  last error: {}",
            message.retry_count,
            message.last_error.as_deref().unwrap_or("-").red()
        );
    }
    println!();
    println!(
        "  Retry with {} or delete with {}",
        "hivelink dead retry <id>".bright_white(),
        "hivelink dead delete <id>".bright_white()
    );
    Ok(())
}

/// Reset a dead message to pending with a fresh retry budget.
pub fn retry_dead(id: i64, paths: &Paths) -> Result<()> {
    let store = QueueStore::open(&paths.db_file)?;
    if store.retry_dead(id)? {
        println!("{} Message #{} is pending again.", "OK".green().bold(), id);
    } else {
        println!("{} No dead message with id {}.", "Error:".red(), id);
    }
    Ok(())
}

/// Delete a dead message permanently.
pub fn delete_dead(id: i64, paths: &Paths) -> Result<()> {
    let store = QueueStore::open(&paths.db_file)?;
    if store.delete_dead(id)? {
        println!("{} Message #{} deleted.", "OK".green().bold(), id);
    } else {
        println!("{} No dead message with id {}.", "Error:".red(), id);
    }
    Ok(())
}
