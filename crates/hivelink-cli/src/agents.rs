use anyhow::Result;
use colored::Colorize;

use hivelink_core::config::{get_agents, get_settings, get_teams, get_workspace_path, Paths};
use hivelink_core::routing::agent_reset_flag;
use hivelink_queue::invoke::resolve_working_dir;

/// List all configured agents
pub fn list_agents(paths: &Paths) -> Result<()> {
    let settings = get_settings(&paths.settings_file)?;
    let agents = get_agents(&settings);

    println!();
    println!("  {}", "Configured Agents".green().bold());
    println!();

    for (id, agent) in &agents {
        println!(
            "  {} {}",
            format!("@{}", id).bright_white().bold(),
            format!("({})", agent.name).dimmed()
        );
        println!(
            "    Provider: {}  Model: {}",
            agent.provider.bright_white(),
            agent.model.bright_white()
        );
    }
    println!();
    Ok(())
}

/// Show agent details
pub fn show_agent(agent_id: &str, paths: &Paths) -> Result<()> {
    let settings = get_settings(&paths.settings_file)?;
    let agents = get_agents(&settings);

    let Some(agent) = agents.get(agent_id) else {
        println!("{} Agent '{}' not found.", "Error:".red(), agent_id);
        println!(
            "Available agents: {}",
            agents.keys().cloned().collect::<Vec<_>>().join(", ")
        );
        return Ok(());
    };

    let workspace = get_workspace_path(&settings);
    let working_dir = resolve_working_dir(agent, agent_id, &workspace);

    println!();
    println!(
        "  {} {}",
        format!("@{}", agent_id).bright_white().bold(),
        format!("({})", agent.name).dimmed()
    );
    println!("  Provider:  {}", agent.provider.bright_white());
    println!("  Model:     {}", agent.model.bright_white());
    println!("  Directory: {}", working_dir.display().to_string().bright_white());

    let teams = get_teams(&settings);
    let agent_teams: Vec<_> = teams
        .iter()
        .filter(|(_, t)| t.agents.contains(&agent_id.to_string()))
        .collect();

    if !agent_teams.is_empty() {
        println!("  Teams:");
        for (tid, team) in &agent_teams {
            let role = if team.leader_agent == agent_id {
                " (leader)"
            } else {
                ""
            };
            println!(
                "    - {} {}{}",
                tid.bright_white(),
                team.name.dimmed(),
                role.green()
            );
        }
    }

    if agent_reset_flag(agent_id, &workspace).exists() {
        println!("  Status:    {}", "pending reset".yellow());
    }

    println!();
    Ok(())
}

/// Drop a reset flag for each agent; the dispatcher consumes it before the
/// agent's next invocation and starts a fresh session.
pub fn reset_agents(agent_ids: &[String], paths: &Paths) -> Result<()> {
    let settings = get_settings(&paths.settings_file)?;
    let agents = get_agents(&settings);
    let workspace = get_workspace_path(&settings);

    if agent_ids.is_empty() {
        println!("{}", "No agent ids given.".yellow());
        println!(
            "Available agents: {}",
            agents.keys().cloned().collect::<Vec<_>>().join(", ")
        );
        return Ok(());
    }

    for agent_id in agent_ids {
        if !agents.contains_key(agent_id) {
            println!("{} Unknown agent '{}', skipping.", "Warning:".yellow(), agent_id);
            continue;
        }
        let flag = agent_reset_flag(agent_id, &workspace);
        if let Some(dir) = flag.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&flag, "")?;
        println!(
            "{} @{} will start a fresh conversation on its next message.",
            "OK".green().bold(),
            agent_id
        );
    }
    Ok(())
}
