use anyhow::Result;
use colored::Colorize;

use hivelink_core::config::{get_agents, get_settings, get_teams, Paths};

/// List all configured teams
pub fn list_teams(paths: &Paths) -> Result<()> {
    let settings = get_settings(&paths.settings_file)?;
    let teams = get_teams(&settings);

    if teams.is_empty() {
        println!("{}", "No teams configured.".yellow());
        return Ok(());
    }

    println!();
    println!("  {}", "Configured Teams".green().bold());
    println!();

    for (id, team) in &teams {
        println!(
            "  {} {}",
            format!("@{}", id).bright_white().bold(),
            format!("({})", team.name).dimmed()
        );
        println!(
            "    Members: {}  Leader: {}",
            team.agents.join(", ").bright_white(),
            team.leader_agent.green()
        );
    }
    println!();
    Ok(())
}

/// Show team details
pub fn show_team(team_id: &str, paths: &Paths) -> Result<()> {
    let settings = get_settings(&paths.settings_file)?;
    let teams = get_teams(&settings);
    let agents = get_agents(&settings);

    let Some(team) = teams.get(team_id) else {
        println!("{} Team '{}' not found.", "Error:".red(), team_id);
        println!(
            "Available teams: {}",
            teams.keys().cloned().collect::<Vec<_>>().join(", ")
        );
        return Ok(());
    };

    println!();
    println!(
        "  {} {}",
        format!("@{}", team_id).bright_white().bold(),
        format!("({})", team.name).dimmed()
    );
    if let Some(ref description) = team.description {
        println!("  {}", description.dimmed());
    }
    println!("  Members:");
    for member in &team.agents {
        let role = if member == &team.leader_agent {
            " (leader)".green().to_string()
        } else {
            String::new()
        };
        let name = agents
            .get(member)
            .map(|a| a.name.clone())
            .unwrap_or_else(|| "?".to_string());
        println!(
            "    - {} {}{}",
            format!("@{}", member).bright_white(),
            name.dimmed(),
            role
        );
    }
    println!();
    Ok(())
}
