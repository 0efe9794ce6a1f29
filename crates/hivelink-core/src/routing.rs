use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{
    AgentConfig, Resolution, TeamConfig, TeamContext, TeammateMention,
};

static PREFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^@(\S+)\s+([\s\S]*)$").unwrap());
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[@(\S+?):\s*([\s\S]*?)\]").unwrap());
// Bare @agent handoffs at the start of a line, followed by a colon or dash.
// Tolerates markdown bold/italics around the mention.
static NATURAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[*_]{0,2}@([\w-]+)[*_]{0,2}\s*[:\u{2014}\u{2013}\-]+[*_]{0,2}\s*").unwrap()
});

/// Find the first team that contains the given agent.
pub fn find_team_for_agent(
    agent_id: &str,
    teams: &HashMap<String, TeamConfig>,
) -> Option<TeamContext> {
    for (team_id, team) in teams {
        if team.agents.iter().any(|a| a == agent_id) {
            return Some(TeamContext {
                team_id: team_id.clone(),
                team: team.clone(),
            });
        }
    }
    None
}

/// Check if a mentioned ID is a valid teammate of the current agent in the given team.
pub fn is_teammate(
    mentioned_id: &str,
    current_agent_id: &str,
    team: &TeamConfig,
    agents: &HashMap<String, AgentConfig>,
) -> bool {
    mentioned_id != current_agent_id
        && team.agents.iter().any(|a| a == mentioned_id)
        && agents.contains_key(mentioned_id)
}

/// Collect the distinct known targets (agent or team ids) mentioned anywhere
/// in the text, in first-seen order. Unknown @slugs are plain text.
fn mentioned_targets(
    text: &str,
    agents: &HashMap<String, AgentConfig>,
    teams: &HashMap<String, TeamConfig>,
) -> Vec<String> {
    let mut targets = Vec::new();
    for token in text.split_whitespace() {
        if let Some(slug) = token.strip_prefix('@') {
            let slug = slug
                .trim_end_matches(|c: char| c == ',' || c == ';' || c == '.' || c == '!' || c == '?')
                .to_lowercase();
            if slug.is_empty() {
                continue;
            }
            if (agents.contains_key(&slug) || teams.contains_key(&slug))
                && !targets.contains(&slug)
            {
                targets.push(slug);
            }
        }
    }
    targets
}

/// Parse an @agent_id or @team_id prefix from a message.
///
/// Two or more resolvable @mentions anywhere in the text short-circuit to
/// `MultiTarget` — the caller replies with the explanation and invokes
/// nothing. Otherwise a leading `@slug` resolves (agent id, then team id,
/// then agent display name) and everything else falls through to `default`.
pub fn parse_routing(
    raw_message: &str,
    agents: &HashMap<String, AgentConfig>,
    teams: &HashMap<String, TeamConfig>,
) -> Resolution {
    let targets = mentioned_targets(raw_message, agents, teams);
    if targets.len() > 1 {
        let listing = targets
            .iter()
            .map(|t| format!("@{}", t))
            .collect::<Vec<_>>()
            .join(", ");
        return Resolution::MultiTarget {
            explanation: format!(
                "You mentioned multiple targets ({}). Please send a separate message to each one.",
                listing
            ),
            targets,
        };
    }

    if let Some(caps) = PREFIX_RE.captures(raw_message) {
        let candidate_id = caps[1].to_lowercase();
        let message = caps[2].to_string();

        // Agent ID wins over team ID, IDs win over display names
        if agents.contains_key(&candidate_id) {
            return Resolution::DirectAgent {
                agent_id: candidate_id,
                message,
            };
        }

        if let Some(team) = teams.get(&candidate_id) {
            return Resolution::TeamLeader {
                agent_id: team.leader_agent.clone(),
                message,
                team: TeamContext {
                    team_id: candidate_id,
                    team: team.clone(),
                },
            };
        }

        for (id, config) in agents {
            if config.name.to_lowercase() == candidate_id {
                return Resolution::DirectAgent {
                    agent_id: id.clone(),
                    message,
                };
            }
        }
    }

    Resolution::DirectAgent {
        agent_id: "default".to_string(),
        message: raw_message.to_string(),
    }
}

/// Extract bracketed teammate mentions from a response text.
/// Parses tags like `[@agent_id: message]` or `[@agent1,agent2: message]`.
/// The shared context (response minus all tags) is prepended to each message.
pub fn extract_teammate_mentions(
    response: &str,
    current_agent_id: &str,
    team: &TeamConfig,
    agents: &HashMap<String, AgentConfig>,
) -> Vec<TeammateMention> {
    let mut results = Vec::new();
    let mut seen = HashSet::new();

    for caps in TAG_RE.captures_iter(response) {
        let shared_context = TAG_RE.replace_all(response, "").trim().to_string();
        let direct_message = caps[2].trim().to_string();
        let full_message = if !shared_context.is_empty() {
            format!(
                "{}\n\n------\n\nDirected to you:\n{}",
                shared_context, direct_message
            )
        } else {
            direct_message
        };

        // Support comma-separated agent IDs: [@coder,reviewer: message]
        let candidate_ids: Vec<String> = caps[1]
            .to_lowercase()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        for candidate_id in candidate_ids {
            if !seen.contains(&candidate_id)
                && is_teammate(&candidate_id, current_agent_id, team, agents)
            {
                results.push(TeammateMention {
                    teammate_id: candidate_id.clone(),
                    message: full_message.clone(),
                });
                seen.insert(candidate_id);
            }
        }
    }

    results
}

/// Extract bare `@agent:` handoffs written at the start of a line, without
/// the bracket syntax. Fallback for assistants that address teammates in
/// natural language. Skips agents already captured by the bracket form.
pub fn extract_natural_handoffs(
    response: &str,
    current_agent_id: &str,
    team: &TeamConfig,
    agents: &HashMap<String, AgentConfig>,
    already_mentioned: &HashSet<String>,
) -> Vec<TeammateMention> {
    let mut results = Vec::new();
    let mut seen: HashSet<String> = already_mentioned.clone();

    let matches: Vec<_> = NATURAL_RE.find_iter(response).collect();
    let captures: Vec<_> = NATURAL_RE.captures_iter(response).collect();

    if matches.is_empty() {
        return results;
    }

    // Group text segments by agent ID
    let mut agent_texts: Vec<(String, String)> = Vec::new();

    for (i, caps) in captures.iter().enumerate() {
        let agent_id = caps[1]
            .trim_end_matches(|c: char| c == ',' || c == ';' || c == '.')
            .to_lowercase();

        if !is_teammate(&agent_id, current_agent_id, team, agents) {
            continue;
        }

        // Text from the end of this match to the start of the next (or EOF)
        let start = matches[i].end();
        let end = if i + 1 < matches.len() {
            matches[i + 1].start()
        } else {
            response.len()
        };

        let text = response[start..end].trim().to_string();
        if text.is_empty() {
            continue;
        }
        if let Some((_, existing)) = agent_texts.iter_mut().find(|(id, _)| id == &agent_id) {
            existing.push_str("\n\n");
            existing.push_str(&text);
        } else {
            agent_texts.push((agent_id, text));
        }
    }

    for (agent_id, message) in agent_texts {
        if seen.contains(&agent_id) {
            continue;
        }
        seen.insert(agent_id.clone());
        results.push(TeammateMention {
            teammate_id: agent_id,
            message,
        });
    }

    results
}

/// All teammate mentions in a response: bracket tags first, then natural
/// handoffs, deduplicated by slug in first-seen order.
pub fn extract_mentions(
    response: &str,
    current_agent_id: &str,
    team: &TeamConfig,
    agents: &HashMap<String, AgentConfig>,
) -> Vec<TeammateMention> {
    let bracket = extract_teammate_mentions(response, current_agent_id, team, agents);
    let already: HashSet<String> = bracket.iter().map(|m| m.teammate_id.clone()).collect();
    let natural = extract_natural_handoffs(response, current_agent_id, team, agents, &already);
    bracket.into_iter().chain(natural).collect()
}

/// Get the reset flag path for a specific agent.
pub fn agent_reset_flag(agent_id: &str, workspace_path: &Path) -> PathBuf {
    workspace_path.join(agent_id).join("reset_flag")
}
