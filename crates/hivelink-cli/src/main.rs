mod agents;
mod api_server;
mod messaging;
mod queue_cmd;
mod teams;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rand::Rng;
use tokio::sync::broadcast;

use hivelink_core::config::Paths;
use hivelink_core::events::{BroadcastSubscriber, EventBus, LogSubscriber};
use hivelink_queue::invoke::CliInvoker;
use hivelink_queue::QueueRuntime;

#[derive(Parser)]
#[command(name = "hivelink", about = "Hivelink - multi-agent AI assistant daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon: dispatcher, maintenance loop, and HTTP API
    Serve {
        /// Port for the HTTP API
        #[arg(long)]
        port: Option<u16>,
    },
    /// Enqueue a message from the command line
    Send {
        /// The message to send
        message: Vec<String>,
        /// Route directly to a specific agent
        #[arg(long)]
        agent: Option<String>,
    },
    /// Show queue status
    Status,
    /// Show recent responses
    Responses {
        #[arg(long, default_value = "10")]
        limit: i64,
    },
    /// Dead-letter queue maintenance
    Dead {
        #[command(subcommand)]
        command: DeadCommands,
    },
    /// Agent management commands
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
    /// Team management commands
    Team {
        #[command(subcommand)]
        command: TeamCommands,
    },
    /// Reset agent conversation(s) before their next message
    Reset {
        /// Agent IDs to reset
        agent_ids: Vec<String>,
    },
}

#[derive(Subcommand)]
enum DeadCommands {
    /// List dead messages
    List,
    /// Reset a dead message to pending
    Retry { id: i64 },
    /// Delete a dead message
    Delete { id: i64 },
}

#[derive(Subcommand)]
enum AgentCommands {
    /// List all configured agents
    List,
    /// Show agent details
    Show { agent_id: String },
}

#[derive(Subcommand)]
enum TeamCommands {
    /// List all configured teams
    List,
    /// Show team details
    Show { team_id: String },
}

/// Short alphanumeric suffix for generated message ids.
pub fn random_suffix(len: usize) -> String {
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

fn resolve_paths() -> Paths {
    let base_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    Paths::resolve(&base_dir)
}

fn serve(paths: Paths, port: Option<u16>) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (events_tx, _) = broadcast::channel::<String>(256);

        let mut bus = EventBus::new(paths.log_file.clone());
        bus.subscribe(Arc::new(LogSubscriber::new(paths.log_file.clone())));
        bus.subscribe(Arc::new(BroadcastSubscriber::new(events_tx.clone())));

        let runtime = QueueRuntime::bootstrap(Arc::new(paths), Arc::new(bus))?;
        let invoker = Arc::new(CliInvoker::new(runtime.paths.log_file.clone()));

        let port = port
            .or_else(|| runtime.settings.server.as_ref().and_then(|s| s.port))
            .unwrap_or(8080);

        tokio::select! {
            result = runtime.run(invoker) => result,
            result = api_server::serve(Arc::clone(&runtime), events_tx, port) => result,
        }
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let paths = resolve_paths();

    match cli.command {
        Some(Commands::Serve { port }) => serve(paths, port),
        Some(Commands::Send { message, agent }) => {
            let msg = message.join(" ");
            messaging::send_message(&msg, agent.as_deref(), &paths)
        }
        Some(Commands::Status) => messaging::show_status(&paths),
        Some(Commands::Responses { limit }) => messaging::show_responses(limit, &paths),
        Some(Commands::Dead { command }) => match command {
            DeadCommands::List => queue_cmd::list_dead(&paths),
            DeadCommands::Retry { id } => queue_cmd::retry_dead(id, &paths),
            DeadCommands::Delete { id } => queue_cmd::delete_dead(id, &paths),
        },
        Some(Commands::Agent { command }) => match command {
            AgentCommands::List => agents::list_agents(&paths),
            AgentCommands::Show { agent_id } => agents::show_agent(&agent_id, &paths),
        },
        Some(Commands::Team { command }) => match command {
            TeamCommands::List => teams::list_teams(&paths),
            TeamCommands::Show { team_id } => teams::show_team(&team_id, &paths),
        },
        Some(Commands::Reset { agent_ids }) => agents::reset_agents(&agent_ids, &paths),
        None => messaging::show_status(&paths),
    }
}
