pub mod conversation;
pub mod dispatcher;
pub mod invoke;
pub mod maintenance;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use hivelink_core::config::{
    get_agents, get_settings, get_tunables, validate_settings, Paths,
};
use hivelink_core::events::EventBus;
use hivelink_core::hooks::HookPipeline;
use hivelink_core::logging::log;
use hivelink_core::types::{QueueTunables, Settings};

use crate::conversation::Conversations;
use crate::dispatcher::Dispatcher;
use crate::invoke::AgentInvoker;
use crate::store::QueueStore;

/// Everything a running daemon (and its HTTP server) shares: the store, the
/// conversation registry, the hook pipeline, and the loaded configuration.
pub struct QueueRuntime {
    pub settings: Settings,
    pub paths: Arc<Paths>,
    pub store: Arc<QueueStore>,
    pub bus: Arc<EventBus>,
    pub hooks: Arc<HookPipeline>,
    pub conversations: Arc<Conversations>,
    pub tunables: QueueTunables,
}

impl QueueRuntime {
    /// Bring up the shared state in dependency order: open the store,
    /// recover stale claims, then load the hook pipeline. Configuration
    /// errors abort here, before anything is claimed.
    pub fn bootstrap(paths: Arc<Paths>, bus: Arc<EventBus>) -> Result<Arc<Self>> {
        paths.ensure_dirs()?;
        let settings = get_settings(&paths.settings_file)?;
        validate_settings(&settings).context("Invalid agent/team configuration")?;
        let tunables = get_tunables(&settings);

        let store = Arc::new(QueueStore::open(&paths.db_file)?);
        let recovered = store.recover_stale(Duration::from_secs(tunables.stale_claim_minutes * 60))?;
        if recovered > 0 {
            log(
                "INFO",
                &format!("Recovered {} stale claim(s) at startup", recovered),
                &paths.log_file,
            );
        }

        let hooks = Arc::new(
            HookPipeline::from_config(&settings.hooks.clone().unwrap_or_default())
                .context("Invalid hook configuration")?,
        );

        Ok(Arc::new(Self {
            settings,
            store,
            bus,
            hooks,
            conversations: Arc::new(Conversations::new()),
            tunables,
            paths,
        }))
    }

    /// Run the dispatcher and the maintenance loop until ctrl-c.
    pub async fn run(self: &Arc<Self>, invoker: Arc<dyn AgentInvoker>) -> Result<()> {
        log("INFO", "Queue processor started", &self.paths.log_file);
        log(
            "INFO",
            &format!("Store: {}", self.paths.db_file.display()),
            &self.paths.log_file,
        );

        let dispatcher = Arc::new(Dispatcher::new(
            &self.settings,
            Arc::clone(&self.paths),
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            Arc::clone(&self.hooks),
            Arc::clone(&self.conversations),
            invoker,
        ));

        let maintenance = maintenance::run_maintenance(
            Arc::clone(&self.store),
            Arc::clone(&self.conversations),
            Arc::clone(&self.bus),
            Arc::clone(&self.hooks),
            Arc::clone(&self.paths),
            get_agents(&self.settings),
            self.tunables,
        );

        tokio::select! {
            result = dispatcher.run() => result,
            _ = maintenance => Ok(()),
        }
    }
}
