//! Daemon - the main gateway service
//!
//! Wires configuration, the store, the backends and the session coordinator
//! together and serves devices until interrupted.

use tokio_util::sync::CancellationToken;

use crate::api::{ApiServer, ApiState};
use crate::backends::Backends;
use crate::db::{self, DbPool};
use crate::pipeline::{PromptBuilder, SessionCoordinator, Store, proactive};
use crate::{Config, Result};

/// The companion daemon
pub struct Daemon {
    config: Config,
    db: DbPool,
}

impl Daemon {
    /// Create a new daemon instance
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened
    pub fn new(config: Config) -> Result<Self> {
        let path = &config.store.database_path;
        let db = db::init(path)?;

        tracing::info!(path = %path.display(), "database initialized");

        Ok(Self { config, db })
    }

    /// Build the session coordinator from configuration
    ///
    /// # Errors
    ///
    /// Returns error if a backend or the rules file is misconfigured
    pub fn coordinator(&self) -> Result<SessionCoordinator> {
        let backends = Backends::from_config(&self.config.backends)?;
        let store = Store::new(&self.db, self.config.store.user_id.clone());

        let mut coordinator =
            SessionCoordinator::new(backends, store, self.config.pipeline.clone())
                .with_segmenter(self.config.segmenter.clone())
                .with_prompt(PromptBuilder::new(self.config.prompt.clone()));

        if self.config.proactive.enabled {
            let rules = proactive::load_rules(self.config.proactive.rules_path.as_deref())?;
            tracing::info!(count = rules.len(), tick = ?self.config.proactive.tick, "proactive rules enabled");
            coordinator = coordinator.with_rules(rules, self.config.proactive.tick);
        }

        Ok(coordinator)
    }

    /// Run the daemon until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if the daemon encounters a fatal error
    pub async fn run(self) -> Result<()> {
        let coordinator = self.coordinator()?;
        let state = ApiState::new(self.db.clone(), coordinator);
        let server = ApiServer::new(state, self.config.bind_addr());

        // Set up shutdown signal
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                signal.cancel();
            }
        });

        tracing::info!(
            addr = %self.config.bind_addr(),
            user = %self.config.store.user_id,
            "daemon running"
        );

        match server.spawn(shutdown).await {
            Ok(result) => result?,
            Err(e) => tracing::error!(error = %e, "API server task failed"),
        }

        tracing::info!("daemon stopped");
        Ok(())
    }
}
