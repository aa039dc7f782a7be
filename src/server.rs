//! WebSocket server
//!
//! Wires the collaborators together from configuration, accepts TCP
//! connections and hands each one to its own session task.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::completion::{HttpCompletionBackend, SharedCompletion};
use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::identity::JwtIdentityGate;
use crate::orchestrator::TurnOrchestrator;
use crate::persona::{HttpPersonaSeed, PersonaDirectory, SeedSync};
use crate::router::GroupRouter;
use crate::session::{serve_connection, SessionContext};
use crate::store::SqliteStore;

/// Bound on the seed source request
const SEED_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

// ─────────────────────────────────────────────────────────────────
// Wiring
// ─────────────────────────────────────────────────────────────────

/// Session context backed by the given store and completion backend
pub fn build_context(
    config: &RelayConfig,
    store: Arc<SqliteStore>,
    completion: SharedCompletion,
) -> Result<Arc<SessionContext>> {
    let secret = config.require_jwt_secret()?;

    Ok(Arc::new(SessionContext {
        identity: Arc::new(JwtIdentityGate::new(
            secret,
            config.auth.leeway_secs,
            store.clone(),
        )),
        directory: Arc::new(PersonaDirectory::new(store.clone())),
        router: Arc::new(GroupRouter::new()),
        log: store,
        orchestrator: Arc::new(TurnOrchestrator::new(
            completion,
            config.completion.max_iterations,
        )),
        settings: config.session.clone(),
        route_prefix: config.server.route_prefix.clone(),
        outbound_queue: config.server.outbound_queue,
    }))
}

/// Seed synchronizer, when a seed URL is configured
pub fn build_seed_sync(
    config: &RelayConfig,
    ctx: &SessionContext,
    store: Arc<SqliteStore>,
) -> Result<Option<Arc<SeedSync>>> {
    let Some(ref url) = config.persona_seed.url else {
        return Ok(None);
    };

    let source = HttpPersonaSeed::new(url.clone(), SEED_FETCH_TIMEOUT)?;
    Ok(Some(Arc::new(SeedSync::new(
        Arc::new(source),
        ctx.directory.clone(),
        store,
        config.persona_seed.owner_handle.clone(),
        config.persona_seed.refresh_interval_secs,
    ))))
}

// ─────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────

pub struct RelayServer {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    seed: Option<Arc<SeedSync>>,
}

impl RelayServer {
    /// Build everything from configuration and bind the listener
    pub async fn from_config(config: &RelayConfig) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(&config.database_path())?);
        let completion: SharedCompletion = Arc::new(HttpCompletionBackend::new(&config.completion)?);
        let ctx = build_context(config, store.clone(), completion)?;
        let seed = build_seed_sync(config, &ctx, store)?;

        let server = Self::bind(config.bind_addr()?, ctx).await?;
        Ok(match seed {
            Some(seed) => server.with_seed(seed),
            None => server,
        })
    }

    pub async fn bind(addr: SocketAddr, ctx: Arc<SessionContext>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Config(format!("Failed to bind {}: {}", addr, e)))?;

        Ok(Self {
            listener,
            ctx,
            seed: None,
        })
    }

    pub fn with_seed(mut self, seed: Arc<SeedSync>) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn context(&self) -> Arc<SessionContext> {
        self.ctx.clone()
    }

    /// Accept connections until `shutdown` resolves
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let refresh = match self.seed {
            Some(ref seed) => start_seed_sync(seed).await,
            None => None,
        };

        info!(
            addr = %self.local_addr()?,
            route_prefix = %self.ctx.route_prefix,
            strategy = %self.ctx.settings.strategy,
            "Relay listening"
        );

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };

                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, peer, ctx).await {
                            debug!(peer = %peer, error = %e.format_for_log(), "Connection ended with error");
                        }
                    });
                }
            }
        }

        if let Some(handle) = refresh {
            handle.abort();
        }

        info!(
            groups = self.ctx.router.group_count(),
            "Relay stopped"
        );
        Ok(())
    }
}

/// Run the startup sync, then hand off to the refresh task if one is configured.
///
/// A failed startup sync never stops the relay. Without a refresh interval
/// nothing retries it, so that case is logged as an error.
async fn start_seed_sync(seed: &Arc<SeedSync>) -> Option<JoinHandle<()>> {
    match seed.sync().await {
        Ok(_) => debug!(personas = ?seed.synced_names(), "Seed personas available"),
        Err(e) => match seed.refresh_interval() {
            Some(interval) => warn!(
                error = %e.format_for_log(),
                retry_secs = interval.as_secs(),
                "Initial persona seed sync failed; retried on the refresh interval"
            ),
            None => error!(
                error = %e.format_for_log(),
                "Initial persona seed sync failed; no refresh interval configured, not retried"
            ),
        },
    }
    seed.clone().spawn_refresh()
}
