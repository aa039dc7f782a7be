//! Persona seed synchronization.
//!
//! Shared personas published by an external service are copied into the
//! local store under a dedicated owner. The sync runs at startup and then
//! on a fixed refresh interval; connections never trigger it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::SharedUserStore;
use crate::version;

use super::directory::PersonaDirectory;
use super::types::SeedPersona;

/// Source of shared personas
#[async_trait]
pub trait PersonaSeed: Send + Sync {
    /// Where the personas come from, for log lines
    fn source(&self) -> &str;

    async fn fetch(&self) -> Result<Vec<SeedPersona>>;
}

// ─────────────────────────────────────────────────────────────────
// HTTP seed source
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SeedResponse {
    personas: Vec<SeedPersona>,
}

/// Seed source answering `GET url` with `{"personas": [...]}`
pub struct HttpPersonaSeed {
    client: Client,
    url: String,
}

impl HttpPersonaSeed {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(version::build_info().user_agent())
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl PersonaSeed for HttpPersonaSeed {
    fn source(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Result<Vec<SeedPersona>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: SeedResponse = response
            .json()
            .await
            .map_err(|e| Error::upstream_malformed(format!("persona seed: {}", e)))?;

        Ok(parsed.personas)
    }
}

// ─────────────────────────────────────────────────────────────────
// Synchronizer
// ─────────────────────────────────────────────────────────────────

/// Outcome of one synchronization pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub total: usize,
    pub created: usize,
}

struct SyncState {
    names: BTreeSet<String>,
    synced_at: Instant,
}

/// Copies seed personas into the directory and caches what was synced
pub struct SeedSync {
    seed: Arc<dyn PersonaSeed>,
    directory: Arc<PersonaDirectory>,
    users: SharedUserStore,
    owner_handle: String,
    /// `None` = sync once at startup only
    refresh_interval: Option<Duration>,
    state: RwLock<Option<SyncState>>,
}

impl SeedSync {
    pub fn new(
        seed: Arc<dyn PersonaSeed>,
        directory: Arc<PersonaDirectory>,
        users: SharedUserStore,
        owner_handle: impl Into<String>,
        refresh_interval_secs: u64,
    ) -> Self {
        Self {
            seed,
            directory,
            users,
            owner_handle: owner_handle.into(),
            refresh_interval: (refresh_interval_secs > 0)
                .then(|| Duration::from_secs(refresh_interval_secs)),
            state: RwLock::new(None),
        }
    }

    /// Fetch the seed list and upsert every entry
    pub async fn sync(&self) -> Result<SyncReport> {
        let seeds = self.seed.fetch().await?;
        let owner = self.users.ensure_user(&self.owner_handle).await?;

        let mut names = BTreeSet::new();
        let mut created = 0;
        for seed in &seeds {
            match self.directory.publish(&owner, seed).await {
                Ok((persona, was_created)) => {
                    if was_created {
                        created += 1;
                        debug!(persona = %persona.name, "Seed persona added");
                    }
                    names.insert(persona.name);
                }
                // One bad entry does not stop the rest
                Err(Error::BadRequest(reason)) => {
                    warn!(name = %seed.name, reason = %reason, "Skipping seed persona");
                }
                Err(e) => return Err(e),
            }
        }

        let report = SyncReport {
            total: names.len(),
            created,
        };

        *self.state.write() = Some(SyncState {
            names,
            synced_at: Instant::now(),
        });

        info!(
            source = %self.seed.source(),
            owner = %self.owner_handle,
            total = report.total,
            created = report.created,
            "Persona seed synchronized"
        );

        Ok(report)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval
    }

    /// Whether the cached set is missing or older than the refresh interval
    pub fn needs_refresh(&self) -> bool {
        match (&*self.state.read(), self.refresh_interval) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(state), Some(interval)) => state.synced_at.elapsed() >= interval,
        }
    }

    /// Names from the last successful pass
    pub fn synced_names(&self) -> Vec<String> {
        self.state
            .read()
            .as_ref()
            .map(|s| s.names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Spawn the periodic refresh task, if a refresh interval is configured
    pub fn spawn_refresh(self: Arc<Self>) -> Option<JoinHandle<()>> {
        let interval = self.refresh_interval?;

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately and startup already synced
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !self.needs_refresh() {
                    continue;
                }
                if let Err(e) = self.sync().await {
                    warn!(error = %e.format_for_log(), "Persona seed refresh failed");
                }
            }
        }))
    }
}
