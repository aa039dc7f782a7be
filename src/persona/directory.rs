//! Persona lookups.
//!
//! Two policies live side by side and every caller picks one explicitly:
//! [`PersonaDirectory::resolve`] is user-scoped get-or-create, while
//! [`PersonaDirectory::validate`] and [`PersonaDirectory::lookup_shared`]
//! check the name across all owners without creating anything.

use serde_json::json;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::identity::UserIdentity;
use crate::store::SharedPersonaStore;

use super::types::{Persona, SeedPersona};

/// Longest persona name accepted
pub const MAX_PERSONA_NAME_LEN: usize = 100;

pub struct PersonaDirectory {
    store: SharedPersonaStore,
}

impl PersonaDirectory {
    pub fn new(store: SharedPersonaStore) -> Self {
        Self { store }
    }

    /// User-scoped get-or-create. A missing persona is created with an
    /// empty trait blob; only storage faults and unusable names fail.
    pub async fn resolve(&self, user: &UserIdentity, name: &str) -> Result<Persona> {
        let name = check_name(name)?;
        let (persona, created) = self
            .store
            .get_or_create_persona(user.id, name, &json!({}))
            .await?;

        if created {
            info!(
                persona = %persona.name,
                persona_id = persona.id,
                user = %user.handle,
                "Created new persona"
            );
        } else {
            debug!(persona = %persona.name, user = %user.handle, "Retrieved existing persona");
        }

        Ok(persona)
    }

    /// Read-only existence check by name alone, across all owners
    pub async fn validate(&self, name: &str) -> Result<bool> {
        Ok(self.lookup_shared(name).await?.is_some())
    }

    /// The persona behind a successful [`validate`](Self::validate)
    pub async fn lookup_shared(&self, name: &str) -> Result<Option<Persona>> {
        match check_name(name) {
            Ok(name) => self.store.find_persona_by_name(name).await,
            Err(_) => Ok(None),
        }
    }

    /// Personas owned by a user, ordered by name
    pub async fn list_for(&self, user: &UserIdentity) -> Result<Vec<Persona>> {
        self.store.list_personas(user.id).await
    }

    /// Insert or refresh a persona published by the seed source
    pub async fn publish(&self, owner: &UserIdentity, seed: &SeedPersona) -> Result<(Persona, bool)> {
        let name = check_name(&seed.name)?;
        self.store
            .upsert_persona(owner.id, name, &seed.personality_traits)
            .await
    }
}

fn check_name(name: &str) -> Result<&str> {
    if name.trim().is_empty() {
        return Err(Error::bad_request("Persona name is required"));
    }
    if name.chars().count() > MAX_PERSONA_NAME_LEN {
        return Err(Error::bad_request(format!(
            "Persona name exceeds {} characters",
            MAX_PERSONA_NAME_LEN
        )));
    }
    Ok(name)
}
