//! Persona directory: resolves persona names to stored persona records.
//!
//! Personas are scoped per owning user and created on first use. A
//! user-agnostic existence check by name backs the strict admission path
//! and agent-to-agent requests. Personas published by an external seed
//! source are synchronized into the same store.

pub mod directory;
pub mod seed;
pub mod types;

pub use directory::{PersonaDirectory, MAX_PERSONA_NAME_LEN};
pub use seed::{HttpPersonaSeed, PersonaSeed, SeedSync, SyncReport};
pub use types::{Persona, SeedPersona};
