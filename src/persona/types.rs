//! Core persona types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named agent identity owned by one user.
///
/// `(owner_user_id, name)` is unique. The trait blob is opaque to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub id: i64,
    pub owner_user_id: i64,
    pub name: String,
    pub traits: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One entry published by the persona seed source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedPersona {
    pub name: String,

    #[serde(default = "empty_traits", alias = "traits")]
    pub personality_traits: serde_json::Value,
}

fn empty_traits() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seed_persona_traits_default_to_empty_object() {
        let seed: SeedPersona = serde_json::from_value(json!({"name": "Critic"})).unwrap();
        assert_eq!(seed.personality_traits, json!({}));

        let seed: SeedPersona =
            serde_json::from_value(json!({"name": "Critic", "traits": {"tone": "dry"}})).unwrap();
        assert_eq!(seed.personality_traits, json!({"tone": "dry"}));
    }
}
