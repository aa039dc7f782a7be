//! Connection admission.
//!
//! Runs once per connection, right after the WebSocket upgrade. The token is
//! checked before the persona so an anonymous caller learns nothing about
//! which personas exist.

use percent_encoding::percent_decode_str;
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tracing::debug;

use crate::error::{Error, Result};
use crate::identity::UserIdentity;
use crate::persona::Persona;
use crate::router::group_key;

use super::{GroupScope, SessionContext, SessionStrategy};

/// What the client asked for at upgrade time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectTarget {
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
}

impl ConnectTarget {
    pub fn from_request(request: &Request) -> Self {
        Self {
            path: request.uri().path().to_string(),
            query: request.uri().query().map(str::to_string),
            authorization: request
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        }
    }

    /// `token` query parameter, falling back to an `Authorization: Bearer` header
    pub fn token(&self) -> Option<String> {
        let from_query = self.query.as_deref().and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "token")
                .map(|(_, value)| value.into_owned())
        });

        from_query.filter(|t| !t.is_empty()).or_else(|| {
            self.authorization
                .as_deref()
                .and_then(|h| h.strip_prefix("Bearer "))
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
        })
    }

    /// Last non-empty path segment after `route_prefix`, percent-decoded
    pub fn persona_name(&self, route_prefix: &str) -> Option<String> {
        let prefix = route_prefix.trim_end_matches('/');
        let rest = self.path.strip_prefix(prefix)?;
        if !rest.is_empty() && !rest.starts_with('/') {
            return None;
        }

        let segment = rest.split('/').filter(|s| !s.is_empty()).last()?;
        let name = percent_decode_str(segment).decode_utf8().ok()?;
        let name = name.trim();
        (!name.is_empty()).then(|| name.to_string())
    }
}

/// A connection that passed every admission check
#[derive(Debug, Clone)]
pub struct Admission {
    pub user: UserIdentity,
    pub persona: Persona,
    pub group: String,
}

/// Authenticate, extract the persona name and bind it per the strategy
pub async fn admit(ctx: &SessionContext, target: &ConnectTarget) -> Result<Admission> {
    let token = target.token();
    let user = ctx.identity.authenticate(token.as_deref()).await?;

    let name = target
        .persona_name(&ctx.route_prefix)
        .ok_or_else(|| Error::bad_request("No persona in connection path"))?;

    let persona = match ctx.settings.strategy {
        SessionStrategy::StrictPersonaValidation => ctx
            .directory
            .lookup_shared(&name)
            .await?
            .ok_or(Error::Forbidden { persona: name })?,
        SessionStrategy::UserScopedAutocreate | SessionStrategy::EchoOnlyStub => {
            ctx.directory.resolve(&user, &name).await?
        }
    };

    let group = match ctx.settings.group_scope {
        GroupScope::PersonaUser => group_key(&persona.name, Some(&user.handle)),
        GroupScope::Persona => group_key(&persona.name, None),
    };

    debug!(user = %user.handle, persona = %persona.name, group = %group, "Connection admitted");

    Ok(Admission {
        user,
        persona,
        group,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Rejection;
    use crate::session::testing::{context, token_for};
    use crate::store::UserStore;

    fn target(path: &str, query: Option<&str>) -> ConnectTarget {
        ConnectTarget {
            path: path.to_string(),
            query: query.map(str::to_string),
            authorization: None,
        }
    }

    #[test]
    fn test_persona_name_extraction() {
        let prefix = "/ws/llm";
        assert_eq!(target("/ws/llm/Socrates", None).persona_name(prefix).as_deref(), Some("Socrates"));
        assert_eq!(target("/ws/llm/Socrates/", None).persona_name(prefix).as_deref(), Some("Socrates"));
        assert_eq!(
            target("/ws/llm/Dr%20Who", None).persona_name(prefix).as_deref(),
            Some("Dr Who")
        );
        assert_eq!(target("/ws/llm/team/Muse", None).persona_name(prefix).as_deref(), Some("Muse"));
        assert_eq!(target("/ws/llm/Muse", None).persona_name("/ws/llm/").as_deref(), Some("Muse"));

        assert_eq!(target("/ws/llm/", None).persona_name(prefix), None);
        assert_eq!(target("/ws/llm", None).persona_name(prefix), None);
        assert_eq!(target("/ws/llmx/Muse", None).persona_name(prefix), None);
        assert_eq!(target("/other/Muse", None).persona_name(prefix), None);
        assert_eq!(target("/ws/llm/%20", None).persona_name(prefix), None);
        assert_eq!(target("/ws/llm/%FF", None).persona_name(prefix), None);
    }

    #[test]
    fn test_token_sources() {
        assert_eq!(target("/", Some("token=abc")).token().as_deref(), Some("abc"));
        assert_eq!(target("/", Some("x=1&token=a%2Bb")).token().as_deref(), Some("a+b"));
        assert_eq!(target("/", Some("token=")).token(), None);
        assert_eq!(target("/", None).token(), None);

        let mut with_header = target("/", None);
        with_header.authorization = Some("Bearer xyz".into());
        assert_eq!(with_header.token().as_deref(), Some("xyz"));

        with_header.query = Some("token=from-query".into());
        assert_eq!(with_header.token().as_deref(), Some("from-query"));

        with_header.query = None;
        with_header.authorization = Some("Basic Zm9vOmJhcg==".into());
        assert_eq!(with_header.token(), None);
    }

    #[tokio::test]
    async fn test_autocreate_admission() {
        let fixture = context(SessionStrategy::UserScopedAutocreate);
        let alice = fixture.store.ensure_user("alice").await.unwrap();
        let token = token_for(&alice);

        let admission = admit(&fixture.ctx, &target("/ws/llm/Muse", Some(&format!("token={}", token))))
            .await
            .unwrap();
        assert_eq!(admission.user, alice);
        assert_eq!(admission.persona.name, "Muse");
        assert_eq!(admission.persona.owner_user_id, alice.id);
        assert_eq!(admission.group, "persona_Muse_alice");
    }

    #[tokio::test]
    async fn test_token_checked_before_persona() {
        let fixture = context(SessionStrategy::UserScopedAutocreate);

        let err = admit(&fixture.ctx, &target("/ws/llm/", None)).await.unwrap_err();
        assert_eq!(err.rejection(), Rejection::Unauthenticated);

        let err = admit(&fixture.ctx, &target("/ws/llm/Muse", Some("token=garbage")))
            .await
            .unwrap_err();
        assert_eq!(err.rejection(), Rejection::Unauthenticated);
    }

    #[tokio::test]
    async fn test_missing_persona_is_bad_request() {
        let fixture = context(SessionStrategy::UserScopedAutocreate);
        let alice = fixture.store.ensure_user("alice").await.unwrap();
        let query = format!("token={}", token_for(&alice));

        let err = admit(&fixture.ctx, &target("/ws/llm/", Some(&query))).await.unwrap_err();
        assert_eq!(err.rejection(), Rejection::BadRequest);
    }

    #[tokio::test]
    async fn test_strict_admission() {
        let fixture = context(SessionStrategy::StrictPersonaValidation);
        let alice = fixture.store.ensure_user("alice").await.unwrap();
        let query = format!("token={}", token_for(&alice));

        let err = admit(&fixture.ctx, &target("/ws/llm/Ghost", Some(&query)))
            .await
            .unwrap_err();
        assert_eq!(err.rejection(), Rejection::Forbidden);
        assert!(!fixture.ctx.directory.validate("Ghost").await.unwrap());

        // A persona owned by someone else is accepted on the strict path
        let admin = fixture.store.ensure_user("admin").await.unwrap();
        fixture.ctx.directory.resolve(&admin, "Oracle").await.unwrap();
        let admission = admit(&fixture.ctx, &target("/ws/llm/Oracle", Some(&query)))
            .await
            .unwrap();
        assert_eq!(admission.persona.owner_user_id, admin.id);
    }
}
