//! Bearer token authentication and repository access rules.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::config::settings::AuthSettings;
use crate::registry::{RegistryError, RegistryResult, Repository};

/// Subject that maps to the anonymous identity.
pub const ANONYMOUS_SUBJECT: &str = "anonymous";

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub iat: usize,
    /// Space separated `repository:<name>:<actions>` grants
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default)]
    pub admin: bool,
}

/// Who is making a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Anonymous,
    User {
        subject: String,
        is_admin: bool,
        scope: Option<String>,
    },
}

impl Identity {
    /// Name recorded as the creator of pushed data.
    pub fn name(&self) -> &str {
        match self {
            Identity::Anonymous => ANONYMOUS_SUBJECT,
            Identity::User { subject, .. } => subject,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Pull,
    Push,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Pull => "pull",
            Action::Push => "push",
        }
    }
}

pub trait TokenVerifier: Send + Sync + 'static {
    /// Turn a bearer token into an identity. Invalid tokens are
    /// [`RegistryError::Unauthorized`].
    fn verify(&self, token: &str) -> RegistryResult<Identity>;
}

/// HS256 tokens signed with the shared `JWT_SECRET`.
pub struct JwtTokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtTokenVerifier {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::default(),
        }
    }

    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self::new(settings.jwt_secret.expose_secret().as_bytes())
    }
}

impl TokenVerifier for JwtTokenVerifier {
    fn verify(&self, token: &str) -> RegistryResult<Identity> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|err| {
            tracing::debug!(error = %err, "Token verification failed");
            RegistryError::Unauthorized
        })?;

        let claims = data.claims;
        if claims.sub.is_empty() || claims.sub == ANONYMOUS_SUBJECT {
            return Ok(Identity::Anonymous);
        }
        Ok(Identity::User {
            subject: claims.sub,
            is_admin: claims.admin,
            scope: claims.scope,
        })
    }
}

/// Mint a token the verifier accepts.
pub fn issue_token(
    secret: &[u8],
    subject: &str,
    scope: Option<&str>,
    admin: bool,
    ttl: Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let claims = Claims {
        sub: subject.to_string(),
        exp: (now + ttl).timestamp() as usize,
        iat: now.timestamp() as usize,
        scope: scope.map(str::to_string),
        admin,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
}

/// Identity for an optional bearer token. No token means anonymous.
pub fn authenticate(verifier: &dyn TokenVerifier, bearer: Option<&str>) -> RegistryResult<Identity> {
    match bearer {
        Some(token) => verifier.verify(token),
        None => Ok(Identity::Anonymous),
    }
}

/// Check that `identity` may perform `action` on `repo`.
pub fn authorize(identity: &Identity, repo: &Repository, action: Action, allow_anonymous_pull: bool) -> RegistryResult<()> {
    match (identity, action) {
        (Identity::Anonymous, Action::Pull) if allow_anonymous_pull => Ok(()),
        (Identity::Anonymous, _) => Err(RegistryError::Unauthorized),
        (Identity::User { subject, is_admin, scope }, action) => {
            if action == Action::Push && !is_admin && !subject.eq_ignore_ascii_case(&repo.owner) {
                return Err(RegistryError::Denied);
            }
            match scope {
                Some(scope) if !scope_allows(scope, &repo.full_name(), action.as_str()) => Err(RegistryError::Denied),
                _ => Ok(()),
            }
        }
    }
}

/// Catalog listing spans every repository, so it only needs a caller that
/// may pull at all.
pub fn authorize_catalog(identity: &Identity, allow_anonymous_pull: bool) -> RegistryResult<()> {
    match identity {
        Identity::Anonymous if !allow_anonymous_pull => Err(RegistryError::Unauthorized),
        _ => Ok(()),
    }
}

fn scope_allows(scope: &str, repository: &str, action: &str) -> bool {
    scope.split_whitespace().any(|entry| {
        let mut parts = entry.splitn(3, ':');
        let scope_type = parts.next().unwrap_or_default();
        let scope_repo = parts.next().unwrap_or_default();
        let scope_actions = parts.next().unwrap_or_default();

        if scope_type != "repository" {
            return false;
        }
        if !scope_repo.eq_ignore_ascii_case(repository) && scope_repo != "*" {
            return false;
        }
        scope_actions
            .split(',')
            .any(|allowed| allowed == action || allowed == "*")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ImageName;

    const SECRET: &[u8] = b"test-secret";

    fn repo(owner: &str, image: &str) -> Repository {
        Repository::new(owner, image.parse::<ImageName>().unwrap())
    }

    fn user(subject: &str, is_admin: bool, scope: Option<&str>) -> Identity {
        Identity::User {
            subject: subject.to_string(),
            is_admin,
            scope: scope.map(str::to_string),
        }
    }

    #[test]
    fn test_issue_and_verify() {
        let verifier = JwtTokenVerifier::new(SECRET);
        let token = issue_token(SECRET, "alice", Some("repository:alice/app:pull"), false, Duration::hours(1)).unwrap();
        assert_eq!(
            verifier.verify(&token).unwrap(),
            user("alice", false, Some("repository:alice/app:pull"))
        );

        let anonymous = issue_token(SECRET, ANONYMOUS_SUBJECT, None, false, Duration::hours(1)).unwrap();
        assert_eq!(verifier.verify(&anonymous).unwrap(), Identity::Anonymous);
    }

    #[test]
    fn test_rejects_bad_tokens() {
        let verifier = JwtTokenVerifier::new(SECRET);
        let foreign = issue_token(b"other-secret", "alice", None, false, Duration::hours(1)).unwrap();
        assert!(matches!(verifier.verify(&foreign), Err(RegistryError::Unauthorized)));

        let expired = issue_token(SECRET, "alice", None, false, Duration::hours(-2)).unwrap();
        assert!(matches!(verifier.verify(&expired), Err(RegistryError::Unauthorized)));

        assert!(matches!(verifier.verify("garbage"), Err(RegistryError::Unauthorized)));
        assert_eq!(authenticate(&verifier, None).unwrap(), Identity::Anonymous);
    }

    #[test]
    fn test_anonymous_access() {
        let target = repo("alice", "app");
        assert!(authorize(&Identity::Anonymous, &target, Action::Pull, true).is_ok());
        assert!(matches!(
            authorize(&Identity::Anonymous, &target, Action::Pull, false),
            Err(RegistryError::Unauthorized)
        ));
        assert!(matches!(
            authorize(&Identity::Anonymous, &target, Action::Push, true),
            Err(RegistryError::Unauthorized)
        ));
        assert!(authorize_catalog(&Identity::Anonymous, false).is_err());
    }

    #[test]
    fn test_push_requires_owner_or_admin() {
        let target = repo("alice", "tools/app");
        assert!(authorize(&user("Alice", false, None), &target, Action::Push, true).is_ok());
        assert!(authorize(&user("root", true, None), &target, Action::Push, true).is_ok());
        assert!(matches!(
            authorize(&user("bob", false, None), &target, Action::Push, true),
            Err(RegistryError::Denied)
        ));
        assert!(authorize(&user("bob", false, None), &target, Action::Pull, false).is_ok());
    }

    #[test]
    fn test_scope_limits_actions() {
        let target = repo("alice", "app");
        let pull_only = user("alice", false, Some("repository:alice/app:pull"));
        assert!(authorize(&pull_only, &target, Action::Pull, false).is_ok());
        assert!(matches!(
            authorize(&pull_only, &target, Action::Push, false),
            Err(RegistryError::Denied)
        ));

        let wildcard = user("alice", false, Some("repository:*:*"));
        assert!(authorize(&wildcard, &target, Action::Push, false).is_ok());

        let other_repo = user("alice", false, Some("repository:alice/other:pull,push"));
        assert!(authorize(&other_repo, &target, Action::Pull, false).is_err());
    }
}
