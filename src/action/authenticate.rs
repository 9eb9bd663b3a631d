use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::Action;
use crate::error::{ConfigErrorKind, LbError, Result};
use crate::types::Request;

/// Default session lifetime (7 days)
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(604_800);
pub const DEFAULT_SESSION_COOKIE: &str = "lb-auth-session";

/// Authenticated user as reported by the identity provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub claims: Vec<(String, String)>,
}

impl Identity {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            claims: Vec::new(),
        }
    }

    pub fn with_claim(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.push((name.into(), value.into()));
        self
    }

    pub fn claim(&self, name: &str) -> Option<&str> {
        self.claims
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Verdict of an identity provider for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Allow(Identity),
    Deny,
    /// Not authenticated yet; send the client to this authorization URL
    RedirectToIdp(String),
}

/// Pluggable identity collaborator (OIDC, Cognito, ...)
pub trait IdentityProvider: Send + Sync {
    fn authenticate(&self, request: &Request, config: &AuthenticateConfig) -> AuthResult;
}

/// Identity provider endpoints
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderConfig {
    Oidc {
        issuer: String,
        client_id: String,
        authorization_endpoint: String,
    },
    Cognito {
        user_pool: String,
        client_id: String,
        /// Hosted UI domain, e.g. "auth.example.com"
        domain: String,
    },
}

impl ProviderConfig {
    fn client_id(&self) -> &str {
        match self {
            ProviderConfig::Oidc { client_id, .. } | ProviderConfig::Cognito { client_id, .. } => {
                client_id
            }
        }
    }

    fn authorization_endpoint(&self) -> String {
        match self {
            ProviderConfig::Oidc {
                authorization_endpoint,
                ..
            } => authorization_endpoint.clone(),
            ProviderConfig::Cognito { domain, .. } => format!("https://{}/oauth2/authorize", domain),
        }
    }
}

/// What to do with requests that carry no authenticated session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnauthenticatedAction {
    /// Respond 401
    Deny,
    /// Continue without an identity
    Allow,
    /// Redirect to the identity provider
    #[default]
    Authenticate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateConfig {
    pub provider: ProviderConfig,
    pub scope: String,
    pub session_cookie_name: String,
    pub session_timeout: Duration,
    pub on_unauthenticated_request: UnauthenticatedAction,
}

impl AuthenticateConfig {
    pub fn new(provider: ProviderConfig) -> Self {
        Self {
            provider,
            scope: "openid".to_string(),
            session_cookie_name: DEFAULT_SESSION_COOKIE.to_string(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            on_unauthenticated_request: UnauthenticatedAction::Authenticate,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn with_session_cookie(mut self, name: impl Into<String>) -> Self {
        self.session_cookie_name = name.into();
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn on_unauthenticated(mut self, action: UnauthenticatedAction) -> Self {
        self.on_unauthenticated_request = action;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.session_timeout.is_zero() || self.session_timeout > DEFAULT_SESSION_TIMEOUT {
            return Err(LbError::config(
                ConfigErrorKind::InvalidAction,
                format!("session timeout {:?} must be 1s to 7 days", self.session_timeout),
            ));
        }
        if self.session_cookie_name.is_empty() || self.provider.client_id().is_empty() {
            return Err(LbError::config(
                ConfigErrorKind::InvalidAction,
                "authenticate needs a session cookie name and a client id",
            ));
        }
        url::Url::parse(&self.provider.authorization_endpoint()).map_err(|e| {
            LbError::config(
                ConfigErrorKind::InvalidAction,
                format!("bad authorization endpoint: {}", e),
            )
        })?;
        Ok(())
    }

    /// Authorization request URL for a request, returning the client to
    /// the load balancer's callback path on the same host.
    pub fn authorization_url(&self, request: &Request) -> Option<String> {
        let host = request.host()?;
        let callback = format!("{}://{}/oauth2/idpresponse", request.scheme.scheme(), host);
        let mut url = url::Url::parse(&self.provider.authorization_endpoint()).ok()?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", self.provider.client_id())
            .append_pair("scope", &self.scope)
            .append_pair("redirect_uri", &callback);
        Some(url.into())
    }
}

type SessionValidator = dyn Fn(&str) -> Option<Identity> + Send + Sync;

/// Provider that reads the session cookie and hands its value to a
/// validator. Token exchange is left to whatever issues the cookie.
pub struct SessionCookieProvider {
    validate: Box<SessionValidator>,
}

impl SessionCookieProvider {
    pub fn new<F>(validate: F) -> Self
    where
        F: Fn(&str) -> Option<Identity> + Send + Sync + 'static,
    {
        Self {
            validate: Box::new(validate),
        }
    }
}

impl IdentityProvider for SessionCookieProvider {
    fn authenticate(&self, request: &Request, config: &AuthenticateConfig) -> AuthResult {
        match request.cookie(&config.session_cookie_name) {
            Some(session) => match (self.validate)(session) {
                Some(identity) => AuthResult::Allow(identity),
                None => AuthResult::Deny,
            },
            None => match config.authorization_url(request) {
                Some(url) => AuthResult::RedirectToIdp(url),
                None => AuthResult::Deny,
            },
        }
    }
}

/// Authenticate the request, then continue with the wrapped action
#[derive(Clone)]
pub struct AuthenticateAction {
    config: AuthenticateConfig,
    provider: Arc<dyn IdentityProvider>,
    next: Box<Action>,
}

impl fmt::Debug for AuthenticateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticateAction")
            .field("config", &self.config)
            .field("next", &self.next)
            .finish()
    }
}

impl PartialEq for AuthenticateAction {
    fn eq(&self, other: &Self) -> bool {
        self.config == other.config
            && Arc::ptr_eq(&self.provider, &other.provider)
            && self.next == other.next
    }
}

impl AuthenticateAction {
    pub fn new(
        config: AuthenticateConfig,
        provider: Arc<dyn IdentityProvider>,
        next: Action,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            provider,
            next: Box::new(next),
        })
    }

    pub fn config(&self) -> &AuthenticateConfig {
        &self.config
    }

    pub fn next(&self) -> &Action {
        &self.next
    }

    pub(crate) fn check(&self, request: &Request) -> AuthResult {
        self.provider.authenticate(request, &self.config)
    }
}
