//! Rule actions and the decisions they produce.
//!
//! `Action` is a closed set: forward, fixed response and redirect are
//! terminal, authenticate always wraps a next action. Executing an action
//! yields a `Decision` for the transport layer to carry out.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::debug;

use crate::error::Result;
use crate::target::{InFlightGuard, SetCookie, Target, TargetGroupRegistry};
use crate::types::{Request, TargetGroupId};

mod authenticate;
mod fixed;
mod forward;
mod redirect;

pub use authenticate::{
    AuthResult, AuthenticateAction, AuthenticateConfig, Identity, IdentityProvider,
    ProviderConfig, SessionCookieProvider, UnauthenticatedAction, DEFAULT_SESSION_COOKIE,
    DEFAULT_SESSION_TIMEOUT,
};
pub use fixed::{FixedResponse, CONTENT_TYPES, MAX_BODY_LEN};
pub use forward::{ForwardAction, WeightedTargetGroup, MAX_FORWARD_GROUPS, MAX_WEIGHT};
pub use redirect::{RedirectAction, RedirectOptions};

/// What a rule does with a matched request
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Forward(ForwardAction),
    FixedResponse(FixedResponse),
    Redirect(RedirectAction),
    Authenticate(AuthenticateAction),
}

impl Action {
    /// Forward to a single target group
    pub fn forward(group: TargetGroupId) -> Self {
        Action::Forward(ForwardAction::to(group))
    }

    /// Forward to weighted target groups
    pub fn weighted_forward(groups: Vec<(TargetGroupId, u32)>) -> Result<Self> {
        Ok(Action::Forward(ForwardAction::weighted(groups)?))
    }

    pub fn fixed_response(status: u16, content_type: Option<&str>, body: Option<&str>) -> Result<Self> {
        let mut response = FixedResponse::new(status)?;
        if let Some(body) = body {
            response = response.with_body(body)?;
        }
        if let Some(ct) = content_type {
            response = response.with_content_type(ct)?;
        }
        Ok(Action::FixedResponse(response))
    }

    pub fn redirect(options: RedirectOptions) -> Result<Self> {
        Ok(Action::Redirect(RedirectAction::new(options)?))
    }

    pub fn authenticate(
        config: AuthenticateConfig,
        provider: Arc<dyn IdentityProvider>,
        next: Action,
    ) -> Result<Self> {
        Ok(Action::Authenticate(AuthenticateAction::new(config, provider, next)?))
    }

    /// True for actions that end the chain
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Action::Authenticate(_))
    }

    /// The action that finally runs once authentication passes
    pub fn terminal(&self) -> &Action {
        match self {
            Action::Authenticate(auth) => auth.next().terminal(),
            other => other,
        }
    }

    /// Target groups referenced anywhere in the chain
    pub fn target_groups(&self) -> Vec<TargetGroupId> {
        match self.terminal() {
            Action::Forward(f) => f.groups().iter().map(|g| g.group).collect(),
            _ => Vec::new(),
        }
    }

    pub fn execute(&self, request: &Request, ctx: &DispatchContext<'_>) -> Result<Decision> {
        match self {
            Action::Forward(forward) => forward.execute(request, ctx),
            Action::FixedResponse(fixed) => Ok(Decision::Respond {
                status: fixed.status(),
                content_type: fixed.content_type().map(str::to_string),
                body: fixed.body().map(str::to_string),
            }),
            Action::Redirect(redirect) => Ok(match redirect.location(request) {
                Some(location) => Decision::RedirectTo {
                    location,
                    status: redirect.status(),
                },
                None => Decision::bad_request(),
            }),
            Action::Authenticate(auth) => match auth.check(request) {
                AuthResult::Allow(identity) => {
                    debug!(subject = %identity.subject, "request authenticated");
                    let then = auth.next().execute(request, ctx)?;
                    Ok(Decision::AuthenticateThen {
                        identity: Some(identity),
                        then: Box::new(then),
                    })
                }
                AuthResult::Deny => Ok(Decision::unauthorized()),
                AuthResult::RedirectToIdp(location) => {
                    match auth.config().on_unauthenticated_request {
                        UnauthenticatedAction::Authenticate => Ok(Decision::RedirectTo {
                            location,
                            status: 302,
                        }),
                        UnauthenticatedAction::Deny => Ok(Decision::unauthorized()),
                        UnauthenticatedAction::Allow => {
                            let then = auth.next().execute(request, ctx)?;
                            Ok(Decision::AuthenticateThen {
                                identity: None,
                                then: Box::new(then),
                            })
                        }
                    }
                }
            },
        }
    }
}

/// Read-only state an action needs to dispatch
#[derive(Clone, Copy)]
pub struct DispatchContext<'a> {
    pub groups: &'a TargetGroupRegistry,
    /// Clock used for stickiness cookies
    pub now: SystemTime,
}

impl<'a> DispatchContext<'a> {
    pub fn new(groups: &'a TargetGroupRegistry) -> Self {
        Self::at(groups, SystemTime::now())
    }

    pub fn at(groups: &'a TargetGroupRegistry, now: SystemTime) -> Self {
        Self { groups, now }
    }
}

/// Outcome of handling a request
#[derive(Debug)]
pub enum Decision {
    /// Proxy to a target. Keep `guard` alive until the downstream call ends.
    ForwardTo {
        group: TargetGroupId,
        target: Target,
        guard: InFlightGuard,
        cookies: Vec<SetCookie>,
    },
    Respond {
        status: u16,
        content_type: Option<String>,
        body: Option<String>,
    },
    RedirectTo {
        location: String,
        status: u16,
    },
    /// Authentication ran; continue with `then`
    AuthenticateThen {
        identity: Option<Identity>,
        then: Box<Decision>,
    },
    /// The caller cancelled before dispatch
    Abandoned,
}

impl Decision {
    pub fn service_unavailable() -> Self {
        Self::plain(503, "Service Unavailable")
    }

    pub fn unauthorized() -> Self {
        Self::plain(401, "Unauthorized")
    }

    pub fn bad_request() -> Self {
        Self::plain(400, "Bad Request")
    }

    fn plain(status: u16, body: &str) -> Self {
        Decision::Respond {
            status,
            content_type: Some("text/plain".to_string()),
            body: Some(body.to_string()),
        }
    }

    /// The decision after unwrapping authentication layers
    pub fn innermost(&self) -> &Decision {
        match self {
            Decision::AuthenticateThen { then, .. } => then.innermost(),
            other => other,
        }
    }

    /// HTTP status the client will see, if the decision fixes one
    pub fn status(&self) -> Option<u16> {
        match self.innermost() {
            Decision::Respond { status, .. } | Decision::RedirectTo { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Forwarded target, if any
    pub fn target(&self) -> Option<&Target> {
        match self.innermost() {
            Decision::ForwardTo { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Forwarded target group, if any
    pub fn target_group(&self) -> Option<TargetGroupId> {
        match self.innermost() {
            Decision::ForwardTo { group, .. } => Some(*group),
            _ => None,
        }
    }
}
