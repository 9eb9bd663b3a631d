//! LB Rule Engine - A listener rule engine for Rust
//!
//! This library evaluates prioritized listener rules against incoming
//! requests and dispatches them to weighted, health-aware target groups:
//! - Host header, path, method, header, query string and source IP conditions
//! - Forward (weighted, sticky), fixed response, redirect and authenticate actions
//! - Target groups with health checks, draining and least-outstanding selection
//! - Lock-free rule and target snapshots, safe to mutate under live traffic
//! - Declarative JSON configuration
//!
//! # Example
//!
//! ```rust
//! use std::net::IpAddr;
//! use lb_rule_engine::{
//!     Action, Condition, IpTarget, ListenerOptions, LoadBalancer, Request, Rule,
//!     TargetGroupOptions, Protocol, HealthCheck,
//! };
//!
//! let lb = LoadBalancer::application("web");
//!
//! // Target group with health checks disabled: targets are selectable at once
//! let api = lb
//!     .create_target_group(
//!         TargetGroupOptions::new("api", Protocol::Http, 8080)
//!             .with_health_check(HealthCheck::disabled()),
//!     )
//!     .unwrap();
//! let addr: IpAddr = "10.0.0.1".parse().unwrap();
//! lb.register_target(api, &IpTarget::new(addr)).unwrap();
//!
//! // Listener with a 404 default and one path rule
//! lb.add_listener(
//!     ListenerOptions::new(80)
//!         .with_default_action(Action::fixed_response(404, None, Some("not found")).unwrap()),
//! )
//! .unwrap();
//! let rule = Rule::new(
//!     10,
//!     vec![Condition::path_pattern(&["/api/*"]).unwrap()],
//!     Action::forward(api),
//! )
//! .unwrap();
//! lb.add_rule(80, rule).unwrap();
//!
//! let decision = lb.handle(80, &Request::get("/api/users")).unwrap();
//! assert_eq!(decision.target().unwrap().id(), "10.0.0.1:8080");
//!
//! let decision = lb.handle(80, &Request::get("/other")).unwrap();
//! assert_eq!(decision.status(), Some(404));
//! ```
//!
//! # Evaluation
//!
//! Rules are evaluated in ascending priority; all conditions of a rule
//! must match. The default rule has no conditions and always runs last.
//!
//! | Condition | Matching |
//! |-----------|----------|
//! | `host_header` | Case-insensitive glob (`*`, `?`), port stripped |
//! | `path_pattern` | Case-sensitive glob on the path only |
//! | `http_header` | Case-insensitive name, case-insensitive glob values |
//! | `http_request_method` | Exact |
//! | `query_string` | Exact key, case-insensitive glob value |
//! | `source_ip` | CIDR containment, IPv4 and IPv6 |

pub mod action;
pub mod balancer;
pub mod config;
pub mod error;
pub mod health;
pub mod listener;
pub mod matcher;
pub mod rule;
pub mod target;
pub mod types;

// Re-export commonly used items
pub use action::{
    Action, AuthResult, AuthenticateConfig, Decision, DispatchContext, FixedResponse,
    ForwardAction, Identity, IdentityProvider, ProviderConfig, RedirectAction, RedirectOptions,
    SessionCookieProvider, UnauthenticatedAction,
};
pub use balancer::{AddTargetsOptions, LoadBalancer};
pub use config::{EngineConfig, IdentityProviders};
pub use error::{AdminErrorKind, ConfigErrorKind, LbError, Result};
pub use listener::{
    AlpnPolicy, CancelFlag, Certificate, Listener, ListenerOptions, SslPolicy, TlsConfig,
};
pub use matcher::{Condition, GlobPattern, RequestMatcher};
pub use rule::{Rule, RuleTable, MAX_PRIORITY, MIN_PRIORITY};
pub use types::{LoadBalancerKind, Protocol, Request, TargetGroupId, TargetType};

// Re-export target types
pub use target::{
    AlbTarget, Attachable, DrainTicket, InFlightGuard, InstanceTarget, IpTarget, LambdaTarget,
    LoadBalancingAlgorithm, Target, TargetDescriptor, TargetGroup, TargetGroupOptions,
    TargetGroupRegistry, TargetHealthDescription, TargetState,
};

// Re-export health types
pub use health::{
    HealthCheck, HealthProber, HttpProber, ProbeResult, StaticProber, StatusMatcher, TcpProber,
};
#[cfg(feature = "async")]
pub use health::{AsyncHealthProber, BlockingProber, DrainTimers, HealthMonitor};

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_full_workflow() {
        let lb = LoadBalancer::application("shop");

        // Two groups: web with health checks, api without
        let web = lb
            .create_target_group(TargetGroupOptions::new("web", Protocol::Http, 80))
            .unwrap();
        let api = lb
            .create_target_group(
                TargetGroupOptions::new("api", Protocol::Http, 8080)
                    .with_health_check(HealthCheck::disabled()),
            )
            .unwrap();
        lb.register_target(web, &InstanceTarget::new("i-1")).unwrap();
        lb.register_target(web, &InstanceTarget::new("i-2")).unwrap();
        lb.register_target(api, &IpTarget::new(ip("10.0.1.1"))).unwrap();

        lb.add_listener(ListenerOptions::new(80).with_default_action(Action::forward(web)))
            .unwrap();
        lb.add_rule(
            80,
            Rule::new(
                5,
                vec![
                    Condition::host_header(&["api.example.com"]).unwrap(),
                    Condition::http_request_method(&["GET"]).unwrap(),
                ],
                Action::forward(api),
            )
            .unwrap(),
        )
        .unwrap();
        lb.add_rule(
            80,
            Rule::new(
                10,
                vec![Condition::path_pattern(&["/health"]).unwrap()],
                Action::fixed_response(200, None, Some("ok")).unwrap(),
            )
            .unwrap(),
        )
        .unwrap();

        // API rule wins for matching host and method
        let req = Request::get("/v1/items").with_host("API.example.com:80");
        let d = lb.handle(80, &req).unwrap();
        assert_eq!(d.target_group(), Some(api));

        // Method mismatch falls through to the default
        let req = Request::new("POST", "/v1/items").with_host("api.example.com");
        let d = lb.handle(80, &req).unwrap();
        assert_eq!(d.status(), Some(503), "web targets are still initial");

        // Fixed response
        let d = lb.handle(80, &Request::get("/health")).unwrap();
        assert_eq!(d.status(), Some(200));

        // The first passing probe settles initial targets
        let group = lb.target_group(web).unwrap();
        group.record_probe("i-1:80", true);
        group.record_probe("i-2:80", true);
        let mut seen = Vec::new();
        for _ in 0..4 {
            let d = lb.handle(80, &Request::get("/")).unwrap();
            seen.push(d.target().unwrap().id().to_string());
        }
        assert_ne!(seen[0], seen[1]);
        assert_eq!(seen[0], seen[2]);
        assert_eq!(seen[1], seen[3]);

        // Removing a rule restores the default for its traffic
        lb.remove_rule(80, 10).unwrap();
        let d = lb.handle(80, &Request::get("/health")).unwrap();
        assert_eq!(d.target_group(), Some(web));
    }
}
