//! Declarative configuration.
//!
//! An `EngineConfig` describes a whole load balancer in JSON: target
//! groups with their targets and health checks, and listeners with
//! their rules. Rules mirror the listener-rule shape:
//!
//! ```json
//! {
//!   "kind": "application",
//!   "target_groups": [
//!     { "name": "api", "port": 8080,
//!       "targets": [{ "ip": { "address": "10.0.0.1" } }] }
//!   ],
//!   "listeners": [
//!     { "port": 80, "rules": [
//!       { "priority": 10,
//!         "conditions": [{ "path_pattern": ["/api/*"] }],
//!         "forward": { "target_groups": [{ "name": "api" }] } },
//!       { "fixed_response": { "status_code": 404 } }
//!     ] }
//!   ]
//! }
//! ```
//!
//! Durations are integer seconds. Forward actions name target groups;
//! authenticate actions name an identity provider supplied by the caller.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::action::{
    Action, AuthenticateConfig, ForwardAction, IdentityProvider, ProviderConfig,
    RedirectOptions, UnauthenticatedAction,
};
use crate::balancer::LoadBalancer;
use crate::error::{AdminErrorKind, ConfigErrorKind, LbError, Result};
use crate::health::{HealthCheck, StatusMatcher};
use crate::listener::{AlpnPolicy, Certificate, ListenerOptions, SslPolicy};
use crate::matcher::Condition;
use crate::rule::Rule;
use crate::target::{LoadBalancingAlgorithm, TargetDescriptor, TargetGroupOptions};
use crate::types::{LoadBalancerKind, Protocol, TargetGroupId, TargetType};

/// Identity providers available to authenticate actions, by name
pub type IdentityProviders = HashMap<String, Arc<dyn IdentityProvider>>;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: LoadBalancerKind,
    #[serde(default)]
    pub target_groups: Vec<TargetGroupConfig>,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetGroupConfig {
    pub name: String,
    /// Defaults to HTTP on application and TCP on network load balancers
    pub protocol: Option<Protocol>,
    /// Defaults to 443 for HTTPS and 80 otherwise
    pub port: Option<u16>,
    pub target_type: Option<TargetType>,
    #[serde(default)]
    pub algorithm: LoadBalancingAlgorithm,
    pub deregistration_delay: Option<u64>,
    pub stickiness: Option<u64>,
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

/// Health check overrides; unset fields keep the target type defaults
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthCheckConfig {
    pub enabled: Option<bool>,
    pub protocol: Option<Protocol>,
    pub path: Option<String>,
    pub port: Option<u16>,
    pub interval: Option<u64>,
    pub timeout: Option<u64>,
    pub healthy_threshold: Option<u32>,
    pub unhealthy_threshold: Option<u32>,
    pub matcher: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum TargetConfig {
    Instance {
        id: String,
        port: Option<u16>,
        private_ip: Option<IpAddr>,
    },
    Ip {
        address: IpAddr,
        port: Option<u16>,
        availability_zone: Option<String>,
    },
    Lambda {
        function_arn: String,
    },
    Alb {
        alb_arn: String,
        port: u16,
    },
}

impl From<TargetConfig> for TargetDescriptor {
    fn from(config: TargetConfig) -> Self {
        match config {
            TargetConfig::Instance {
                id,
                port,
                private_ip,
            } => TargetDescriptor::Instance {
                instance_id: id,
                port,
                private_ip,
            },
            TargetConfig::Ip {
                address,
                port,
                availability_zone,
            } => TargetDescriptor::Ip {
                address,
                port,
                availability_zone,
            },
            TargetConfig::Lambda { function_arn } => TargetDescriptor::Lambda { function_arn },
            TargetConfig::Alb { alb_arn, port } => TargetDescriptor::Alb { alb_arn, port },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    pub port: u16,
    pub protocol: Option<Protocol>,
    /// First certificate is the default one
    #[serde(default)]
    pub certificates: Vec<CertificateConfig>,
    pub ssl_policy: Option<SslPolicy>,
    pub alpn_policy: Option<AlpnPolicy>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertificateConfig {
    pub id: String,
    #[serde(default)]
    pub domains: Vec<String>,
}

/// One listener rule. Omit priority and conditions for the default rule.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleConfig {
    pub priority: Option<u32>,
    pub conditions: Vec<ConditionConfig>,
    pub forward: Option<ForwardConfig>,
    pub fixed_response: Option<FixedResponseConfig>,
    pub redirect: Option<RedirectOptions>,
    /// Runs before the terminal action
    pub authenticate: Option<AuthenticateEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum ConditionConfig {
    HostHeader(Vec<String>),
    PathPattern(Vec<String>),
    HttpHeader { name: String, values: Vec<String> },
    HttpRequestMethod(Vec<String>),
    QueryString(Vec<QueryPairConfig>),
    SourceIp(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryPairConfig {
    pub key: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardConfig {
    pub target_groups: Vec<WeightedGroupConfig>,
    pub stickiness: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeightedGroupConfig {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixedResponseConfig {
    pub status_code: u16,
    pub content_type: Option<String>,
    pub message_body: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthenticateEntry {
    /// Key into the caller's `IdentityProviders`
    pub identity_provider: String,
    pub provider: ProviderConfig,
    pub scope: Option<String>,
    pub session_cookie_name: Option<String>,
    pub session_timeout: Option<u64>,
    #[serde(default)]
    pub on_unauthenticated_request: UnauthenticatedAction,
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Build a load balancer with no identity providers
    pub fn build(&self) -> Result<LoadBalancer> {
        self.build_with(&IdentityProviders::new())
    }

    pub fn build_with(&self, providers: &IdentityProviders) -> Result<LoadBalancer> {
        let lb = LoadBalancer::new(self.name.clone(), self.kind);

        let mut names: HashMap<&str, TargetGroupId> = HashMap::new();
        for tg in &self.target_groups {
            if names.contains_key(tg.name.as_str()) {
                return Err(LbError::config(
                    ConfigErrorKind::InvalidTargetGroup,
                    format!("duplicate target group name {:?}", tg.name),
                ));
            }
            let id = lb.create_target_group(tg.options(self.kind)?)?;
            for target in &tg.targets {
                lb.register_target(id, &TargetDescriptor::from(target.clone()))?;
            }
            names.insert(&tg.name, id);
        }

        for listener in &self.listeners {
            let mut options = ListenerOptions::new(listener.port);
            options.protocol = listener.protocol;
            options.ssl_policy = listener.ssl_policy;
            options.alpn_policy = listener.alpn_policy;
            options.certificates = listener
                .certificates
                .iter()
                .map(|c| {
                    c.domains
                        .iter()
                        .fold(Certificate::new(&c.id), |cert, d| cert.with_domain(d))
                })
                .collect();
            lb.add_listener(options)?;

            for rule in &listener.rules {
                let action = rule.action(&names, providers)?;
                let rule = Rule::from_parts(rule.priority, rule.conditions()?, action)?;
                lb.add_rule(listener.port, rule)?;
            }
        }

        info!(
            lb = %lb.name(),
            target_groups = self.target_groups.len(),
            listeners = self.listeners.len(),
            "configuration loaded"
        );
        Ok(lb)
    }
}

impl TargetGroupConfig {
    fn options(&self, kind: LoadBalancerKind) -> Result<TargetGroupOptions> {
        let protocol = self.protocol.unwrap_or(if kind.is_application() {
            Protocol::Http
        } else {
            Protocol::Tcp
        });

        let mut options = if self.target_type == Some(TargetType::Lambda) {
            TargetGroupOptions::lambda(self.name.clone())
        } else {
            let port = self.port.or(protocol.default_port()).unwrap_or(80);
            TargetGroupOptions::new(self.name.clone(), protocol, port)
        };
        if let Some(target_type) = self.target_type {
            options.target_type = Some(target_type);
        }
        options.algorithm = self.algorithm;
        if let Some(delay) = self.deregistration_delay {
            options.deregistration_delay = Duration::from_secs(delay);
        }
        options.stickiness = self.stickiness.map(Duration::from_secs);
        if let Some(hc) = &self.health_check {
            let target_type = self.target_type.unwrap_or(TargetType::Instance);
            options.health_check = Some(hc.apply(HealthCheck::for_target_type(target_type, protocol))?);
        }
        Ok(options)
    }
}

impl HealthCheckConfig {
    fn apply(&self, mut check: HealthCheck) -> Result<HealthCheck> {
        if let Some(enabled) = self.enabled {
            check.enabled = enabled;
        }
        if let Some(protocol) = self.protocol {
            check.protocol = protocol;
        }
        if let Some(path) = &self.path {
            check.path = path.clone();
        }
        if self.port.is_some() {
            check.port = self.port;
        }
        if let Some(secs) = self.interval {
            check.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.timeout {
            check.timeout = Duration::from_secs(secs);
        }
        if let Some(n) = self.healthy_threshold {
            check.healthy_threshold = n;
        }
        if let Some(n) = self.unhealthy_threshold {
            check.unhealthy_threshold = n;
        }
        if let Some(codes) = &self.matcher {
            check.matcher = StatusMatcher::parse(codes)?;
        }
        Ok(check)
    }
}

impl ConditionConfig {
    fn to_condition(&self) -> Result<Condition> {
        match self {
            ConditionConfig::HostHeader(values) => Condition::host_header(&values[..]),
            ConditionConfig::PathPattern(values) => Condition::path_pattern(&values[..]),
            ConditionConfig::HttpHeader { name, values } => Condition::http_header(name, &values[..]),
            ConditionConfig::HttpRequestMethod(values) => Condition::http_request_method(&values[..]),
            ConditionConfig::QueryString(pairs) => Condition::query_string(
                pairs
                    .iter()
                    .map(|p| (p.key.clone(), p.value.clone()))
                    .collect(),
            ),
            ConditionConfig::SourceIp(values) => Condition::source_ip(&values[..]),
        }
    }
}

impl RuleConfig {
    fn conditions(&self) -> Result<Vec<Condition>> {
        self.conditions.iter().map(ConditionConfig::to_condition).collect()
    }

    fn action(
        &self,
        groups: &HashMap<&str, TargetGroupId>,
        providers: &IdentityProviders,
    ) -> Result<Action> {
        let declared = [
            self.forward.is_some(),
            self.fixed_response.is_some(),
            self.redirect.is_some(),
        ]
        .iter()
        .filter(|d| **d)
        .count();
        if declared > 1 {
            return Err(LbError::config(
                ConfigErrorKind::TooManyActions,
                "a rule takes one of forward, fixed_response or redirect",
            ));
        }

        let terminal = if let Some(forward) = &self.forward {
            forward.to_action(groups)?
        } else if let Some(fixed) = &self.fixed_response {
            Action::fixed_response(
                fixed.status_code,
                fixed.content_type.as_deref(),
                fixed.message_body.as_deref(),
            )?
        } else if let Some(redirect) = &self.redirect {
            Action::redirect(redirect.clone())?
        } else {
            return Err(LbError::config(
                ConfigErrorKind::InvalidAction,
                "rule has no terminal action",
            ));
        };

        match &self.authenticate {
            Some(auth) => auth.wrap(terminal, providers),
            None => Ok(terminal),
        }
    }
}

impl ForwardConfig {
    fn to_action(&self, groups: &HashMap<&str, TargetGroupId>) -> Result<Action> {
        let weighted = self
            .target_groups
            .iter()
            .map(|g| {
                groups.get(g.name.as_str()).map(|id| (*id, g.weight)).ok_or_else(|| {
                    LbError::admin(
                        AdminErrorKind::NotFound,
                        format!("target group {:?} not found", g.name),
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut forward = ForwardAction::weighted(weighted)?;
        if let Some(secs) = self.stickiness {
            forward = forward.with_stickiness(Duration::from_secs(secs))?;
        }
        Ok(Action::Forward(forward))
    }
}

impl AuthenticateEntry {
    fn wrap(&self, next: Action, providers: &IdentityProviders) -> Result<Action> {
        let provider = providers.get(&self.identity_provider).ok_or_else(|| {
            LbError::admin(
                AdminErrorKind::NotFound,
                format!("identity provider {:?} not found", self.identity_provider),
            )
        })?;

        let mut config = AuthenticateConfig::new(self.provider.clone())
            .on_unauthenticated(self.on_unauthenticated_request);
        if let Some(scope) = &self.scope {
            config = config.with_scope(scope.clone());
        }
        if let Some(name) = &self.session_cookie_name {
            config = config.with_session_cookie(name.clone());
        }
        if let Some(secs) = self.session_timeout {
            config = config.with_session_timeout(Duration::from_secs(secs));
        }
        Action::authenticate(config, Arc::clone(provider), next)
    }
}

impl LoadBalancer {
    /// Build a load balancer from a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        EngineConfig::from_json(json)?.build()
    }

    /// Build a load balancer from a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path.as_ref())
            .map_err(|e| LbError::ParseError(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{AuthResult, Decision, Identity};
    use crate::types::Request;

    const CONFIG: &str = r#"{
        "name": "web",
        "target_groups": [
            { "name": "api", "port": 8080,
              "health_check": { "enabled": false },
              "targets": [
                { "ip": { "address": "10.0.0.1" } },
                { "ip": { "address": "10.0.0.2", "port": 9090 } }
              ] },
            { "name": "static", "port": 80,
              "health_check": { "enabled": false },
              "targets": [{ "instance": { "id": "i-1" } }] }
        ],
        "listeners": [
            { "port": 80, "rules": [
                { "priority": 10,
                  "conditions": [
                    { "path_pattern": ["/api/*"] },
                    { "http_request_method": ["GET", "POST"] }
                  ],
                  "forward": { "target_groups": [{ "name": "api" }] } },
                { "priority": 20,
                  "conditions": [{ "host_header": ["old.example.com"] }],
                  "redirect": { "host": "new.example.com", "permanent": true } },
                { "forward": { "target_groups": [{ "name": "static" }] } }
            ] }
        ]
    }"#;

    #[test]
    fn test_build_from_json() {
        let lb = LoadBalancer::from_json(CONFIG).unwrap();
        assert_eq!(lb.name(), "web");
        assert_eq!(lb.ports(), vec![80]);

        let api = lb.target_groups().find_by_name("api").unwrap();
        assert_eq!(api.len(), 2);

        let d = lb.handle(80, &Request::get("/api/users").with_host("x")).unwrap();
        assert_eq!(d.target_group(), Some(api.id()));

        let d = lb
            .handle(80, &Request::get("/a").with_host("old.example.com"))
            .unwrap();
        match d {
            Decision::RedirectTo { location, status } => {
                assert_eq!(status, 301);
                assert_eq!(location, "http://new.example.com/a");
            }
            other => panic!("unexpected {:?}", other),
        }

        let d = lb.handle(80, &Request::get("/index.html")).unwrap();
        assert_eq!(d.target().unwrap().id(), "i-1:80");
    }

    #[test]
    fn test_too_many_actions() {
        let json = r#"{
            "target_groups": [{ "name": "a" }],
            "listeners": [{ "port": 80, "rules": [
                { "forward": { "target_groups": [{ "name": "a" }] },
                  "fixed_response": { "status_code": 200 } }
            ] }]
        }"#;
        let err = LoadBalancer::from_json(json).unwrap_err();
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::TooManyActions));
    }

    #[test]
    fn test_unknown_group_and_provider() {
        let json = r#"{
            "listeners": [{ "port": 80, "rules": [
                { "forward": { "target_groups": [{ "name": "missing" }] } }
            ] }]
        }"#;
        let err = LoadBalancer::from_json(json).unwrap_err();
        assert_eq!(err.admin_kind(), Some(AdminErrorKind::NotFound));

        let json = r#"{
            "listeners": [{ "port": 80, "rules": [
                { "authenticate": {
                    "identity_provider": "sso",
                    "provider": { "cognito": {
                        "user_pool": "p", "client_id": "c", "domain": "auth.example.com" } } },
                  "fixed_response": { "status_code": 200 } }
            ] }]
        }"#;
        let err = LoadBalancer::from_json(json).unwrap_err();
        assert_eq!(err.admin_kind(), Some(AdminErrorKind::NotFound));

        struct Everyone;
        impl IdentityProvider for Everyone {
            fn authenticate(&self, _: &Request, _: &AuthenticateConfig) -> AuthResult {
                AuthResult::Allow(Identity::new("anyone"))
            }
        }
        let mut providers = IdentityProviders::new();
        providers.insert("sso".to_string(), Arc::new(Everyone));
        let lb = EngineConfig::from_json(json)
            .unwrap()
            .build_with(&providers)
            .unwrap();
        let d = lb.handle(80, &Request::get("/")).unwrap();
        assert!(matches!(d, Decision::AuthenticateThen { identity: Some(_), .. }));
        assert_eq!(d.status(), Some(200));
    }

    #[test]
    fn test_health_check_overrides() {
        let json = r#"{
            "target_groups": [{ "name": "a", "port": 8080,
                "health_check": { "path": "/healthz", "interval": 10, "matcher": "200-299" } }]
        }"#;
        let lb = LoadBalancer::from_json(json).unwrap();
        let hc = lb.target_groups().find_by_name("a").unwrap().health_check();
        assert_eq!(hc.path, "/healthz");
        assert_eq!(hc.interval, Duration::from_secs(10));
        assert!(hc.matcher.matches(204));

        let bad = r#"{ "target_groups": [{ "name": "a",
            "health_check": { "matcher": "100" } }] }"#;
        let err = LoadBalancer::from_json(bad).unwrap_err();
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::InvalidHealthCheck));
    }

    #[test]
    fn test_network_defaults() {
        let json = r#"{
            "kind": "network",
            "target_groups": [{ "name": "db",
                "targets": [{ "ip": { "address": "10.0.0.5", "port": 5432 } }] }],
            "listeners": [{ "port": 5432, "rules": [
                { "forward": { "target_groups": [{ "name": "db" }] } }
            ] }]
        }"#;
        let lb = LoadBalancer::from_json(json).unwrap();
        let db = lb.target_groups().find_by_name("db").unwrap();
        assert_eq!(db.protocol(), Protocol::Tcp);
        assert_eq!(lb.listener(5432).unwrap().protocol(), Protocol::Tcp);
    }

    #[test]
    fn test_read_error_is_parse_error() {
        let err = LoadBalancer::from_file("/nonexistent/lb.json").unwrap_err();
        assert!(matches!(err, LbError::ParseError(_)));
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_malformed_json() {
        let err = LoadBalancer::from_json("{ \"listeners\": 3 }").unwrap_err();
        assert!(matches!(err, LbError::JsonError(_)));
    }
}
