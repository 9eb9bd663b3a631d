//! Listeners: a protocol and port bound to a rule table.
//!
//! The listener is the request entry point. It evaluates its rules,
//! executes the matched action and always returns a `Decision`; a
//! forward with no healthy targets becomes a 503 response.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::action::{Action, Decision, DispatchContext};
use crate::error::{AdminErrorKind, ConfigErrorKind, LbError, Result};
use crate::matcher::GlobPattern;
use crate::rule::{Rule, RuleTable};
use crate::target::TargetGroupRegistry;
use crate::types::{LoadBalancerKind, Protocol, Request, TargetType};

/// A server certificate, identified by id and the names it covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    id: String,
    domains: Vec<String>,
}

impl Certificate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            domains: Vec::new(),
        }
    }

    /// Add a covered name; wildcards such as "*.example.com" are allowed
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domains.push(domain.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn covers(&self, server_name: &str) -> bool {
        self.domains
            .iter()
            .any(|d| GlobPattern::case_insensitive(d).matches(server_name))
    }
}

/// Negotiation policy for secure listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SslPolicy {
    #[default]
    Recommended,
    RecommendedTls13,
    Tls13Only,
    Tls12,
    Fips,
    Legacy,
}

impl SslPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            SslPolicy::Recommended => "ELBSecurityPolicy-2016-08",
            SslPolicy::RecommendedTls13 => "ELBSecurityPolicy-TLS13-1-2-2021-06",
            SslPolicy::Tls13Only => "ELBSecurityPolicy-TLS13-1-3-2021-06",
            SslPolicy::Tls12 => "ELBSecurityPolicy-TLS-1-2-2017-01",
            SslPolicy::Fips => "ELBSecurityPolicy-TLS13-1-2-FIPS-2023-04",
            SslPolicy::Legacy => "ELBSecurityPolicy-TLS-1-0-2015-04",
        }
    }
}

/// ALPN protocols offered by a TLS listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlpnPolicy {
    Http1Only,
    Http2Only,
    Http2Optional,
    Http2Preferred,
    #[default]
    None,
}

impl AlpnPolicy {
    /// Protocol ids in preference order
    pub fn protocols(&self) -> &'static [&'static str] {
        match self {
            AlpnPolicy::Http1Only => &["http/1.1"],
            AlpnPolicy::Http2Only => &["h2"],
            AlpnPolicy::Http2Optional => &["http/1.1", "h2"],
            AlpnPolicy::Http2Preferred => &["h2", "http/1.1"],
            AlpnPolicy::None => &[],
        }
    }
}

/// TLS settings of an HTTPS or TLS listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    default_certificate: Certificate,
    sni_certificates: Vec<Certificate>,
    ssl_policy: SslPolicy,
    alpn_policy: AlpnPolicy,
}

impl TlsConfig {
    pub fn default_certificate(&self) -> &Certificate {
        &self.default_certificate
    }

    pub fn sni_certificates(&self) -> &[Certificate] {
        &self.sni_certificates
    }

    pub fn ssl_policy(&self) -> SslPolicy {
        self.ssl_policy
    }

    pub fn alpn_policy(&self) -> AlpnPolicy {
        self.alpn_policy
    }

    /// Certificate to present for a client's server name
    pub fn select_certificate(&self, server_name: Option<&str>) -> &Certificate {
        server_name
            .and_then(|name| self.sni_certificates.iter().find(|c| c.covers(name)))
            .unwrap_or(&self.default_certificate)
    }
}

/// Listener construction options
#[derive(Debug, Clone, Default)]
pub struct ListenerOptions {
    pub port: u16,
    /// None infers the protocol from the port and certificates
    pub protocol: Option<Protocol>,
    /// First certificate is the default; the rest are SNI certificates
    pub certificates: Vec<Certificate>,
    pub ssl_policy: Option<SslPolicy>,
    pub alpn_policy: Option<AlpnPolicy>,
    pub default_action: Option<Action>,
}

impl ListenerOptions {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_certificate(mut self, certificate: Certificate) -> Self {
        self.certificates.push(certificate);
        self
    }

    pub fn with_ssl_policy(mut self, policy: SslPolicy) -> Self {
        self.ssl_policy = Some(policy);
        self
    }

    pub fn with_alpn_policy(mut self, policy: AlpnPolicy) -> Self {
        self.alpn_policy = Some(policy);
        self
    }

    pub fn with_default_action(mut self, action: Action) -> Self {
        self.default_action = Some(action);
        self
    }
}

/// Cooperative cancellation for a single request
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A listening port with its rules
pub struct Listener {
    port: u16,
    protocol: Protocol,
    tls: Option<TlsConfig>,
    rules: RuleTable,
    groups: Arc<TargetGroupRegistry>,
    released: AtomicBool,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .field("rules", &self.rules)
            .finish()
    }
}

fn unsupported(message: impl Into<String>) -> LbError {
    LbError::config(ConfigErrorKind::UnsupportedProtocol, message)
}

impl Listener {
    /// Create a listener for a load balancer of the given kind. Without an
    /// explicit protocol, application listeners use HTTPS on 443 and HTTP
    /// elsewhere; network listeners use TLS when given a certificate.
    pub fn new(
        options: ListenerOptions,
        kind: LoadBalancerKind,
        groups: Arc<TargetGroupRegistry>,
    ) -> Result<Self> {
        let registry = Arc::clone(&groups);
        let _admin = registry.lock_admin();
        Self::new_locked(options, kind, groups)
    }

    pub(crate) fn new_locked(
        options: ListenerOptions,
        kind: LoadBalancerKind,
        groups: Arc<TargetGroupRegistry>,
    ) -> Result<Self> {
        let protocol = match options.protocol {
            Some(p) => p,
            None if kind.is_application() && options.port == 443 => Protocol::Https,
            None if kind.is_application() => Protocol::Http,
            None if !options.certificates.is_empty() => Protocol::Tls,
            None => Protocol::Tcp,
        };
        if !kind.supports(protocol) {
            return Err(unsupported(format!("{} listener on a {} load balancer", protocol, kind)));
        }

        let tls = if protocol.requires_certificate() {
            let mut certificates = options.certificates.into_iter();
            let default_certificate = certificates.next().ok_or_else(|| {
                LbError::config(
                    ConfigErrorKind::MissingCertificate,
                    format!("{} listener on port {} needs a certificate", protocol, options.port),
                )
            })?;
            if options.alpn_policy.is_some() && protocol != Protocol::Tls {
                return Err(unsupported("ALPN policy applies to TLS listeners only"));
            }
            Some(TlsConfig {
                default_certificate,
                sni_certificates: certificates.collect(),
                ssl_policy: options.ssl_policy.unwrap_or_default(),
                alpn_policy: options.alpn_policy.unwrap_or_default(),
            })
        } else {
            if !options.certificates.is_empty()
                || options.ssl_policy.is_some()
                || options.alpn_policy.is_some()
            {
                return Err(unsupported(format!("{} listener does not take TLS settings", protocol)));
            }
            None
        };

        let listener = Self {
            port: options.port,
            protocol,
            tls,
            rules: RuleTable::new(),
            groups,
            released: AtomicBool::new(false),
        };
        if let Some(action) = options.default_action {
            listener.add_rule_locked(Rule::default_rule(action))?;
        }
        info!(port = listener.port, protocol = %listener.protocol, "listener created");
        Ok(listener)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn tls(&self) -> Option<&TlsConfig> {
        self.tls.as_ref()
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Check the rule against this listener's protocol and group registry
    fn check_rule(&self, rule: &Rule) -> Result<()> {
        if !self.protocol.is_application() {
            let single_forward = matches!(rule.action(), Action::Forward(f) if f.groups().len() == 1);
            if !rule.is_default() || !single_forward {
                return Err(unsupported(format!(
                    "{} listener takes only a default forward to one target group",
                    self.protocol
                )));
            }
        }

        for id in rule.action().target_groups() {
            let group = self.groups.require(id)?;
            let lambda = group.target_type() == Some(TargetType::Lambda);
            if !lambda && group.protocol().is_application() != self.protocol.is_application() {
                return Err(unsupported(format!(
                    "{} target group {} behind a {} listener",
                    group.protocol(),
                    id,
                    self.protocol
                )));
            }
        }
        Ok(())
    }

    fn attach(&self, rule: &Rule) {
        for id in rule.action().target_groups() {
            if let Some(group) = self.groups.get(id) {
                group.attach();
            }
        }
    }

    fn detach(&self, rule: &Rule) {
        for id in rule.action().target_groups() {
            if let Some(group) = self.groups.get(id) {
                group.detach();
            }
        }
    }

    /// Whether the listener was removed from its load balancer
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_released() {
            return Err(LbError::admin(
                AdminErrorKind::NotFound,
                format!("listener on port {} was removed", self.port),
            ));
        }
        Ok(())
    }

    pub fn add_rule(&self, rule: Rule) -> Result<()> {
        let _admin = self.groups.lock_admin();
        self.add_rule_locked(rule)
    }

    pub fn remove_rule(&self, priority: u32) -> Result<()> {
        let _admin = self.groups.lock_admin();
        self.remove_rule_locked(priority)
    }

    pub fn remove_default_rule(&self) -> Result<()> {
        let _admin = self.groups.lock_admin();
        self.ensure_live()?;
        let removed = self.rules.remove_default()?;
        self.detach(&removed);
        Ok(())
    }

    /// Replace the rule at the same priority (or the default rule)
    pub fn replace_rule(&self, rule: Rule) -> Result<()> {
        let _admin = self.groups.lock_admin();
        self.replace_rule_locked(rule)
    }

    pub(crate) fn add_rule_locked(&self, rule: Rule) -> Result<()> {
        self.ensure_live()?;
        self.check_rule(&rule)?;
        let rule = self.rules.add(rule)?;
        self.attach(&rule);
        Ok(())
    }

    pub(crate) fn remove_rule_locked(&self, priority: u32) -> Result<()> {
        self.ensure_live()?;
        let removed = self.rules.remove(priority)?;
        self.detach(&removed);
        Ok(())
    }

    pub(crate) fn replace_rule_locked(&self, rule: Rule) -> Result<()> {
        self.ensure_live()?;
        self.check_rule(&rule)?;
        let new_groups = rule.action().target_groups();
        let old = self.rules.replace(rule)?;
        for id in new_groups {
            if let Some(group) = self.groups.get(id) {
                group.attach();
            }
        }
        self.detach(&old);
        Ok(())
    }

    /// Drop every group reference this listener's rules hold. Later rule
    /// changes fail with `NotFound`.
    pub fn release(&self) {
        let _admin = self.groups.lock_admin();
        self.release_locked();
    }

    pub(crate) fn release_locked(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        for rule in self.rules.rules() {
            self.detach(&rule);
        }
    }

    pub fn handle(&self, request: &Request) -> Decision {
        self.dispatch(request, None, SystemTime::now())
    }

    /// Handle a request, giving up before dispatch once `cancel` is set
    pub fn handle_with_cancel(&self, request: &Request, cancel: &CancelFlag) -> Decision {
        self.dispatch(request, Some(cancel), SystemTime::now())
    }

    /// Handle with an explicit clock for stickiness cookies
    pub fn handle_at(&self, request: &Request, now: SystemTime) -> Decision {
        self.dispatch(request, None, now)
    }

    fn dispatch(&self, request: &Request, cancel: Option<&CancelFlag>, now: SystemTime) -> Decision {
        let cancelled = || cancel.is_some_and(CancelFlag::is_cancelled);
        if cancelled() {
            return Decision::Abandoned;
        }

        let Some(rule) = self.rules.evaluate(request) else {
            warn!(port = self.port, "listener has no default rule");
            return Decision::service_unavailable();
        };
        if cancelled() {
            debug!(port = self.port, "request abandoned before dispatch");
            return Decision::Abandoned;
        }

        let ctx = DispatchContext::at(&self.groups, now);
        match rule.action().execute(request, &ctx) {
            Ok(decision) => decision,
            Err(LbError::NoHealthyTargets { group }) => {
                warn!(port = self.port, group = %group, "no healthy targets");
                Decision::service_unavailable()
            }
            Err(e) => {
                warn!(port = self.port, error = %e, "action failed");
                Decision::Respond {
                    status: 500,
                    content_type: Some("text/plain".to_string()),
                    body: Some("Internal Server Error".to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::error::AdminErrorKind;
    use crate::matcher::Condition;
    use crate::target::{IpTarget, TargetGroupOptions};
    use crate::types::TargetGroupId;

    const ALB: LoadBalancerKind = LoadBalancerKind::Application;
    const NLB: LoadBalancerKind = LoadBalancerKind::Network;

    fn registry() -> Arc<TargetGroupRegistry> {
        Arc::new(TargetGroupRegistry::new())
    }

    fn group(registry: &TargetGroupRegistry, name: &str, protocol: Protocol, healthy: &[&str]) -> TargetGroupId {
        let id = registry.create(TargetGroupOptions::new(name, protocol, 80)).unwrap();
        let g = registry.get(id).unwrap();
        for addr in healthy {
            let ip: IpAddr = addr.parse().unwrap();
            let t = g.register_target(&IpTarget::new(ip)).unwrap();
            g.record_probe(t.id(), true);
        }
        id
    }

    #[test]
    fn test_protocol_inference() {
        let r = registry();
        let l = Listener::new(ListenerOptions::new(80), ALB, r.clone()).unwrap();
        assert_eq!(l.protocol(), Protocol::Http);

        let l = Listener::new(
            ListenerOptions::new(443).with_certificate(Certificate::new("cert-1")),
            ALB,
            r.clone(),
        )
        .unwrap();
        assert_eq!(l.protocol(), Protocol::Https);
        assert_eq!(l.tls().unwrap().ssl_policy(), SslPolicy::Recommended);

        let l = Listener::new(ListenerOptions::new(5432), NLB, r.clone()).unwrap();
        assert_eq!(l.protocol(), Protocol::Tcp);

        let err = Listener::new(ListenerOptions::new(80).with_protocol(Protocol::Udp), ALB, r).unwrap_err();
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::UnsupportedProtocol));
    }

    #[test]
    fn test_missing_certificate() {
        let err = Listener::new(ListenerOptions::new(443), ALB, registry()).unwrap_err();
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::MissingCertificate));
        let err = Listener::new(
            ListenerOptions::new(853).with_protocol(Protocol::Tls),
            NLB,
            registry(),
        )
        .unwrap_err();
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::MissingCertificate));
    }

    #[test]
    fn test_tls_settings() {
        let l = Listener::new(
            ListenerOptions::new(853)
                .with_protocol(Protocol::Tls)
                .with_certificate(Certificate::new("default"))
                .with_certificate(Certificate::new("api").with_domain("*.api.example.com"))
                .with_alpn_policy(AlpnPolicy::Http2Preferred),
            NLB,
            registry(),
        )
        .unwrap();
        let tls = l.tls().unwrap();
        assert_eq!(tls.alpn_policy().protocols(), &["h2", "http/1.1"]);
        assert_eq!(tls.select_certificate(Some("v1.api.example.com")).id(), "api");
        assert_eq!(tls.select_certificate(Some("www.example.com")).id(), "default");
        assert_eq!(tls.select_certificate(None).id(), "default");

        let err = Listener::new(
            ListenerOptions::new(80).with_ssl_policy(SslPolicy::Tls12),
            ALB,
            registry(),
        )
        .unwrap_err();
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::UnsupportedProtocol));
    }

    #[test]
    fn test_path_routing() {
        let r = registry();
        let api = group(&r, "api", Protocol::Http, &["10.0.1.1"]);
        let web = group(&r, "web", Protocol::Http, &["10.0.2.1"]);
        let l = Listener::new(
            ListenerOptions::new(80).with_default_action(Action::forward(web)),
            ALB,
            r,
        )
        .unwrap();
        l.add_rule(
            Rule::new(10, vec![Condition::path_pattern(&["/api/*"]).unwrap()], Action::forward(api)).unwrap(),
        )
        .unwrap();

        assert_eq!(l.handle(&Request::get("/api/users")).target_group(), Some(api));
        assert_eq!(l.handle(&Request::get("/home")).target_group(), Some(web));
    }

    #[test]
    fn test_no_healthy_targets_is_503() {
        let r = registry();
        let empty = group(&r, "empty", Protocol::Http, &[]);
        let l = Listener::new(
            ListenerOptions::new(80).with_default_action(Action::forward(empty)),
            ALB,
            r,
        )
        .unwrap();
        for _ in 0..5 {
            assert_eq!(l.handle(&Request::get("/")).status(), Some(503));
        }
    }

    #[test]
    fn test_no_default_rule_is_503() {
        let l = Listener::new(ListenerOptions::new(80), ALB, registry()).unwrap();
        assert_eq!(l.handle(&Request::get("/")).status(), Some(503));
    }

    #[test]
    fn test_cancelled_request_is_abandoned() {
        let r = registry();
        let web = group(&r, "web", Protocol::Http, &["10.0.0.1"]);
        let l = Listener::new(
            ListenerOptions::new(80).with_default_action(Action::forward(web)),
            ALB,
            r.clone(),
        )
        .unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();
        assert!(matches!(
            l.handle_with_cancel(&Request::get("/"), &cancel),
            Decision::Abandoned
        ));
        let g = r.get(web).unwrap();
        assert_eq!(g.in_flight("10.0.0.1:80"), Some(0));
        assert!(l.handle_with_cancel(&Request::get("/"), &CancelFlag::new()).target().is_some());
    }

    #[test]
    fn test_network_listener_rules() {
        let r = registry();
        let tcp = group(&r, "db", Protocol::Tcp, &[]);
        let http = group(&r, "web", Protocol::Http, &[]);
        let l = Listener::new(ListenerOptions::new(5432), NLB, r.clone()).unwrap();

        let err = l
            .add_rule(Rule::new(1, vec![Condition::path_pattern(&["/x"]).unwrap()], Action::forward(tcp)).unwrap())
            .unwrap_err();
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::UnsupportedProtocol));
        let err = l
            .add_rule(Rule::default_rule(Action::fixed_response(200, None, None).unwrap()))
            .unwrap_err();
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::UnsupportedProtocol));
        let err = l.add_rule(Rule::default_rule(Action::forward(http))).unwrap_err();
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::UnsupportedProtocol));

        l.add_rule(Rule::default_rule(Action::forward(tcp))).unwrap();
        assert_eq!(r.get(tcp).unwrap().attachments(), 1);
    }

    #[test]
    fn test_group_attachment_tracking() {
        let r = registry();
        let a = group(&r, "a", Protocol::Http, &[]);
        let b = group(&r, "b", Protocol::Http, &[]);
        let l = Listener::new(
            ListenerOptions::new(80).with_default_action(Action::forward(a)),
            ALB,
            r.clone(),
        )
        .unwrap();
        assert_eq!(r.get(a).unwrap().attachments(), 1);

        l.replace_rule(Rule::default_rule(Action::forward(b))).unwrap();
        assert_eq!(r.get(a).unwrap().attachments(), 0);
        assert_eq!(r.get(b).unwrap().attachments(), 1);

        let err = l
            .add_rule(
                Rule::new(
                    5,
                    vec![Condition::path_pattern(&["/x"]).unwrap()],
                    Action::forward(TargetGroupId(42)),
                )
                .unwrap(),
            )
            .unwrap_err();
        assert_eq!(err.admin_kind(), Some(AdminErrorKind::NotFound));

        l.release();
        assert_eq!(r.get(b).unwrap().attachments(), 0);
    }

    #[test]
    fn test_released_listener_rejects_rule_changes() {
        let r = registry();
        let a = group(&r, "a", Protocol::Http, &[]);
        let l = Listener::new(
            ListenerOptions::new(80).with_default_action(Action::forward(a)),
            ALB,
            r.clone(),
        )
        .unwrap();
        l.release();
        l.release();
        assert!(l.is_released());
        assert_eq!(r.get(a).unwrap().attachments(), 0);

        let err = l.replace_rule(Rule::default_rule(Action::forward(a))).unwrap_err();
        assert_eq!(err.admin_kind(), Some(AdminErrorKind::NotFound));
        let err = l.remove_default_rule().unwrap_err();
        assert_eq!(err.admin_kind(), Some(AdminErrorKind::NotFound));
        assert_eq!(r.get(a).unwrap().attachments(), 0);
        r.remove(a).unwrap();
    }
}
