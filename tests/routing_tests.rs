//! End-to-end routing through the public load balancer API

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

use lb_rule_engine::{
    Action, AdminErrorKind, CancelFlag, Certificate, Condition, ConfigErrorKind, Decision,
    HealthCheck, IpTarget, ListenerOptions, LoadBalancer, Protocol, RedirectOptions, Request,
    Rule, TargetGroupId, TargetGroupOptions,
};

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// A group whose targets are all healthy
fn healthy_group(lb: &LoadBalancer, name: &str, addrs: &[&str]) -> TargetGroupId {
    let id = lb
        .create_target_group(TargetGroupOptions::new(name, Protocol::Http, 80))
        .unwrap();
    let group = lb.target_group(id).unwrap();
    for addr in addrs {
        let t = lb.register_target(id, &IpTarget::new(ip(addr))).unwrap();
        group.record_probe(t.id(), true);
    }
    id
}

fn path_rule(priority: u32, pattern: &str, action: Action) -> Rule {
    Rule::new(priority, vec![Condition::path_pattern(&[pattern]).unwrap()], action).unwrap()
}

fn ok(body: &str) -> Action {
    Action::fixed_response(200, None, Some(body)).unwrap()
}

fn body(decision: &Decision) -> Option<&str> {
    match decision.innermost() {
        Decision::Respond { body, .. } => body.as_deref(),
        _ => None,
    }
}

#[test]
fn test_api_and_web_scenario() {
    let lb = LoadBalancer::application("site");
    let api = healthy_group(&lb, "api", &["10.0.1.1"]);
    let web = healthy_group(&lb, "web", &["10.0.2.1"]);
    lb.add_listener(ListenerOptions::new(80).with_default_action(Action::forward(web)))
        .unwrap();
    lb.add_rule(80, path_rule(10, "/api/*", Action::forward(api)))
        .unwrap();

    let d = lb.handle(80, &Request::get("/api/users")).unwrap();
    assert_eq!(d.target_group(), Some(api));
    let d = lb.handle(80, &Request::get("/home")).unwrap();
    assert_eq!(d.target_group(), Some(web));
}

#[test]
fn test_default_rule_catches_everything() {
    let lb = LoadBalancer::application("site");
    lb.add_listener(ListenerOptions::new(80).with_default_action(ok("default")))
        .unwrap();

    let requests = [
        Request::get("/"),
        Request::new("DELETE", "/x/y?z=1"),
        Request::get("/a").with_host("unknown.example.org"),
        Request::get("/b").with_source_ip(ip("2001:db8::1")),
    ];
    for req in &requests {
        let d = lb.handle(80, req).unwrap();
        assert_eq!(body(&d), Some("default"));
    }
}

#[test]
fn test_lowest_priority_wins() {
    let lb = LoadBalancer::application("site");
    lb.add_listener(ListenerOptions::new(80).with_default_action(ok("default")))
        .unwrap();
    // Added out of order on purpose
    lb.add_rule(80, path_rule(30, "/img/*", ok("thirty"))).unwrap();
    lb.add_rule(80, path_rule(20, "/img/*", ok("twenty"))).unwrap();
    lb.add_rule(80, path_rule(40, "*", ok("forty"))).unwrap();

    assert_eq!(body(&lb.handle(80, &Request::get("/img/a.png")).unwrap()), Some("twenty"));
    assert_eq!(body(&lb.handle(80, &Request::get("/other")).unwrap()), Some("forty"));

    let err = lb.add_rule(80, path_rule(20, "/x", ok("dup"))).unwrap_err();
    assert_eq!(err.config_kind(), Some(ConfigErrorKind::DuplicatePriority));
}

#[test]
fn test_conditions_and_together() {
    let lb = LoadBalancer::application("site");
    lb.add_listener(ListenerOptions::new(80).with_default_action(ok("default")))
        .unwrap();
    let rule = Rule::new(
        1,
        vec![
            Condition::host_header(&["example.com"]).unwrap(),
            Condition::path_pattern(&["/img/*"]).unwrap(),
        ],
        ok("images"),
    )
    .unwrap();
    lb.add_rule(80, rule).unwrap();

    let both = Request::get("/img/a").with_host("Example.COM");
    assert_eq!(body(&lb.handle(80, &both).unwrap()), Some("images"));

    let wrong_host = Request::get("/img/a").with_host("evil-example.com");
    assert_eq!(body(&lb.handle(80, &wrong_host).unwrap()), Some("default"));

    let wrong_path = Request::get("/image").with_host("example.com");
    assert_eq!(body(&lb.handle(80, &wrong_path).unwrap()), Some("default"));
}

#[test]
fn test_header_query_and_source_conditions() {
    let lb = LoadBalancer::application("site");
    lb.add_listener(ListenerOptions::new(80).with_default_action(ok("default")))
        .unwrap();
    lb.add_rule(
        80,
        Rule::new(
            1,
            vec![Condition::http_header("X-Env", &["canary*"]).unwrap()],
            ok("canary"),
        )
        .unwrap(),
    )
    .unwrap();
    lb.add_rule(
        80,
        Rule::new(
            2,
            vec![Condition::query_string(vec![(Some("version".to_string()), "v2".to_string())]).unwrap()],
            ok("v2"),
        )
        .unwrap(),
    )
    .unwrap();
    lb.add_rule(
        80,
        Rule::new(3, vec![Condition::source_ip(&["10.0.0.0/8"]).unwrap()], ok("internal")).unwrap(),
    )
    .unwrap();

    let req = Request::get("/").with_header("x-env", "prod").with_header("X-ENV", "Canary-2");
    assert_eq!(body(&lb.handle(80, &req).unwrap()), Some("canary"));

    let req = Request::get("/list?page=2&version=V2");
    assert_eq!(body(&lb.handle(80, &req).unwrap()), Some("v2"));

    let req = Request::get("/").with_source_ip(ip("10.20.30.40"));
    assert_eq!(body(&lb.handle(80, &req).unwrap()), Some("internal"));

    // Forwarded-for headers are not consulted
    let req = Request::get("/")
        .with_source_ip(ip("192.0.2.1"))
        .with_header("X-Forwarded-For", "10.0.0.1");
    assert_eq!(body(&lb.handle(80, &req).unwrap()), Some("default"));
}

#[test]
fn test_no_healthy_targets_is_503() {
    let lb = LoadBalancer::application("site");
    let id = lb
        .create_target_group(TargetGroupOptions::new("web", Protocol::Http, 80))
        .unwrap();
    let group = lb.target_group(id).unwrap();
    let t = lb.register_target(id, &IpTarget::new(ip("10.0.0.1"))).unwrap();
    group.record_probe(t.id(), false);
    lb.add_listener(ListenerOptions::new(80).with_default_action(Action::forward(id)))
        .unwrap();

    for _ in 0..10 {
        let d = lb.handle(80, &Request::get("/")).unwrap();
        assert_eq!(d.status(), Some(503));
        assert!(d.target().is_none());
    }
}

#[test]
fn test_weighted_forward_split() {
    let lb = LoadBalancer::application("site");
    let blue = healthy_group(&lb, "blue", &["10.0.1.1"]);
    let green = healthy_group(&lb, "green", &["10.0.2.1"]);
    let action = Action::weighted_forward(vec![(blue, 3), (green, 1)]).unwrap();
    lb.add_listener(ListenerOptions::new(80).with_default_action(action))
        .unwrap();

    let mut counts: HashMap<TargetGroupId, usize> = HashMap::new();
    for _ in 0..400 {
        let d = lb.handle(80, &Request::get("/")).unwrap();
        *counts.entry(d.target_group().unwrap()).or_insert(0) += 1;
    }
    assert_eq!(counts[&blue], 300);
    assert_eq!(counts[&green], 100);
}

#[test]
fn test_weighted_forward_falls_back() {
    let lb = LoadBalancer::application("site");
    let blue = healthy_group(&lb, "blue", &["10.0.1.1"]);
    let green = lb
        .create_target_group(TargetGroupOptions::new("green", Protocol::Http, 80))
        .unwrap();
    let action = Action::weighted_forward(vec![(blue, 1), (green, 1)]).unwrap();
    lb.add_listener(ListenerOptions::new(80).with_default_action(action))
        .unwrap();

    for _ in 0..10 {
        let d = lb.handle(80, &Request::get("/")).unwrap();
        assert_eq!(d.target_group(), Some(blue));
    }
}

#[test]
fn test_group_stickiness_cookie() {
    let lb = LoadBalancer::application("site");
    let blue = healthy_group(&lb, "blue", &["10.0.1.1"]);
    let green = healthy_group(&lb, "green", &["10.0.2.1"]);
    let forward = lb_rule_engine::ForwardAction::weighted(vec![(blue, 1), (green, 1)])
        .unwrap()
        .with_stickiness(Duration::from_secs(60))
        .unwrap();
    lb.add_listener(ListenerOptions::new(80).with_default_action(Action::Forward(forward)))
        .unwrap();

    let now = SystemTime::now();
    let listener = lb.listener(80).unwrap();
    let first = listener.handle_at(&Request::get("/"), now);
    let (group, cookie) = match &first {
        Decision::ForwardTo { group, cookies, .. } => {
            let c = cookies.iter().find(|c| c.name == "lb-tg").unwrap();
            (*group, format!("{}={}", c.name, c.value))
        }
        other => panic!("unexpected {:?}", other),
    };
    drop(first);

    let req = Request::get("/").with_header("Cookie", cookie);
    for _ in 0..10 {
        let d = listener.handle_at(&req, now + Duration::from_secs(1));
        assert_eq!(d.target_group(), Some(group));
    }
}

#[test]
fn test_redirect_to_https() {
    let lb = LoadBalancer::application("site");
    let redirect = Action::redirect(
        RedirectOptions::new()
            .with_protocol("HTTPS")
            .with_port("443")
            .permanent(),
    )
    .unwrap();
    lb.add_listener(ListenerOptions::new(80).with_default_action(redirect))
        .unwrap();

    let req = Request::get("/cart?item=42").with_host("shop.example.com");
    match lb.handle(80, &req).unwrap() {
        Decision::RedirectTo { location, status } => {
            assert_eq!(status, 301);
            assert_eq!(location, "https://shop.example.com/cart?item=42");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_redirect_loop_rejected() {
    let err = Action::redirect(RedirectOptions::new()).unwrap_err();
    assert_eq!(err.config_kind(), Some(ConfigErrorKind::RedirectLoop));

    let err = Action::redirect(
        RedirectOptions::new()
            .with_protocol("#{protocol}")
            .with_host("#{host}")
            .with_port("#{port}")
            .with_path("/#{path}"),
    )
    .unwrap_err();
    assert_eq!(err.config_kind(), Some(ConfigErrorKind::RedirectLoop));
}

#[test]
fn test_cancelled_request_is_abandoned() {
    let lb = LoadBalancer::application("site");
    let web = healthy_group(&lb, "web", &["10.0.0.1"]);
    let listener = lb
        .add_listener(ListenerOptions::new(80).with_default_action(Action::forward(web)))
        .unwrap();

    let cancel = CancelFlag::new();
    cancel.cancel();
    let d = listener.handle_with_cancel(&Request::get("/"), &cancel);
    assert!(matches!(d, Decision::Abandoned));
    assert_eq!(lb.target_group(web).unwrap().in_flight("10.0.0.1:80"), Some(0));
}

#[test]
fn test_rule_mutation_under_live_reads() {
    let lb = std::sync::Arc::new(LoadBalancer::application("site"));
    lb.add_listener(ListenerOptions::new(80).with_default_action(ok("default")))
        .unwrap();

    let reader = {
        let lb = lb.clone();
        std::thread::spawn(move || {
            for _ in 0..2000 {
                let d = lb.handle(80, &Request::get("/api/x")).unwrap();
                let b = body(&d).unwrap().to_string();
                assert!(b == "default" || b == "api", "unexpected body {}", b);
            }
        })
    };
    for _ in 0..200 {
        lb.add_rule(80, path_rule(10, "/api/*", ok("api"))).unwrap();
        lb.remove_rule(80, 10).unwrap();
    }
    reader.join().unwrap();
}

#[test]
fn test_https_listener_certificates() {
    let lb = LoadBalancer::application("site");
    let err = lb.add_listener(ListenerOptions::new(443)).unwrap_err();
    assert_eq!(err.config_kind(), Some(ConfigErrorKind::MissingCertificate));

    let listener = lb
        .add_listener(
            ListenerOptions::new(443)
                .with_certificate(Certificate::new("default").with_domain("example.com"))
                .with_certificate(Certificate::new("wild").with_domain("*.shop.example.com")),
        )
        .unwrap();
    assert_eq!(listener.protocol(), Protocol::Https);
    let tls = listener.tls().unwrap();
    assert_eq!(tls.select_certificate(Some("eu.shop.example.com")).id(), "wild");
    assert_eq!(tls.select_certificate(Some("other.org")).id(), "default");
    assert_eq!(tls.select_certificate(None).id(), "default");
}

#[test]
fn test_group_protocol_must_match_listener() {
    let lb = LoadBalancer::application("site");
    let tcp = lb
        .create_target_group(
            TargetGroupOptions::new("tcp", Protocol::Tcp, 5432).with_health_check(HealthCheck::disabled()),
        )
        .unwrap();
    let err = lb
        .add_listener(ListenerOptions::new(80).with_default_action(Action::forward(tcp)))
        .unwrap_err();
    assert_eq!(err.config_kind(), Some(ConfigErrorKind::UnsupportedProtocol));

    let err = lb
        .add_listener(ListenerOptions::new(81).with_default_action(Action::forward(TargetGroupId(99))))
        .unwrap_err();
    assert_eq!(err.admin_kind(), Some(AdminErrorKind::NotFound));
    assert!(lb.ports().is_empty());
}

#[test]
fn test_remove_rule_errors() {
    let lb = LoadBalancer::application("site");
    lb.add_listener(ListenerOptions::new(80).with_default_action(ok("default")))
        .unwrap();
    let err = lb.remove_rule(80, 7).unwrap_err();
    assert_eq!(err.admin_kind(), Some(AdminErrorKind::NotFound));

    lb.add_rule(80, path_rule(7, "/x", ok("x"))).unwrap();
    let listener = lb.listener(80).unwrap();
    let err = listener.remove_default_rule().unwrap_err();
    assert_eq!(err.config_kind(), Some(ConfigErrorKind::InvalidDefaultRule));

    lb.remove_rule(80, 7).unwrap();
    listener.remove_default_rule().unwrap();
    assert_eq!(lb.handle(80, &Request::get("/")).unwrap().status(), Some(503));
}
