use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::Mutex;

use super::HealthCheck;
use crate::target::Target;

/// Outcome of a single health probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Passed,
    Failed { reason: String },
}

impl ProbeResult {
    pub fn failed(reason: impl Into<String>) -> Self {
        ProbeResult::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, ProbeResult::Passed)
    }
}

/// Health probe transport.
///
/// Implementations must bound their own I/O by `check.timeout`.
pub trait HealthProber: Send + Sync {
    fn probe(&self, target: &Target, check: &HealthCheck) -> ProbeResult;
}

/// Resolve the address a probe should hit: the check port wins over the
/// target's traffic port.
fn probe_addr(target: &Target, check: &HealthCheck) -> Result<SocketAddr, ProbeResult> {
    let ip = target
        .address()
        .ok_or_else(|| ProbeResult::failed(format!("target {} has no probe address", target.id())))?;
    let port = check
        .port
        .or(target.port())
        .ok_or_else(|| ProbeResult::failed(format!("target {} has no probe port", target.id())))?;
    Ok(SocketAddr::new(ip, port))
}

/// TCP connect prober
#[derive(Debug, Clone, Default)]
pub struct TcpProber;

impl TcpProber {
    pub fn new() -> Self {
        Self
    }
}

impl HealthProber for TcpProber {
    fn probe(&self, target: &Target, check: &HealthCheck) -> ProbeResult {
        let addr = match probe_addr(target, check) {
            Ok(addr) => addr,
            Err(result) => return result,
        };

        let socket = match socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        ) {
            Ok(s) => s,
            Err(e) => return ProbeResult::failed(format!("Failed to create socket: {}", e)),
        };

        match socket.connect_timeout(&addr.into(), check.timeout) {
            Ok(()) => ProbeResult::Passed,
            Err(e) => ProbeResult::failed(format!("Failed to connect to {}: {}", addr, e)),
        }
    }
}

/// HTTP(S) GET prober; the response status is checked against the matcher.
/// Certificates presented by targets are not verified.
pub struct HttpProber {
    agent: ureq::Agent,
}

impl HttpProber {
    pub fn new() -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .tls_config(
                ureq::tls::TlsConfig::builder()
                    .disable_verification(true)
                    .build(),
            )
            .build()
            .into();
        Self { agent }
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthProber for HttpProber {
    fn probe(&self, target: &Target, check: &HealthCheck) -> ProbeResult {
        let addr = match probe_addr(target, check) {
            Ok(addr) => addr,
            Err(result) => return result,
        };
        let url = format!("{}://{}{}", check.protocol.scheme(), addr, check.path);

        let response = self
            .agent
            .get(&url)
            .config()
            .timeout_global(Some(check.timeout))
            .build()
            .call();

        match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if check.matcher.matches(status) {
                    ProbeResult::Passed
                } else {
                    ProbeResult::failed(format!("{} returned status {}", url, status))
                }
            }
            Err(e) => ProbeResult::failed(format!("{} failed: {}", url, e)),
        }
    }
}

/// Scripted prober: returns preset results per target id.
/// Targets without a preset result fail.
#[derive(Debug, Default)]
pub struct StaticProber {
    results: Mutex<HashMap<String, bool>>,
    counts: Mutex<HashMap<String, usize>>,
}

impl StaticProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the result returned for a target from now on
    pub fn set(&self, target_id: &str, passed: bool) {
        self.results.lock().insert(target_id.to_string(), passed);
    }

    /// Number of probes issued against a target
    pub fn probe_count(&self, target_id: &str) -> usize {
        self.counts.lock().get(target_id).copied().unwrap_or(0)
    }
}

impl HealthProber for StaticProber {
    fn probe(&self, target: &Target, _check: &HealthCheck) -> ProbeResult {
        *self.counts.lock().entry(target.id().to_string()).or_insert(0) += 1;
        match self.results.lock().get(target.id()) {
            Some(true) => ProbeResult::Passed,
            Some(false) => ProbeResult::failed("scripted failure"),
            None => ProbeResult::failed("no scripted result"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{IpAddr, Ipv4Addr, TcpListener};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::health::StatusMatcher;
    use crate::target::{InstanceTarget, IpTarget, Target};
    use crate::types::Protocol;

    fn http_check() -> HealthCheck {
        HealthCheck::default()
            .with_protocol(Protocol::Http)
            .with_path("/health")
            .with_timeout(Duration::from_secs(2))
    }

    fn local_target(port: u16) -> Target {
        Target::resolve(
            IpTarget::new(IpAddr::V4(Ipv4Addr::LOCALHOST)).with_port(port).into(),
            None,
        )
    }

    /// Answer one request with the given status line and an empty body
    fn serve_once(status: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 512];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                status
            );
            let _ = stream.write_all(response.as_bytes());
        });
        port
    }

    fn tcp_check() -> HealthCheck {
        HealthCheck::default()
            .with_protocol(Protocol::Tcp)
            .with_timeout(Duration::from_secs(2))
    }

    #[test]
    fn test_tcp_prober_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = Target::resolve(
            IpTarget::new(IpAddr::V4(Ipv4Addr::LOCALHOST)).with_port(port).into(),
            None,
        );
        assert!(TcpProber::new().probe(&target, &tcp_check()).is_pass());
    }

    #[test]
    fn test_tcp_prober_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let target = Target::resolve(
            IpTarget::new(IpAddr::V4(Ipv4Addr::LOCALHOST)).with_port(port).into(),
            None,
        );
        assert!(!TcpProber::new().probe(&target, &tcp_check()).is_pass());
    }

    #[test]
    fn test_probe_without_address_fails() {
        let target = Target::resolve(InstanceTarget::new("i-0abc").into(), Some(80));
        let result = TcpProber::new().probe(&target, &tcp_check());
        assert!(matches!(result, ProbeResult::Failed { .. }));
    }

    #[test]
    fn test_http_prober_passes_on_200() {
        let port = serve_once("200 OK");
        let result = HttpProber::new().probe(&local_target(port), &http_check());
        assert_eq!(result, ProbeResult::Passed);
    }

    #[test]
    fn test_http_prober_fails_on_503() {
        let port = serve_once("503 Service Unavailable");
        let result = HttpProber::new().probe(&local_target(port), &http_check());
        match result {
            ProbeResult::Failed { reason } => assert!(reason.contains("503"), "{}", reason),
            ProbeResult::Passed => panic!("503 should fail the default matcher"),
        }
    }

    #[test]
    fn test_http_prober_matcher_range() {
        let port = serve_once("204 No Content");
        let result = HttpProber::new().probe(&local_target(port), &http_check());
        assert!(!result.is_pass());

        let port = serve_once("204 No Content");
        let check = http_check().with_matcher(StatusMatcher::parse("200-299").unwrap());
        assert!(HttpProber::new().probe(&local_target(port), &check).is_pass());
    }

    #[test]
    fn test_http_prober_times_out_on_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(5));
            drop(stream);
        });

        let check = http_check().with_timeout(Duration::from_millis(300));
        let started = Instant::now();
        let result = HttpProber::new().probe(&local_target(port), &check);
        assert!(!result.is_pass());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_static_prober() {
        let prober = StaticProber::new();
        let target = Target::resolve(InstanceTarget::new("i-1").into(), Some(80));
        assert!(!prober.probe(&target, &tcp_check()).is_pass());
        prober.set(target.id(), true);
        assert!(prober.probe(&target, &tcp_check()).is_pass());
        assert_eq!(prober.probe_count(target.id()), 2);
    }
}
