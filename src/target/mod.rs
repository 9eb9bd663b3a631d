//! Targets and target groups.
//!
//! Targets describe themselves through `Attachable`, the same way load
//! balancer target constructs attach themselves to a group. A
//! `TargetGroup` owns registration, health state and selection; the
//! `TargetGroupRegistry` is the arena listeners reference groups through.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::types::TargetType;

mod group;
mod registry;
mod stickiness;

pub use group::{
    DrainTicket, InFlightGuard, LoadBalancingAlgorithm, Selection, TargetGroup,
    TargetGroupOptions, TargetHealthDescription, DEFAULT_DEREGISTRATION_DELAY,
    MAX_DEREGISTRATION_DELAY, MAX_STICKINESS_DURATION,
};
pub use registry::TargetGroupRegistry;
pub use stickiness::{SetCookie, GROUP_COOKIE, TARGET_COOKIE};

pub(crate) use stickiness::{decode_binding, encode_binding};

/// How a target describes itself to a group
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetDescriptor {
    Instance {
        instance_id: String,
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

impl TargetDescriptor {
    pub fn target_type(&self) -> TargetType {
        match self {
            TargetDescriptor::Instance { .. } => TargetType::Instance,
            TargetDescriptor::Ip { .. } => TargetType::Ip,
            TargetDescriptor::Lambda { .. } => TargetType::Lambda,
            TargetDescriptor::Alb { .. } => TargetType::Alb,
        }
    }

    fn port(&self) -> Option<u16> {
        match self {
            TargetDescriptor::Instance { port, .. } | TargetDescriptor::Ip { port, .. } => *port,
            TargetDescriptor::Lambda { .. } => None,
            TargetDescriptor::Alb { port, .. } => Some(*port),
        }
    }
}

/// Capability interface: a target decides how it is described to a group
pub trait Attachable {
    fn describe(&self) -> TargetDescriptor;
}

impl Attachable for TargetDescriptor {
    fn describe(&self) -> TargetDescriptor {
        self.clone()
    }
}

/// EC2-style instance, addressed by id
#[derive(Debug, Clone)]
pub struct InstanceTarget {
    instance_id: String,
    port: Option<u16>,
    private_ip: Option<IpAddr>,
}

impl InstanceTarget {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            port: None,
            private_ip: None,
        }
    }

    /// Override the group's traffic port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Address used by health probes
    pub fn with_private_ip(mut self, ip: IpAddr) -> Self {
        self.private_ip = Some(ip);
        self
    }
}

impl Attachable for InstanceTarget {
    fn describe(&self) -> TargetDescriptor {
        TargetDescriptor::Instance {
            instance_id: self.instance_id.clone(),
            port: self.port,
            private_ip: self.private_ip,
        }
    }
}

/// IP address target. An availability zone of "all" marks an address
/// outside the load balancer's network.
#[derive(Debug, Clone)]
pub struct IpTarget {
    address: IpAddr,
    port: Option<u16>,
    availability_zone: Option<String>,
}

impl IpTarget {
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            port: None,
            availability_zone: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_availability_zone(mut self, zone: impl Into<String>) -> Self {
        self.availability_zone = Some(zone.into());
        self
    }
}

impl Attachable for IpTarget {
    fn describe(&self) -> TargetDescriptor {
        TargetDescriptor::Ip {
            address: self.address,
            port: self.port,
            availability_zone: self.availability_zone.clone(),
        }
    }
}

/// Function target, invoked rather than connected to
#[derive(Debug, Clone)]
pub struct LambdaTarget {
    function_arn: String,
}

impl LambdaTarget {
    pub fn new(function_arn: impl Into<String>) -> Self {
        Self {
            function_arn: function_arn.into(),
        }
    }
}

impl Attachable for LambdaTarget {
    fn describe(&self) -> TargetDescriptor {
        TargetDescriptor::Lambda {
            function_arn: self.function_arn.clone(),
        }
    }
}

/// Another application load balancer behind a network load balancer
#[derive(Debug, Clone)]
pub struct AlbTarget {
    alb_arn: String,
    port: u16,
}

impl AlbTarget {
    pub fn new(alb_arn: impl Into<String>, port: u16) -> Self {
        Self {
            alb_arn: alb_arn.into(),
            port,
        }
    }
}

impl Attachable for AlbTarget {
    fn describe(&self) -> TargetDescriptor {
        TargetDescriptor::Alb {
            alb_arn: self.alb_arn.clone(),
            port: self.port,
        }
    }
}

macro_rules! impl_into_descriptor {
    ($($ty:ty),*) => {
        $(impl From<$ty> for TargetDescriptor {
            fn from(t: $ty) -> Self {
                t.describe()
            }
        })*
    };
}

impl_into_descriptor!(InstanceTarget, IpTarget, LambdaTarget, AlbTarget);

/// A registered target: descriptor plus the effective traffic port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    id: String,
    descriptor: TargetDescriptor,
    port: Option<u16>,
}

impl Target {
    /// Resolve a descriptor against the group's default port.
    /// Function targets never carry a port.
    pub fn resolve(descriptor: TargetDescriptor, default_port: Option<u16>) -> Self {
        let port = match descriptor {
            TargetDescriptor::Lambda { .. } => None,
            _ => descriptor.port().or(default_port),
        };
        let base = match &descriptor {
            TargetDescriptor::Instance { instance_id, .. } => instance_id.clone(),
            TargetDescriptor::Ip { address, .. } => address.to_string(),
            TargetDescriptor::Lambda { function_arn } => function_arn.clone(),
            TargetDescriptor::Alb { alb_arn, .. } => alb_arn.clone(),
        };
        let id = match (&descriptor, port) {
            (TargetDescriptor::Ip { address, .. }, Some(p)) => SocketAddr::new(*address, p).to_string(),
            (_, Some(p)) => format!("{}:{}", base, p),
            (_, None) => base,
        };
        Self {
            id,
            descriptor,
            port,
        }
    }

    /// Unique id within a group: identity plus port
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn descriptor(&self) -> &TargetDescriptor {
        &self.descriptor
    }

    pub fn target_type(&self) -> TargetType {
        self.descriptor.target_type()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Network address, when the target has one
    pub fn address(&self) -> Option<IpAddr> {
        match &self.descriptor {
            TargetDescriptor::Ip { address, .. } => Some(*address),
            TargetDescriptor::Instance { private_ip, .. } => *private_ip,
            _ => None,
        }
    }

    /// Socket address for dispatch, when both address and port are known
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.address()?, self.port?))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Reported health of a registered target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetState {
    /// Registered, initial probe pending
    Initial,
    Healthy,
    Unhealthy,
    /// Deregistered, waiting for the deregistration delay to elapse
    Draining,
    /// The group is not referenced by any listener
    Unused,
    /// Health checks are disabled for the group
    Unavailable,
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetState::Initial => "initial",
            TargetState::Healthy => "healthy",
            TargetState::Unhealthy => "unhealthy",
            TargetState::Draining => "draining",
            TargetState::Unused => "unused",
            TargetState::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use super::*;

    #[test]
    fn test_target_ids() {
        let t = Target::resolve(InstanceTarget::new("i-0abc").into(), Some(80));
        assert_eq!(t.id(), "i-0abc:80");
        assert_eq!(t.port(), Some(80));

        let t = Target::resolve(InstanceTarget::new("i-0abc").with_port(8080).into(), Some(80));
        assert_eq!(t.id(), "i-0abc:8080");

        let t = Target::resolve(IpTarget::new(IpAddr::V6(Ipv6Addr::LOCALHOST)).into(), Some(443));
        assert_eq!(t.id(), "[::1]:443");
        assert_eq!(t.socket_addr(), Some("[::1]:443".parse().unwrap()));

        let arn = "arn:aws:lambda:us-east-1:123:function:f";
        let t = Target::resolve(LambdaTarget::new(arn).into(), Some(80));
        assert_eq!(t.id(), arn);
        assert_eq!(t.port(), None);
        assert_eq!(t.target_type(), TargetType::Lambda);

        let t = Target::resolve(AlbTarget::new("arn:alb/x", 80).into(), None);
        assert_eq!(t.id(), "arn:alb/x:80");
        assert_eq!(t.address(), None);
    }

    #[test]
    fn test_attachable_describes_type() {
        let ip = IpTarget::new("10.0.0.1".parse().unwrap()).with_availability_zone("all");
        match ip.describe() {
            TargetDescriptor::Ip {
                availability_zone, ..
            } => assert_eq!(availability_zone.as_deref(), Some("all")),
            other => panic!("unexpected descriptor {:?}", other),
        }
        assert_eq!(LambdaTarget::new("f").describe().target_type(), TargetType::Lambda);
        assert_eq!(AlbTarget::new("a", 80).describe().target_type(), TargetType::Alb);
    }
}
