use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use crate::types::TargetGroupId;

/// Cookie binding a client to a target group (forward-level stickiness)
pub const GROUP_COOKIE: &str = "lb-tg";
/// Cookie binding a client to a target (group-level stickiness)
pub const TARGET_COOKIE: &str = "lb-target";

/// Cookie the caller must set on the response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    pub max_age: Duration,
}

impl SetCookie {
    /// Render as a Set-Cookie header value
    pub fn header_value(&self) -> String {
        format!(
            "{}={}; Max-Age={}; Path=/; HttpOnly",
            self.name,
            self.value,
            self.max_age.as_secs()
        )
    }
}

/// Decoded cookie payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Binding {
    pub group: TargetGroupId,
    pub target: Option<String>,
    pub expires_at: u64,
}

impl Binding {
    pub fn is_live(&self, now: SystemTime) -> bool {
        unix_secs(now) < self.expires_at
    }
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Encode "group|target|expiry" as URL-safe base64
pub(crate) fn encode_binding(
    group: TargetGroupId,
    target: Option<&str>,
    now: SystemTime,
    ttl: Duration,
) -> String {
    let expires_at = unix_secs(now).saturating_add(ttl.as_secs());
    let raw = format!("{}|{}|{}", group.0, target.unwrap_or(""), expires_at);
    URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

/// Decode a cookie value. Anything malformed is ignored by callers.
pub(crate) fn decode_binding(value: &str) -> Option<Binding> {
    let bytes = URL_SAFE_NO_PAD.decode(value).ok()?;
    let raw = String::from_utf8(bytes).ok()?;
    let mut parts = raw.splitn(3, '|');
    let group = parts.next()?.parse::<u32>().ok()?;
    let target = parts.next()?;
    let expires_at = parts.next()?.parse::<u64>().ok()?;
    Some(Binding {
        group: TargetGroupId(group),
        target: if target.is_empty() {
            None
        } else {
            Some(target.to_string())
        },
        expires_at,
    })
}
