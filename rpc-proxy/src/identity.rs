// Derives the key used to bucket rate-limit state per caller.
//
// Proxy headers are checked in a fixed order before the transport peer
// address. Only values that parse as an IP address are accepted. When nothing
// usable is found the identity is a digest of User-Agent, Referer and the
// current time, so unrelated unknown callers never share a bucket.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use http::header::{HeaderMap, HeaderName, REFERER, USER_AGENT};
use sha2::{Digest, Sha256};
use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

pub type ClientIdentity = String;

const FALLBACK_TOKEN_LEN: usize = 16;

/// Candidate headers in priority order. The flag marks comma separated lists
/// where only the left-most (client-most) entry is considered.
static CANDIDATE_HEADERS: [(HeaderName, bool); 4] = [
    (HeaderName::from_static("cf-connecting-ip"), false),
    (HeaderName::from_static("x-real-ip"), false),
    (HeaderName::from_static("x-forwarded-for"), true),
    (HeaderName::from_static("x-client-ip"), false),
];

pub fn resolve_identity(
    headers: &HeaderMap,
    peer_addr: Option<SocketAddr>,
    now: SystemTime,
) -> ClientIdentity {
    let mut unreadable = false;

    for (name, is_list) in &CANDIDATE_HEADERS {
        let Some(value) = headers.get(name) else {
            continue;
        };
        let Ok(value) = value.to_str() else {
            unreadable = true;
            continue;
        };
        let value = match *is_list {
            true => value.split(',').next().unwrap_or_default(),
            false => value,
        };
        if let Some(ip) = parse_ip(value) {
            return ip.to_string();
        }
    }

    if let Some(peer) = peer_addr {
        return peer.ip().to_canonical().to_string();
    }

    let prefix = if unreadable { "error" } else { "unknown" };
    format!("{prefix}-{}", fallback_token(headers, now))
}

/// Parses a trimmed IPv4 or IPv6 address. IPv4-mapped IPv6 addresses are
/// folded to IPv4 so both spellings share one bucket.
fn parse_ip(value: &str) -> Option<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .ok()
        .map(|ip| ip.to_canonical())
}

fn fallback_token(headers: &HeaderMap, now: SystemTime) -> String {
    let nanos = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    for name in [USER_AGENT, REFERER] {
        if let Some(value) = headers.get(name) {
            hasher.update(value.as_bytes());
        }
        hasher.update(b"|");
    }
    hasher.update(nanos.to_be_bytes());

    let mut token = URL_SAFE_NO_PAD.encode(hasher.finalize());
    token.truncate(FALLBACK_TOKEN_LEN);
    token
}
