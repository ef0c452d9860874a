//! DNS query filtering module.
//!
//! Provides ad-blocking functionality by matching queried names against
//! a blocklist of known ad/tracking domains, plus the parsing rules for
//! blocklist files (plain domain lists and hosts files).

mod blocklist;

pub use blocklist::Blocklist;

use std::borrow::Cow;

/// Longest textual domain name accepted (RFC 1035, without the root dot).
const MAX_DOMAIN_LEN: usize = 253;
/// Longest single label.
const MAX_LABEL_LEN: usize = 63;

/// Addresses that mark a hosts-file line as a sink entry.
const SINK_ADDRESSES: &[&str] = &["0.0.0.0", "127.0.0.1", "::", "::1", "0:0:0:0:0:0:0:0"];

/// Hosts-file names that are never blocklist entries.
const LOCAL_NAMES: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "local",
    "broadcasthost",
    "ip6-localhost",
    "ip6-loopback",
];

/// Normalize and validate a domain for insertion into the blocklist.
///
/// Lowercases, strips a single trailing dot and checks label syntax.
/// Returns `None` for anything that is not a plausible ASCII host name.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let domain = raw.trim();
    let domain = domain.strip_suffix('.').unwrap_or(domain);

    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
        return None;
    }

    let valid = domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    });

    valid.then(|| domain.to_ascii_lowercase())
}

/// Cheap normalization for names taken off the wire.
///
/// Only borrows when the name is already lowercase without a trailing dot,
/// which is the common case on the hot path.
pub(crate) fn fold_query_name(name: &str) -> Cow<'_, str> {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.bytes().any(|b| b.is_ascii_uppercase()) {
        Cow::Owned(name.to_ascii_lowercase())
    } else {
        Cow::Borrowed(name)
    }
}

/// Extract the candidate domains named by one blocklist line.
///
/// Handles plain `domain` lines and hosts-file `0.0.0.0 domain [domain...]`
/// lines. Comments (`#` to end of line) and blank lines yield nothing.
/// Candidates are returned raw; validate them with [`normalize_domain`].
pub fn parse_line(line: &str) -> Vec<&str> {
    let line = line.split('#').next().unwrap_or_default().trim();
    if line.is_empty() {
        return Vec::new();
    }

    let mut tokens = line.split_whitespace();
    let first = tokens.next().unwrap_or_default();

    if SINK_ADDRESSES.contains(&first) {
        return tokens
            .filter(|name| !LOCAL_NAMES.contains(&name.to_ascii_lowercase().as_str()))
            .collect();
    }

    // A single token is a plain domain; anything else is passed through
    // whole and rejected by validation.
    vec![line]
}
