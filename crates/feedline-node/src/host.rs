use std::fmt;

use feedline_transport::PeerId;
use regex::Regex;

/// Host criterion of an access rule.
#[derive(Debug, Clone)]
pub enum HostMatcher {
    /// Exact host name, compared case-insensitively.
    Name(String),
    /// Exact textual address.
    Addr(String),
    /// Expression tried against the address, then the name.
    Regex(Regex),
}

impl HostMatcher {
    /// Builds a matcher from rule text. Text with regex metacharacters
    /// other than `.` is an expression; a dotted quad is an address;
    /// anything else is a host name.
    pub fn parse(text: &str) -> Result<Self, regex::Error> {
        if text.chars().any(|c| "^$*+?()[]{}|\\".contains(c)) {
            return Regex::new(text).map(HostMatcher::Regex);
        }
        if !text.is_empty() && text.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return Ok(HostMatcher::Addr(text.to_string()));
        }
        Ok(HostMatcher::Name(text.to_ascii_lowercase()))
    }

    pub fn matches(&self, peer: &PeerId) -> bool {
        match self {
            HostMatcher::Name(name) => peer.name.eq_ignore_ascii_case(name),
            HostMatcher::Addr(addr) => peer.addr == *addr,
            HostMatcher::Regex(regex) => regex.is_match(&peer.addr) || regex.is_match(&peer.name),
        }
    }
}

impl fmt::Display for HostMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostMatcher::Name(name) => f.write_str(name),
            HostMatcher::Addr(addr) => f.write_str(addr),
            HostMatcher::Regex(regex) => f.write_str(regex.as_str()),
        }
    }
}
