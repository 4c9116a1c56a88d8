//! Network contact points.
//!
//! A contact point describes how to reach a remote node: `host:port`,
//! optionally followed by attributes, e.g.
//! `relay.example.org:21000(autoRetryInitialDelay=10, autoRetryDelayMultiplier=1.5)`.

use crate::error::SessionError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Address and attributes used to initiate a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetworkContactPoint {
    host: String,
    port: u16,
    attributes: BTreeMap<String, String>,
}

impl NetworkContactPoint {
    /// Create a contact point without attributes
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            attributes: BTreeMap::new(),
        }
    }

    /// Add an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Host name or address
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// All attributes
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// One attribute value
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// `host:port` form suitable for dialing
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for NetworkContactPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())?;
        if !self.attributes.is_empty() {
            let attrs: Vec<String> = self
                .attributes
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, "({})", attrs.join(", "))?;
        }
        Ok(())
    }
}

impl FromStr for NetworkContactPoint {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SessionError::InvalidContactPoint(s.to_string());
        let s = s.trim();

        let (address, attr_part) = match s.find('(') {
            Some(open) => {
                let rest = s[open + 1..].strip_suffix(')').ok_or_else(invalid)?;
                (s[..open].trim(), Some(rest))
            }
            None => (s, None),
        };

        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.trim().parse().map_err(|_| invalid())?;

        let mut contact_point = NetworkContactPoint::new(host, port);
        if let Some(attrs) = attr_part {
            for entry in attrs.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                let (key, value) = entry.split_once('=').ok_or_else(invalid)?;
                let key = key.trim();
                if key.is_empty() {
                    return Err(invalid());
                }
                contact_point
                    .attributes
                    .insert(key.to_string(), value.trim().to_string());
            }
        }
        Ok(contact_point)
    }
}

impl TryFrom<String> for NetworkContactPoint {
    type Error = SessionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NetworkContactPoint> for String {
    fn from(value: NetworkContactPoint) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain() {
        let cp: NetworkContactPoint = "localhost:21000".parse().unwrap();
        assert_eq!(cp.host(), "localhost");
        assert_eq!(cp.port(), 21000);
        assert!(cp.attributes().is_empty());
        assert_eq!(cp.to_string(), "localhost:21000");
    }

    #[test]
    fn test_parse_attributes() {
        let cp: NetworkContactPoint =
            "10.0.0.5:21000(autoRetryInitialDelay=10, autoRetryDelayMultiplier = 1.5)"
                .parse()
                .unwrap();
        assert_eq!(cp.attribute("autoRetryInitialDelay"), Some("10"));
        assert_eq!(cp.attribute("autoRetryDelayMultiplier"), Some("1.5"));
        assert_eq!(
            cp.to_string(),
            "10.0.0.5:21000(autoRetryDelayMultiplier=1.5, autoRetryInitialDelay=10)"
        );
    }

    #[test]
    fn test_parse_ipv6() {
        let cp: NetworkContactPoint = "[::1]:9000".parse().unwrap();
        assert_eq!(cp.host(), "::1");
        assert_eq!(cp.address(), "[::1]:9000");
    }

    #[test]
    fn test_parse_invalid() {
        for input in ["localhost", ":80", "host:notaport", "host:80(key)", "host:80(a=1"] {
            assert!(
                input.parse::<NetworkContactPoint>().is_err(),
                "accepted {}",
                input
            );
        }
    }
}
