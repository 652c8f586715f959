//! Tunnel specifications
//!
//! Parses `[bindAddress:]localPort:remoteHost:remotePort` rules and validates
//! an ordered set of them before any listener is opened.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ssh::SshError;

/// Default local bind address for tunnels without an explicit one
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

/// One local-forward rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
    /// Local address to bind to (e.g., "127.0.0.1")
    #[serde(default = "default_bind_address")]
    pub local_bind_address: String,
    /// Local port; 0 lets the OS pick one
    pub local_port: u16,
    /// Host to reach, as resolved by the gateway
    pub remote_host: String,
    /// Port to reach on `remote_host`
    pub remote_port: u16,
}

fn default_bind_address() -> String {
    DEFAULT_BIND_ADDRESS.to_string()
}

impl TunnelSpec {
    pub fn new(
        local_bind_address: impl Into<String>,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            local_bind_address: local_bind_address.into(),
            local_port,
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    /// Parse a rule, using `default_bind` when no bind address is given
    pub fn parse(input: &str, default_bind: &str) -> Result<Self, SshError> {
        let input = input.trim();
        let fields = split_fields(input)?;

        let (bind, local_port, remote_host, remote_port) = match fields.as_slice() {
            [_] | [_, _] => {
                return Err(SshError::Configuration(format!(
                    "tunnel '{}' is missing its remote part, expected localPort:remoteHost:remotePort",
                    input
                )))
            }
            [local, host, port] => (default_bind, local.as_str(), host.as_str(), port.as_str()),
            [bind, local, host, port] => (bind.as_str(), local.as_str(), host.as_str(), port.as_str()),
            _ => {
                return Err(SshError::Configuration(format!(
                    "tunnel '{}' has too many fields (IPv6 addresses must be bracketed)",
                    input
                )))
            }
        };

        let spec = Self {
            local_bind_address: bind.to_string(),
            local_port: parse_port(input, "local", local_port)?,
            remote_host: remote_host.to_string(),
            remote_port: parse_port(input, "remote", remote_port)?,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Check a single rule in isolation
    pub fn validate(&self) -> Result<(), SshError> {
        if self.local_bind_address.is_empty() {
            return Err(SshError::Configuration(format!(
                "tunnel {} has an empty bind address",
                self
            )));
        }
        if self.remote_host.is_empty() {
            return Err(SshError::Configuration(format!(
                "tunnel {} has an empty remote host",
                self
            )));
        }
        if self.remote_port == 0 {
            return Err(SshError::Configuration(format!(
                "tunnel {} has remote port 0",
                self
            )));
        }
        Ok(())
    }

    /// Local `host:port` string suitable for binding
    pub fn local_addr(&self) -> String {
        join_host_port(&self.local_bind_address, self.local_port)
    }

    /// Remote `host:port` string, for logging
    pub fn remote_addr(&self) -> String {
        join_host_port(&self.remote_host, self.remote_port)
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local_addr(), self.remote_addr())
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn parse_port(input: &str, which: &str, value: &str) -> Result<u16, SshError> {
    value.parse::<u16>().map_err(|_| {
        SshError::Configuration(format!(
            "tunnel '{}' has an invalid {} port '{}'",
            input, which, value
        ))
    })
}

/// Split on ':' outside of `[...]`, dropping the brackets
fn split_fields(input: &str) -> Result<Vec<String>, SshError> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_brackets = false;

    for c in input.chars() {
        match c {
            '[' if !in_brackets && current.is_empty() => in_brackets = true,
            ']' if in_brackets => in_brackets = false,
            ':' if !in_brackets => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }

    if in_brackets {
        return Err(SshError::Configuration(format!(
            "tunnel '{}' has an unclosed '['",
            input
        )));
    }
    fields.push(current);

    if fields.iter().any(|f| f.is_empty()) {
        return Err(SshError::Configuration(format!(
            "tunnel '{}' has an empty field",
            input
        )));
    }
    Ok(fields)
}

/// Ordered, validated set of tunnel rules
#[derive(Debug, Clone)]
pub struct TunnelSet {
    specs: Vec<TunnelSpec>,
}

impl TunnelSet {
    /// Validate rules; duplicate bind:port pairs are rejected (port 0 is exempt)
    pub fn new(specs: Vec<TunnelSpec>) -> Result<Self, SshError> {
        if specs.is_empty() {
            return Err(SshError::Configuration("no tunnels configured".to_string()));
        }

        let mut seen = HashSet::new();
        for spec in &specs {
            spec.validate()?;
            if spec.local_port == 0 {
                continue;
            }
            let key = (spec.local_bind_address.to_lowercase(), spec.local_port);
            if !seen.insert(key) {
                return Err(SshError::Configuration(format!(
                    "duplicate local listener {}",
                    spec.local_addr()
                )));
            }
        }

        Ok(Self { specs })
    }

    /// Parse and validate textual rules
    pub fn parse<S: AsRef<str>>(rules: &[S], default_bind: &str) -> Result<Self, SshError> {
        let specs = rules
            .iter()
            .map(|r| TunnelSpec::parse(r.as_ref(), default_bind))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(specs)
    }

    pub fn specs(&self) -> &[TunnelSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_three_fields() {
        let spec = TunnelSpec::parse("18080:db:5432", DEFAULT_BIND_ADDRESS).unwrap();
        assert_eq!(spec.local_bind_address, "127.0.0.1");
        assert_eq!(spec.local_port, 18080);
        assert_eq!(spec.remote_host, "db");
        assert_eq!(spec.remote_port, 5432);
        assert_eq!(spec.to_string(), "127.0.0.1:18080 -> db:5432");
    }

    #[test]
    fn test_parse_with_bind_address() {
        let spec = TunnelSpec::parse("0.0.0.0:8080:svc:80", DEFAULT_BIND_ADDRESS).unwrap();
        assert_eq!(spec.local_bind_address, "0.0.0.0");
        assert_eq!(spec.local_port, 8080);
    }

    #[test]
    fn test_parse_ipv6() {
        let spec = TunnelSpec::parse("[::1]:8080:[fe80::1]:22", DEFAULT_BIND_ADDRESS).unwrap();
        assert_eq!(spec.local_bind_address, "::1");
        assert_eq!(spec.remote_host, "fe80::1");
        assert_eq!(spec.local_addr(), "[::1]:8080");
        assert_eq!(spec.remote_addr(), "[fe80::1]:22");
    }

    #[test]
    fn test_missing_remote_part_rejected() {
        for input in ["8080", "8080:db"] {
            let err = TunnelSpec::parse(input, DEFAULT_BIND_ADDRESS).unwrap_err();
            assert!(matches!(err, SshError::Configuration(_)), "{input}");
        }
    }

    #[test]
    fn test_bad_ports_rejected() {
        assert!(TunnelSpec::parse("http:db:5432", DEFAULT_BIND_ADDRESS).is_err());
        assert!(TunnelSpec::parse("8080:db:70000", DEFAULT_BIND_ADDRESS).is_err());
        assert!(TunnelSpec::parse("8080:db:0", DEFAULT_BIND_ADDRESS).is_err());
        assert!(TunnelSpec::parse("8080::5432", DEFAULT_BIND_ADDRESS).is_err());
        assert!(TunnelSpec::parse("[::1:8080:db:1", DEFAULT_BIND_ADDRESS).is_err());
    }

    #[test]
    fn test_duplicate_bind_rejected() {
        let err = TunnelSet::parse(&["18080:svcA:80", "127.0.0.1:18080:svcB:443"], "127.0.0.1")
            .unwrap_err();
        assert!(matches!(err, SshError::Configuration(ref m) if m.contains("duplicate")));
    }

    #[test]
    fn test_same_port_different_bind_allowed() {
        let set = TunnelSet::parse(&["127.0.0.1:18080:a:80", "127.0.0.2:18080:b:80"], "127.0.0.1")
            .unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_ephemeral_ports_not_duplicates() {
        let set = TunnelSet::parse(&["0:a:80", "0:b:80"], "127.0.0.1").unwrap();
        assert_eq!(set.specs()[1].remote_host, "b");
    }

    #[test]
    fn test_empty_set_rejected() {
        assert!(TunnelSet::new(Vec::new()).is_err());
    }
}
