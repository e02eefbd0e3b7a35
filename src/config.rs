//! Client configuration.
//!
//! Assembled by the CLI front end and validated once before the core
//! starts; validation failures are configuration errors (exit code 1).

use std::net::SocketAddr;

use crate::dns::{Name, RecordType};
use crate::Error;

/// Everything the core needs to run one tunnel session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Tunnel domain all queries live under. Root is allowed for `--ping`
    /// against a resolver that is itself the tunnel server.
    pub domain: Name,

    /// Upstream recursive resolver.
    pub server: SocketAddr,

    /// Carrier record types, used round-robin.
    pub record_types: Vec<RecordType>,

    /// Session name shown in the server's session list.
    pub name: Option<String>,

    /// File to request from the server.
    pub download: Option<String>,

    /// Starting chunk of the download; implies chunked framing.
    pub chunk: Option<u32>,

    /// Speak the framed command sub-protocol on the stream.
    pub command: bool,
}

impl ClientConfig {
    pub fn new(domain: Name, server: SocketAddr) -> Self {
        ClientConfig {
            domain,
            server,
            record_types: vec![RecordType::Txt],
            name: None,
            download: None,
            chunk: None,
            command: false,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.chunk.is_some() && self.download.is_none() {
            return Err(Error::Config(
                "--chunk can only be used with --download".to_string(),
            ));
        }
        if self.record_types.is_empty() {
            return Err(Error::Config(
                "at least one carrier record type is required".to_string(),
            ));
        }
        if let Some(unusable) = self
            .record_types
            .iter()
            .find(|t| matches!(t, RecordType::Unknown(_)))
        {
            return Err(Error::Config(format!(
                "{} cannot carry tunnel payloads",
                unusable
            )));
        }
        if crate::carrier::max_payload(&self.domain) == 0 {
            return Err(Error::Config(format!(
                "domain {} leaves no room for payload in a query name",
                self.domain
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig::new(
            Name::parse("t.example.com").unwrap(),
            "10.0.0.53:53".parse().unwrap(),
        )
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_chunk_requires_download() {
        let mut c = config();
        c.chunk = Some(3);
        assert!(c.validate().is_err());

        c.download = Some("/etc/motd".to_string());
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_record_types_must_be_carriers() {
        let mut c = config();
        c.record_types = vec![];
        assert!(c.validate().is_err());

        c.record_types = vec![RecordType::Unknown(99)];
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_domain_must_leave_payload_room() {
        // 253 wire bytes: a legal name, but the salt label alone overflows.
        let label = "a".repeat(63);
        let tail = "a".repeat(59);
        let long = [label.as_str(), label.as_str(), label.as_str(), tail.as_str()].join(".");
        let mut c = config();
        c.domain = Name::parse(&long).unwrap();
        assert!(c.validate().is_err());
    }
}
