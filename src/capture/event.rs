//! Network events produced by the capture recorder.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transport of a captured event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Dns,
    Icmp,
    Other,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Dns => "dns",
            Protocol::Icmp => "icmp",
            Protocol::Other => "other",
        };
        f.write_str(name)
    }
}

/// One outbound network access observed during the capture window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEvent {
    pub timestamp: DateTime<Utc>,
    /// Destination host name when known, otherwise the address as text.
    pub host: String,
    /// Concrete destination address, if one was observed or resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<IpAddr>,
    pub port: u16,
    pub protocol: Protocol,
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
}

impl NetworkEvent {
    /// The destination resolved to a concrete address.
    pub fn is_resolved(&self) -> bool {
        self.address.is_some() || self.host.parse::<IpAddr>().is_ok()
    }

    /// Placeholder event for a capture line that could not be parsed.
    pub fn unparsed(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            host: String::new(),
            address: None,
            port: 0,
            protocol: Protocol::Other,
            bytes: 0,
            process: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_resolved() {
        let mut event = NetworkEvent::unparsed(Utc::now());
        assert!(!event.is_resolved());

        event.host = "93.184.216.34".to_string();
        assert!(event.is_resolved());

        event.host = "example.com".to_string();
        assert!(!event.is_resolved());
        event.address = Some("93.184.216.34".parse().unwrap());
        assert!(event.is_resolved());
    }

    #[test]
    fn test_serialization_omits_empty_fields() {
        let event = NetworkEvent {
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            host: "example.com".to_string(),
            address: None,
            port: 443,
            protocol: Protocol::Tcp,
            bytes: 60,
            process: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("address"));
        assert!(!json.contains("process"));
        assert!(json.contains("\"protocol\":\"tcp\""));
    }
}
