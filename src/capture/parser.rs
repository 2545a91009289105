//! Parser for `tcpdump -l -n -tt` text output.
//!
//! Only outbound traffic from the sandbox becomes a [`NetworkEvent`]. DNS
//! lookups are held until their answer arrives so the event carries both the
//! queried name and the resolved address; later connections to that address
//! are labelled with the name.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::capture::event::{NetworkEvent, Protocol};

static PACKET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<ts>\d+\.\d+)\s+(?:\S+\s+(?P<dir>In|Out|M|B|P)\s+)?(?P<family>IP6?)\s+(?P<src>\S+)\s+>\s+(?P<dst>\S+):\s*(?P<rest>.*)$",
    )
    .expect("valid packet regex")
});

/// Timestamped frames that are not IP and so carry no destination host.
static LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\d+\.\d+\s+(?:\S+\s+(?:In|Out|M|B|P)\s+)?(?:ARP|RARP|STP|LLDP|CDP|IPX|LOOP|ethertype\s|llc\s|802\.1)",
    )
    .expect("valid link regex")
});

static DNS_QUERY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<id>\d+)\+?(?:\s+\[[^\]]*\])?\s+(?:A|AAAA|CNAME|MX|TXT|SRV|ANY|PTR|NS|SOA|HTTPS|SVCB)\?\s+(?P<name>\S+)\s+\((?P<len>\d+)\)",
    )
    .expect("valid dns query regex")
});

static DNS_RESPONSE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<id>\d+)\S*\s+(?:(?P<rcode>[A-Z][A-Za-z]+)\S*\s+)?(?:q:\s+\S+\s+\S+\s+)?\d+/\d+/\d+\s*(?P<answers>.*?)\s*\((?P<len>\d+)\)$",
    )
    .expect("valid dns response regex")
});

static LENGTH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"length (?P<len>\d+)").expect("valid length regex"));

static FLAGS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Flags \[(?P<flags>[^\]]*)\]").expect("valid flags regex"));

/// Status lines tcpdump prints around a capture.
const TCPDUMP_CHATTER: &[&str] = &[
    "tcpdump:",
    "listening on",
    "packets captured",
    "packets received by filter",
    "packets dropped by kernel",
];

/// Result of feeding one line to the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// Zero or more completed events.
    Events(Vec<NetworkEvent>),
    /// Recognised but irrelevant (inbound traffic, status chatter, non-IP frames).
    Ignored,
    /// Not understood. Must be preserved, never dropped.
    Unparsed,
}

#[derive(Debug, Clone)]
struct PendingQuery {
    timestamp: DateTime<Utc>,
    name: String,
    port: u16,
    bytes: u64,
}

/// Stateful tcpdump line parser.
#[derive(Debug, Default)]
pub struct TcpdumpParser {
    sandbox_addresses: Vec<IpAddr>,
    names: HashMap<IpAddr, String>,
    pending: HashMap<u16, PendingQuery>,
}

impl TcpdumpParser {
    /// Create a parser for a guest with the given addresses. Direction comes
    /// from tcpdump's `In`/`Out` marker when the line has one, otherwise from
    /// whether the source is one of these addresses. With none, every
    /// unmarked packet counts as outbound.
    pub fn new(sandbox_addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            sandbox_addresses: sandbox_addresses.into_iter().collect(),
            ..Default::default()
        }
    }

    fn is_outbound(&self, direction: Option<&str>, src: IpAddr) -> bool {
        match direction {
            Some("Out") => true,
            Some("In") => false,
            _ if self.sandbox_addresses.is_empty() => true,
            _ => self.sandbox_addresses.contains(&src),
        }
    }

    pub fn parse_line(&mut self, line: &str) -> ParseOutcome {
        let line = line.trim();
        if line.is_empty() {
            return ParseOutcome::Ignored;
        }

        let Some(caps) = PACKET_RE.captures(line) else {
            if TCPDUMP_CHATTER.iter().any(|marker| line.contains(marker)) {
                return ParseOutcome::Ignored;
            }
            if LINK_RE.is_match(line) && parse_timestamp(line_prefix(line)).is_some() {
                return ParseOutcome::Ignored;
            }
            return ParseOutcome::Unparsed;
        };

        let Some(timestamp) = parse_timestamp(&caps["ts"]) else {
            return ParseOutcome::Unparsed;
        };
        let (Some((src, src_port)), Some((dst, dst_port))) =
            (split_endpoint(&caps["src"]), split_endpoint(&caps["dst"]))
        else {
            return ParseOutcome::Unparsed;
        };
        let rest = &caps["rest"];

        if !self.is_outbound(caps.name("dir").map(|d| d.as_str()), src) {
            if src_port == 53 {
                return self.handle_dns_response(rest);
            }
            return ParseOutcome::Ignored;
        }

        if dst.is_loopback() {
            return ParseOutcome::Ignored;
        }

        if dst_port == 53 {
            if let Some(query) = DNS_QUERY_RE.captures(rest) {
                let Ok(id) = query["id"].parse::<u16>() else {
                    return ParseOutcome::Unparsed;
                };
                self.pending.insert(
                    id,
                    PendingQuery {
                        timestamp,
                        name: query["name"].trim_end_matches('.').to_lowercase(),
                        port: dst_port,
                        bytes: query["len"].parse().unwrap_or(0),
                    },
                );
                return ParseOutcome::Events(Vec::new());
            }
        }

        let (protocol, bytes) = if let Some(flags) = FLAGS_RE.captures(rest) {
            let bytes = length_of(rest);
            let syn = &flags["flags"] == "S";
            // Bare ACKs and teardown segments add noise, not destinations.
            if !syn && bytes == 0 {
                return ParseOutcome::Ignored;
            }
            (Protocol::Tcp, bytes)
        } else if rest.starts_with("UDP") || dst_port == 53 {
            (Protocol::Udp, length_of(rest))
        } else if rest.starts_with("ICMP") {
            (Protocol::Icmp, length_of(rest))
        } else {
            (Protocol::Other, length_of(rest))
        };

        let host = self
            .names
            .get(&dst)
            .cloned()
            .unwrap_or_else(|| dst.to_string());

        ParseOutcome::Events(vec![NetworkEvent {
            timestamp,
            host,
            address: Some(dst),
            port: dst_port,
            protocol,
            bytes,
            process: None,
        }])
    }

    /// Emit lookups that never received an answer. Called once at the end of capture.
    pub fn finish(&mut self) -> Vec<NetworkEvent> {
        let mut events: Vec<NetworkEvent> = self
            .pending
            .drain()
            .map(|(_, query)| dns_event(query, None))
            .collect();
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.host.cmp(&b.host)));
        events
    }

    fn handle_dns_response(&mut self, rest: &str) -> ParseOutcome {
        let Some(caps) = DNS_RESPONSE_RE.captures(rest) else {
            return ParseOutcome::Ignored;
        };
        let Some(query) = caps["id"]
            .parse::<u16>()
            .ok()
            .and_then(|id| self.pending.remove(&id))
        else {
            return ParseOutcome::Ignored;
        };

        let answers = parse_answers(&caps["answers"]);
        for addr in &answers {
            self.names.insert(*addr, query.name.clone());
        }

        ParseOutcome::Events(vec![dns_event(query, answers.first().copied())])
    }
}

fn dns_event(query: PendingQuery, address: Option<IpAddr>) -> NetworkEvent {
    NetworkEvent {
        timestamp: query.timestamp,
        host: query.name,
        address,
        port: query.port,
        protocol: Protocol::Dns,
        bytes: query.bytes,
        process: None,
    }
}

fn line_prefix(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or("")
}

/// Parse an epoch timestamp with fractional seconds (`1700000000.123456`).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = raw.split_once('.').unwrap_or((raw, "0"));
    let secs: i64 = secs.parse().ok()?;
    if frac.is_empty() || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let mut digits: String = frac.chars().take(9).collect();
    while digits.len() < 9 {
        digits.push('0');
    }
    let nanos: u32 = digits.parse().ok()?;
    DateTime::from_timestamp(secs, nanos)
}

/// Split `10.0.2.15.41234` or `2606:4700::1.443` into address and port.
fn split_endpoint(raw: &str) -> Option<(IpAddr, u16)> {
    if let Ok(addr) = raw.parse::<IpAddr>() {
        return Some((addr, 0));
    }
    let (addr, port) = raw.rsplit_once('.')?;
    let addr = addr.parse::<IpAddr>().ok()?;
    let port = port.parse::<u16>().ok()?;
    Some((addr, port))
}

fn length_of(rest: &str) -> u64 {
    LENGTH_RE
        .captures(rest)
        .and_then(|c| c["len"].parse().ok())
        .unwrap_or(0)
}

fn parse_answers(answers: &str) -> Vec<IpAddr> {
    answers
        .split(',')
        .filter_map(|answer| {
            let tokens: Vec<&str> = answer.split_whitespace().collect();
            tokens
                .iter()
                .position(|t| *t == "A" || *t == "AAAA")
                .and_then(|i| tokens.get(i + 1))
                .and_then(|addr| addr.parse::<IpAddr>().ok())
        })
        .collect()
}
