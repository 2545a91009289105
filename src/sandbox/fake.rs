//! In-memory hypervisor and packet source for tests.
//!
//! The fake VM keeps a tiny "disk" (path → content) that snapshots copy and
//! rollbacks restore, and turns a small command vocabulary into tcpdump
//! lines on the live capture:
//!
//! - `fetch <host> [port] [bytes]`: DNS lookup (for names) then a TCP connection
//! - `resolve-fail <host>`: a lookup answered with NXDomain
//! - `stale <host>`: a connection stamped one hour in the past
//! - `garbage <text>`: an unparsable capture line
//! - `install-beacon <host>`: persist something that phones home whenever capture starts
//! - `write <path> [content]`: create a file on the disk
//! - `exit <code>`, `sleep <ms>`, `echo <text>`
//! - `crash-capture`: the capture process dies mid-run
//! - `git clone <url> ...`: a connection to the URL's host
//!
//! Anything else succeeds silently. A `cd <dir> && ` prefix is ignored.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::capture::PacketSource;
use crate::error::{CaptureError, InspectorError};
use crate::sandbox::{CommandOutput, Hypervisor};
use crate::utils::split_args;

/// Address the fake VM uses as the source of its traffic.
pub const FAKE_ADDRESS: &str = "10.0.2.15";

/// Address of the fake VM's DNS resolver.
pub const FAKE_RESOLVER: &str = "10.0.2.3";

const BEACON_DIR: &str = "/etc/beacons/";

#[derive(Default)]
struct VmState {
    disk: BTreeMap<String, String>,
    snapshots: HashMap<String, BTreeMap<String, String>>,
    live: Option<mpsc::UnboundedSender<String>>,
    calls: Vec<String>,
    next_dns_id: u16,
    next_port: u16,
}

impl VmState {
    fn record(&mut self, call: impl Into<String>) {
        self.calls.push(call.into());
    }

    fn emit(&mut self, lines: Vec<String>) {
        if let Some(live) = &self.live {
            for line in lines {
                if live.send(line).is_err() {
                    self.live = None;
                    break;
                }
            }
        }
    }

    fn connection_lines(&mut self, at: DateTime<Utc>, host: &str, port: u16, bytes: u64) -> Vec<String> {
        let ts = format_ts(at);
        self.next_port = self.next_port.wrapping_add(1);
        let src_port = 40000 + (self.next_port % 20000);
        let mut lines = Vec::new();

        let dst = match host.parse::<IpAddr>() {
            Ok(addr) => addr.to_string(),
            Err(_) => {
                let addr = fake_address_for(host);
                self.next_dns_id = self.next_dns_id.wrapping_add(1);
                let id = self.next_dns_id;
                lines.push(format!(
                    "{} IP {}.{} > {}.53: {}+ A? {}. ({})",
                    ts, FAKE_ADDRESS, src_port, FAKE_RESOLVER, id, host, host.len() + 18
                ));
                lines.push(format!(
                    "{} IP {}.53 > {}.{}: {} 1/0/0 A {} ({})",
                    ts, FAKE_RESOLVER, FAKE_ADDRESS, src_port, id, addr, host.len() + 34
                ));
                addr
            }
        };

        lines.push(format!(
            "{} IP {}.{} > {}.{}: Flags [S], seq 1, win 64240, length 0",
            ts, FAKE_ADDRESS, src_port, dst, port
        ));
        if bytes > 0 {
            lines.push(format!(
                "{} IP {}.{} > {}.{}: Flags [P.], seq 1:{}, ack 1, win 502, length {}",
                ts,
                FAKE_ADDRESS,
                src_port,
                dst,
                port,
                bytes + 1,
                bytes
            ));
        }
        lines
    }

    fn nxdomain_lines(&mut self, at: DateTime<Utc>, host: &str) -> Vec<String> {
        let ts = format_ts(at);
        self.next_dns_id = self.next_dns_id.wrapping_add(1);
        let id = self.next_dns_id;
        vec![
            format!(
                "{} IP {}.53000 > {}.53: {}+ A? {}. ({})",
                ts, FAKE_ADDRESS, FAKE_RESOLVER, id, host, host.len() + 18
            ),
            format!(
                "{} IP {}.53 > {}.53000: {} NXDomain 0/1/0 ({})",
                ts, FAKE_RESOLVER, FAKE_ADDRESS, id, host.len() + 90
            ),
        ]
    }
}

fn format_ts(at: DateTime<Utc>) -> String {
    format!("{}.{:06}", at.timestamp(), at.timestamp_subsec_micros())
}

/// Deterministic documentation-range address for a host name.
fn fake_address_for(host: &str) -> String {
    let sum = host
        .bytes()
        .fold(7u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    format!("203.0.113.{}", sum % 254 + 1)
}

fn host_of_url(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let rest = rest.rsplit_once('@').map(|(_, host)| host).unwrap_or(rest);
    let host = rest.split(['/', ':']).next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// A scripted VM. Clones share state, so a test can keep a handle while the
/// controller owns another.
#[derive(Clone)]
pub struct FakeHypervisor {
    state: Arc<Mutex<VmState>>,
    address: IpAddr,
    fail_provision: bool,
    fail_capture_start: bool,
    fail_capture_flush: bool,
}

impl Default for FakeHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(VmState::default())),
            address: IpAddr::V4(Ipv4Addr::new(10, 0, 2, 15)),
            fail_provision: false,
            fail_capture_start: false,
            fail_capture_flush: false,
        }
    }

    /// `provision` exits non-zero.
    pub fn failing_provision(mut self) -> Self {
        self.fail_provision = true;
        self
    }

    /// The packet source cannot start.
    pub fn failing_capture_start(mut self) -> Self {
        self.fail_capture_start = true;
        self
    }

    /// The packet source reports a failure when asked to stop and flush.
    pub fn failing_capture_flush(mut self) -> Self {
        self.fail_capture_flush = true;
        self
    }

    pub fn addresses_value(&self) -> Vec<IpAddr> {
        vec![self.address]
    }

    /// Every call made against the VM, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Number of calls starting with `prefix`.
    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    /// Paths currently on the fake disk.
    pub fn disk_paths(&self) -> Vec<String> {
        self.state.lock().disk.keys().cloned().collect()
    }

    /// Traffic outside any build: delivered only if a capture is live.
    pub fn background_fetch(&self, host: &str, port: u16) {
        let mut state = self.state.lock();
        let lines = state.connection_lines(Utc::now(), host, port, 64);
        state.emit(lines);
    }

    /// Whether a capture is currently receiving traffic.
    pub fn capture_live(&self) -> bool {
        self.state.lock().live.is_some()
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    fn handle(&self) -> String {
        "fake-vm".to_string()
    }

    async fn provision(&self) -> Result<(), InspectorError> {
        self.state.lock().record("provision");
        if self.fail_provision {
            return Err(InspectorError::Provision(
                "vagrant up exited with status 1".to_string(),
            ));
        }
        Ok(())
    }

    async fn snapshot(&self, name: &str) -> Result<(), InspectorError> {
        let mut state = self.state.lock();
        state.record(format!("snapshot {}", name));
        let disk = state.disk.clone();
        state.snapshots.insert(name.to_string(), disk);
        Ok(())
    }

    async fn rollback(&self, name: &str) -> Result<(), InspectorError> {
        let mut state = self.state.lock();
        state.record(format!("rollback {}", name));
        let disk = state
            .snapshots
            .get(name)
            .cloned()
            .ok_or_else(|| InspectorError::Hypervisor(format!("no snapshot named '{}'", name)))?;
        state.disk = disk;
        Ok(())
    }

    async fn addresses(&self) -> Result<Vec<IpAddr>, InspectorError> {
        self.state.lock().record("addresses");
        Ok(vec![self.address])
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, InspectorError> {
        self.state.lock().record(format!("exec {}", command));

        let body = command.rsplit("&& ").next().unwrap_or(command);
        let args = split_args(body)
            .map_err(|e| InspectorError::Hypervisor(format!("bad fake command: {}", e)))?;
        let Some((verb, rest)) = args.split_first() else {
            return Ok(CommandOutput {
                exit_code: Some(0),
                ..Default::default()
            });
        };

        let mut output = CommandOutput {
            exit_code: Some(0),
            ..Default::default()
        };

        match verb.as_str() {
            "fetch" => {
                let host = rest.first().cloned().unwrap_or_default();
                let port = rest.get(1).and_then(|p| p.parse().ok()).unwrap_or(443);
                let bytes = rest.get(2).and_then(|b| b.parse().ok()).unwrap_or(512);
                let mut state = self.state.lock();
                let lines = state.connection_lines(Utc::now(), &host, port, bytes);
                state.emit(lines);
                output.stdout = format!("fetched {}\n", host);
            }
            "resolve-fail" => {
                let host = rest.first().cloned().unwrap_or_default();
                let mut state = self.state.lock();
                let lines = state.nxdomain_lines(Utc::now(), &host);
                state.emit(lines);
                output.exit_code = Some(6);
                output.stderr = format!("could not resolve host: {}\n", host);
            }
            "stale" => {
                let host = rest.first().cloned().unwrap_or_default();
                let at = Utc::now() - chrono::Duration::hours(1);
                let mut state = self.state.lock();
                let lines = state.connection_lines(at, &host, 443, 64);
                state.emit(lines);
            }
            "garbage" => {
                self.state.lock().emit(vec![rest.join(" ")]);
            }
            "install-beacon" => {
                let host = rest.first().cloned().unwrap_or_default();
                self.state
                    .lock()
                    .disk
                    .insert(format!("{}{}", BEACON_DIR, host), host.clone());
            }
            "write" => {
                if let Some(path) = rest.first() {
                    let content = rest[1..].join(" ");
                    self.state.lock().disk.insert(path.clone(), content);
                }
            }
            "exit" => {
                output.exit_code = rest.first().and_then(|c| c.parse().ok()).or(Some(1));
                output.stderr = "command failed\n".to_string();
            }
            "sleep" => {
                let ms = rest.first().and_then(|m| m.parse().ok()).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            "echo" => {
                output.stdout = format!("{}\n", rest.join(" "));
            }
            "crash-capture" => {
                self.state.lock().live = None;
            }
            "git" if rest.first().map(String::as_str) == Some("clone") => {
                if let Some(host) = rest.iter().skip(1).find(|a| a.contains("://")).and_then(|u| host_of_url(u)) {
                    let mut state = self.state.lock();
                    let lines = state.connection_lines(Utc::now(), &host, 443, 2048);
                    state.emit(lines);
                }
            }
            _ => {}
        }

        Ok(output)
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), InspectorError> {
        let mut state = self.state.lock();
        state.record(format!("upload {} {}", local.display(), remote));
        state
            .disk
            .insert(format!("{}/.source", remote), local.display().to_string());
        Ok(())
    }

    async fn fetch(&self, patterns: &[String], dest: &Path) -> Result<Vec<PathBuf>, InspectorError> {
        let matchers = patterns
            .iter()
            .map(|p| glob::Pattern::new(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| InspectorError::Hypervisor(e.to_string()))?;

        let files: Vec<(String, String)> = {
            let mut state = self.state.lock();
            state.record(format!("fetch {}", patterns.join(" ")));
            state
                .disk
                .iter()
                .filter(|(path, _)| matchers.iter().any(|m| m.matches(path)))
                .map(|(path, content)| (path.clone(), content.clone()))
                .collect()
        };

        let mut fetched = Vec::new();
        for (path, content) in files {
            let target = dest.join(path.trim_start_matches('/'));
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, content)?;
            fetched.push(target);
        }
        Ok(fetched)
    }

    async fn shutdown(&self) -> Result<(), InspectorError> {
        self.state.lock().record("shutdown");
        Ok(())
    }

    fn packet_source(&self, interface: &str) -> Box<dyn PacketSource> {
        self.state.lock().record(format!("capture {}", interface));
        Box::new(FakePacketSource {
            state: self.state.clone(),
            fail_open: self.fail_capture_start,
            fail_close: self.fail_capture_flush,
        })
    }
}

/// Packet source wired to a [`FakeHypervisor`]'s traffic.
pub struct FakePacketSource {
    state: Arc<Mutex<VmState>>,
    fail_open: bool,
    fail_close: bool,
}

#[async_trait]
impl PacketSource for FakePacketSource {
    async fn open(&mut self) -> Result<Box<dyn AsyncRead + Send + Unpin>, CaptureError> {
        if self.fail_open {
            return Err(CaptureError::StartFailed(
                "tcpdump: any: You don't have permission to capture on that device".to_string(),
            ));
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let (mut writer, reader) = tokio::io::duplex(64 * 1024);

        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if writer.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let mut state = self.state.lock();
        state.live = Some(tx);

        // Anything persisted on disk phones home as soon as it can.
        let beacons: Vec<String> = state
            .disk
            .iter()
            .filter(|(path, _)| path.starts_with(BEACON_DIR))
            .map(|(_, host)| host.clone())
            .collect();
        for host in beacons {
            let lines = state.connection_lines(Utc::now(), &host, 443, 128);
            state.emit(lines);
        }

        Ok(Box::new(reader))
    }

    async fn close(&mut self) -> Result<(), CaptureError> {
        self.state.lock().live = None;
        if self.fail_close {
            return Err(CaptureError::Recorder(
                "tcpdump exited with status 1 while flushing".to_string(),
            ));
        }
        Ok(())
    }
}
