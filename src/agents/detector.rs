//! Agent identification.
//!
//! An agent is identified either from headers a local SDK sends
//! (`x-rashomon-agent-*`, trusted because the proxy only listens on
//! loopback) or by resolving the process that owns the client end of the
//! connection. Lookups are cached per source port and bounded in how many
//! processes they inspect; a miss yields `None`, never a stall.

use super::procfs::{ProcFs, SystemProcFs, TCP_ESTABLISHED, parse_proc_net_tcp};
use crate::policy::{AgentProfile, DomainGlobs, PolicyEngine};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// How long a port lookup stays cached.
pub const CONNECTION_CACHE_TTL: Duration = Duration::from_secs(5);

/// Upper bound on process directories inspected per lookup.
pub const DEFAULT_MAX_PROCESSES: usize = 4096;

const MAX_FDS_PER_PROCESS: usize = 4096;
const MAX_CACHED_PORTS: usize = 1024;
pub const UNKNOWN_AGENT_ID: &str = "unknown";
pub const UNKNOWN_AGENT_NAME: &str = "unknown-agent";

/// Source of the current time, injectable for tests.
pub type Clock = Arc<dyn Fn() -> Instant + Send + Sync>;

/// Lifecycle state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Inactive,
    Killed,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Killed => "killed",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "killed" => Ok(Self::Killed),
            other => Err(format!("unknown agent status '{other}'")),
        }
    }
}

/// How an agent's identity was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    /// Identification headers.
    Declared,
    /// Owner of the client socket.
    Process,
    /// Neither was available.
    Unresolved,
}

/// The process owning one end of a local TCP connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionProcess {
    pub pid: u32,
    pub name: String,
    pub path: String,
    pub source_port: u16,
}

/// Identity headers sent by a local SDK.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclaredIdentity {
    pub id: String,
    pub name: Option<String>,
    pub process_name: Option<String>,
    pub pid: Option<u32>,
    pub purpose: Option<String>,
}

/// An identified agent together with the profile settings that apply to it.
#[derive(Debug, Clone)]
pub struct DetectedAgent {
    pub id: String,
    pub name: String,
    pub process_name: String,
    pub process_path: Option<String>,
    pub pid: Option<u32>,
    pub declared_purpose: Option<String>,
    pub status: AgentStatus,
    pub matched_profile: Option<String>,
    pub allowed_domains_extra: DomainGlobs,
    pub max_body_bytes: u64,
    pub detected_at: DateTime<Utc>,
    pub source: IdentitySource,
}

impl DetectedAgent {
    /// Whether the unknown-agent rules govern this agent: it neither
    /// declared itself nor matched a profile.
    pub fn is_unknown(&self) -> bool {
        self.source != IdentitySource::Declared && self.matched_profile.is_none()
    }
}

/// Stable id for a detected process.
pub fn process_identity(pid: u32, name: &str, path: &str) -> String {
    let digest = Sha256::digest(format!("{pid}:{name}:{path}").as_bytes());
    format!("agent-{}", &hex::encode(digest)[..16])
}

struct CachedLookup {
    expires_at: Instant,
    value: Option<ConnectionProcess>,
}

/// Resolves agent identities.
pub struct AgentDetector {
    policy: Arc<PolicyEngine>,
    procfs: Arc<dyn ProcFs>,
    proc_root: PathBuf,
    cache: Mutex<HashMap<u16, CachedLookup>>,
    ttl: Duration,
    max_processes: usize,
    clock: Clock,
}

impl AgentDetector {
    /// Detector over the host's `/proc`.
    pub fn new(policy: Arc<PolicyEngine>) -> Self {
        Self::with_procfs(policy, Arc::new(SystemProcFs), "/proc")
    }

    /// Detector over an arbitrary process filesystem rooted at `proc_root`.
    pub fn with_procfs(
        policy: Arc<PolicyEngine>,
        procfs: Arc<dyn ProcFs>,
        proc_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            policy,
            procfs,
            proc_root: proc_root.into(),
            cache: Mutex::new(HashMap::new()),
            ttl: CONNECTION_CACHE_TTL,
            max_processes: DEFAULT_MAX_PROCESSES,
            clock: Arc::new(Instant::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_max_processes(mut self, max: usize) -> Self {
        self.max_processes = max;
        self
    }

    /// Process owning the client end of a connection from `source_port`.
    ///
    /// Results, including misses, are cached for five seconds. Concurrent
    /// misses may both resolve; the later insert wins and both values are
    /// equivalent.
    pub fn get_process_for_connection(&self, source_port: u16) -> Option<ConnectionProcess> {
        if source_port == 0 {
            return None;
        }

        let now = (self.clock)();
        if let Some(hit) = self.cache.lock().get(&source_port)
            && hit.expires_at > now
        {
            trace!(port = source_port, "Connection lookup served from cache");
            return hit.value.clone();
        }

        let value = self.resolve(source_port);

        let mut cache = self.cache.lock();
        if cache.len() >= MAX_CACHED_PORTS {
            cache.retain(|_, entry| entry.expires_at > now);
        }
        cache.insert(
            source_port,
            CachedLookup {
                expires_at: now + self.ttl,
                value: value.clone(),
            },
        );
        value
    }

    fn resolve(&self, source_port: u16) -> Option<ConnectionProcess> {
        let inode = self.socket_inode(source_port)?;
        let target = PathBuf::from(format!("socket:[{inode}]"));

        let entries = self.procfs.read_dir_names(&self.proc_root).ok()?;
        let pids = entries
            .iter()
            .filter(|name| !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()))
            .take(self.max_processes);

        for pid_dir in pids {
            let fd_dir = self.proc_root.join(pid_dir).join("fd");
            let Ok(fds) = self.procfs.read_dir_names(&fd_dir) else {
                continue;
            };
            let owns_socket = fds
                .iter()
                .take(MAX_FDS_PER_PROCESS)
                .any(|fd| self.procfs.read_link(&fd_dir.join(fd)).is_ok_and(|l| l == target));
            if !owns_socket {
                continue;
            }

            let Ok(pid) = pid_dir.parse::<u32>() else {
                continue;
            };
            let found = self.describe_process(pid, pid_dir, source_port);
            debug!(port = source_port, pid, name = %found.name, "Resolved connection owner");
            return Some(found);
        }

        trace!(port = source_port, inode, "No process owns socket");
        None
    }

    fn socket_inode(&self, source_port: u16) -> Option<u64> {
        for (table, is_ipv6) in [("tcp", false), ("tcp6", true)] {
            let path = self.proc_root.join("net").join(table);
            let Ok(content) = self.procfs.read_to_string(&path) else {
                continue;
            };
            if let Some(entry) = parse_proc_net_tcp(&content, is_ipv6)
                .into_iter()
                .find(|e| e.local.port() == source_port && e.state == TCP_ESTABLISHED)
            {
                return Some(entry.inode);
            }
        }
        None
    }

    fn describe_process(&self, pid: u32, pid_dir: &str, source_port: u16) -> ConnectionProcess {
        let dir = self.proc_root.join(pid_dir);
        let path = self
            .procfs
            .read_link(&dir.join("exe"))
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let comm = self
            .procfs
            .read_to_string(&dir.join("comm"))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        let name = if !comm.is_empty() {
            comm
        } else if let Some(base) = Path::new(&path).file_name() {
            base.to_string_lossy().into_owned()
        } else {
            format!("pid-{pid}")
        };
        let path = if path.is_empty() { name.clone() } else { path };

        ConnectionProcess {
            pid,
            name,
            path,
            source_port,
        }
    }

    /// Agent for a resolved connection owner.
    pub fn agent_for_process(&self, process: &ConnectionProcess) -> DetectedAgent {
        let snapshot = self.policy.snapshot();
        let profile = snapshot
            .policy
            .agent_profile_for(&process.name, &process.path);
        let unknown = snapshot.policy.agents.unknown_agent;

        DetectedAgent {
            id: process_identity(process.pid, &process.name, &process.path),
            name: profile
                .map(|p| p.name.clone())
                .unwrap_or_else(|| UNKNOWN_AGENT_NAME.to_string()),
            process_name: process.name.clone(),
            process_path: Some(process.path.clone()),
            pid: Some(process.pid),
            declared_purpose: None,
            status: AgentStatus::Active,
            matched_profile: profile.map(|p| p.name.clone()),
            allowed_domains_extra: extras(profile),
            max_body_bytes: profile.map_or(unknown.max_body_bytes, |p| p.max_body_bytes),
            detected_at: Utc::now(),
            source: IdentitySource::Process,
        }
    }

    /// Agent for an SDK-declared identity. The declared name or process name
    /// selects the profile.
    pub fn declared_agent(&self, declared: &DeclaredIdentity) -> DetectedAgent {
        let snapshot = self.policy.snapshot();
        let name = declared.name.clone().unwrap_or_else(|| declared.id.clone());
        let process_name = declared.process_name.clone().unwrap_or_else(|| name.clone());
        let profile = snapshot
            .policy
            .profile_named(&name)
            .or_else(|| snapshot.policy.agent_profile_for(&process_name, ""));
        let unknown = snapshot.policy.agents.unknown_agent;

        DetectedAgent {
            id: declared.id.clone(),
            name,
            process_name,
            process_path: None,
            pid: declared.pid,
            declared_purpose: declared.purpose.clone(),
            status: AgentStatus::Active,
            matched_profile: profile.map(|p| p.name.clone()),
            allowed_domains_extra: extras(profile),
            max_body_bytes: profile.map_or(unknown.max_body_bytes, |p| p.max_body_bytes),
            detected_at: Utc::now(),
            source: IdentitySource::Declared,
        }
    }

    /// Placeholder identity when nothing could be resolved.
    pub fn unknown_agent(&self) -> DetectedAgent {
        let unknown = self.policy.snapshot().policy.agents.unknown_agent;
        DetectedAgent {
            id: UNKNOWN_AGENT_ID.to_string(),
            name: UNKNOWN_AGENT_NAME.to_string(),
            process_name: UNKNOWN_AGENT_NAME.to_string(),
            process_path: None,
            pid: None,
            declared_purpose: None,
            status: AgentStatus::Active,
            matched_profile: None,
            allowed_domains_extra: DomainGlobs::default(),
            max_body_bytes: unknown.max_body_bytes,
            detected_at: Utc::now(),
            source: IdentitySource::Unresolved,
        }
    }
}

fn extras(profile: Option<&AgentProfile>) -> DomainGlobs {
    profile
        .map(|p| p.allowed_domains_extra.clone())
        .unwrap_or_default()
}

impl fmt::Debug for AgentDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentDetector")
            .field("proc_root", &self.proc_root)
            .field("ttl", &self.ttl)
            .field("max_processes", &self.max_processes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::procfs::MemoryProcFs;
    use crate::policy::{AgentProfileSpec, PolicyDocument};

    const TCP_HEADER: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode";

    fn engine() -> Arc<PolicyEngine> {
        let mut doc = PolicyDocument::default();
        doc.agents.profiles.push(AgentProfileSpec {
            name: "build-bot".into(),
            process_patterns: vec!["buildbot".into()],
            allowed_domains_extra: vec!["*.ci.example.com".into()],
            max_body_bytes: Some(2048),
        });
        Arc::new(PolicyEngine::from_documents(vec![("agents".into(), doc)]))
    }

    fn claude_procfs() -> MemoryProcFs {
        MemoryProcFs::new()
            .with_file(
                "/proc/net/tcp",
                format!("{TCP_HEADER}\n   0: 0100007F:8AE1 0100007F:22B8 01 00000000:00000000 00:00000000 00000000   100        0 12345 1 0000000000000000 20 4 30 10 -1"),
            )
            .with_file("/proc/net/tcp6", TCP_HEADER)
            .with_file("/proc/4242/comm", "claude\n")
            .with_dir("/proc", ["4242", "self", "net"])
            .with_dir("/proc/4242/fd", ["0", "1", "2", "7"])
            .with_link("/proc/4242/fd/7", "socket:[12345]")
            .with_link("/proc/4242/exe", "/usr/local/bin/claude")
    }

    struct ManualClock {
        base: Instant,
        offset_ms: Mutex<u64>,
    }

    impl ManualClock {
        fn set(&self, ms: u64) {
            *self.offset_ms.lock() = ms;
        }

        fn now(&self) -> Instant {
            self.base + Duration::from_millis(*self.offset_ms.lock())
        }
    }

    #[test]
    fn test_resolves_process_and_caches_for_five_seconds() {
        let fs = Arc::new(claude_procfs());
        let clock = Arc::new(ManualClock {
            base: Instant::now(),
            offset_ms: Mutex::new(1_000),
        });
        let clock_ref = Arc::clone(&clock);
        let detector = AgentDetector::with_procfs(engine(), fs.clone(), "/proc")
            .with_clock(Arc::new(move || clock_ref.now()));

        let first = detector.get_process_for_connection(35553).unwrap();
        assert_eq!(
            first,
            ConnectionProcess {
                pid: 4242,
                name: "claude".into(),
                path: "/usr/local/bin/claude".into(),
                source_port: 35553,
            }
        );
        assert_eq!(fs.file_reads(), 2);

        clock.set(5_500);
        assert_eq!(detector.get_process_for_connection(35553).unwrap().pid, 4242);
        assert_eq!(fs.file_reads(), 2);

        clock.set(6_500);
        assert_eq!(detector.get_process_for_connection(35553).unwrap().pid, 4242);
        assert_eq!(fs.file_reads(), 4);
    }

    #[test]
    fn test_unowned_connection_is_none() {
        let fs = Arc::new(
            MemoryProcFs::new()
                .with_file("/proc/net/tcp", TCP_HEADER)
                .with_file("/proc/net/tcp6", TCP_HEADER)
                .with_dir("/proc", Vec::<String>::new()),
        );
        let detector = AgentDetector::with_procfs(engine(), fs, "/proc");
        assert_eq!(detector.get_process_for_connection(9999), None);
        assert_eq!(detector.get_process_for_connection(0), None);
    }

    #[test]
    fn test_search_is_bounded() {
        let fs = Arc::new(claude_procfs().with_dir("/proc", ["1", "2", "4242"]));
        let detector = AgentDetector::with_procfs(engine(), fs, "/proc").with_max_processes(2);
        assert_eq!(detector.get_process_for_connection(35553), None);
    }

    #[test]
    fn test_agent_for_process_matches_builtin_profile() {
        let detector = AgentDetector::with_procfs(engine(), Arc::new(MemoryProcFs::new()), "/proc");
        let process = ConnectionProcess {
            pid: 4242,
            name: "claude".into(),
            path: "/usr/local/bin/claude".into(),
            source_port: 35553,
        };
        let agent = detector.agent_for_process(&process);

        assert_eq!(agent.matched_profile.as_deref(), Some("claude-code"));
        assert_eq!(agent.id, process_identity(4242, "claude", "/usr/local/bin/claude"));
        assert!(agent.id.starts_with("agent-"));
        assert_eq!(agent.id.len(), "agent-".len() + 16);
        assert!(!agent.is_unknown());
    }

    #[test]
    fn test_unmatched_process_uses_unknown_rules() {
        let detector = AgentDetector::with_procfs(engine(), Arc::new(MemoryProcFs::new()), "/proc");
        let process = ConnectionProcess {
            pid: 7,
            name: "curl".into(),
            path: "/usr/bin/curl".into(),
            source_port: 40000,
        };
        let agent = detector.agent_for_process(&process);
        assert!(agent.is_unknown());
        assert_eq!(agent.name, "unknown-agent");
        assert_eq!(agent.max_body_bytes, 1024 * 1024);
    }

    #[test]
    fn test_declared_agent_selects_profile_by_name() {
        let detector = AgentDetector::with_procfs(engine(), Arc::new(MemoryProcFs::new()), "/proc");
        let agent = detector.declared_agent(&DeclaredIdentity {
            id: "bot-1".into(),
            name: Some("build-bot".into()),
            purpose: Some("nightly build".into()),
            ..Default::default()
        });
        assert_eq!(agent.id, "bot-1");
        assert_eq!(agent.matched_profile.as_deref(), Some("build-bot"));
        assert_eq!(agent.max_body_bytes, 2048);
        assert!(agent.allowed_domains_extra.matches("api.ci.example.com"));
        assert_eq!(agent.source, IdentitySource::Declared);
        assert!(!agent.is_unknown());
    }

    #[test]
    fn test_unknown_agent() {
        let detector = AgentDetector::with_procfs(engine(), Arc::new(MemoryProcFs::new()), "/proc");
        let agent = detector.unknown_agent();
        assert!(agent.is_unknown());
        assert_eq!(agent.id, "unknown");
    }
}
