//! Sliding-window rate limiting with per-agent concurrency slots.
//!
//! Counters are keyed by `agent:<id>` and `domain:<name>`. Each key owns its
//! own mutex, so requests for different agents or domains never contend and
//! requests for the same key never lose an update.
//!
//! # Evaluation Order
//!
//! `check_limit` evaluates five limits and reports the first one exceeded:
//!
//! 1. agent concurrency
//! 2. agent requests per minute
//! 3. agent requests per hour
//! 4. domain requests per minute
//! 5. domain requests per hour
//!
//! A passing check records one hit on both keys and reserves a concurrency
//! slot for the agent in the same critical section. The result carries the
//! slot's [`SlotId`]; [`RateLimiter::release`] frees exactly that slot, while
//! [`RateLimiter::complete`] frees the agent's oldest one. A slot that is
//! never released (the caller went away) is reclaimed once it is older than
//! the configured slot timeout, and a late release of it is then a no-op.

use crate::policy::{PolicyEngine, RateLimits};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// How many checks run between sweeps of idle keys.
const SWEEP_EVERY: u64 = 512;

/// Default lifetime of an unreleased concurrency slot.
pub const DEFAULT_SLOT_TIMEOUT: Duration = Duration::from_secs(120);

/// Hit timestamps for one key over the last hour.
#[derive(Debug, Default)]
struct Window {
    hits: VecDeque<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.hits.front() {
            if now.duration_since(oldest) >= HOUR {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    fn count_within(&self, now: Instant, span: Duration) -> u32 {
        let n = self
            .hits
            .iter()
            .rev()
            .take_while(|&&t| now.duration_since(t) < span)
            .count();
        u32::try_from(n).unwrap_or(u32::MAX)
    }

    fn hour_count(&self) -> u32 {
        u32::try_from(self.hits.len()).unwrap_or(u32::MAX)
    }
}

/// Handle on one reserved concurrency slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u64);

#[derive(Debug, Default)]
struct AgentState {
    window: Window,
    /// Held concurrency slots with their reservation times, oldest first.
    slots: VecDeque<(SlotId, Instant)>,
}

impl AgentState {
    fn reclaim_slots(&mut self, now: Instant, timeout: Duration) -> usize {
        let before = self.slots.len();
        while let Some(&(_, oldest)) = self.slots.front() {
            if now.duration_since(oldest) >= timeout {
                self.slots.pop_front();
            } else {
                break;
            }
        }
        before - self.slots.len()
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// `agent:<id>:concurrent|minute|hour` or `domain:<name>:minute|hour`.
    pub exceeded_key: Option<String>,
    /// Human-readable reason.
    pub reason: String,
    /// Slot reserved by a passing check. `None` when limits are disabled.
    pub slot: Option<SlotId>,
}

impl RateLimitResult {
    fn pass(slot: Option<SlotId>) -> Self {
        Self {
            allowed: true,
            exceeded_key: None,
            reason: "Within rate limits".to_string(),
            slot,
        }
    }

    fn exceeded(key: String, limit: u32) -> Self {
        Self {
            allowed: false,
            reason: format!("Rate limit exceeded for {key} (limit {limit})"),
            exceeded_key: Some(key),
            slot: None,
        }
    }
}

/// Current counters for one agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateUsage {
    /// Requests in the last 60 seconds.
    pub minute: u32,
    /// Requests in the last hour.
    pub hour: u32,
    /// Reserved concurrency slots.
    pub concurrent: u32,
}

/// Rate limiter shared by every request of one proxy instance.
pub struct RateLimiter {
    policy: Arc<PolicyEngine>,
    agents: DashMap<String, Arc<Mutex<AgentState>>>,
    domains: DashMap<String, Arc<Mutex<Window>>>,
    slot_timeout: Duration,
    checks: AtomicU64,
    next_slot: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter governed by the engine's effective rate limits.
    pub fn new(policy: Arc<PolicyEngine>) -> Self {
        Self::with_slot_timeout(policy, DEFAULT_SLOT_TIMEOUT)
    }

    /// Create a limiter with a custom slot reclaim timeout.
    pub fn with_slot_timeout(policy: Arc<PolicyEngine>, slot_timeout: Duration) -> Self {
        Self {
            policy,
            agents: DashMap::new(),
            domains: DashMap::new(),
            slot_timeout,
            checks: AtomicU64::new(0),
            next_slot: AtomicU64::new(0),
        }
    }

    /// Age after which an unreleased slot is reclaimed.
    pub fn slot_timeout(&self) -> Duration {
        self.slot_timeout
    }

    /// Check all limits and, on success, record the hit and reserve a slot.
    pub fn check_limit(&self, agent_id: &str, domain: &str) -> RateLimitResult {
        self.check_limit_at(agent_id, domain, Instant::now())
    }

    pub(crate) fn check_limit_at(&self, agent_id: &str, domain: &str, now: Instant) -> RateLimitResult {
        let limits = self.policy.effective_rate_limits();
        if !limits.enabled {
            return RateLimitResult::pass(None);
        }
        let domain = domain.to_lowercase();
        let domain = domain.as_str();

        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep(now);
        }

        // Clone both handles before locking so no map shard is held while a
        // key mutex is held. Lock order is always agent, then domain.
        let agent_cell = self.agent_cell(agent_id);
        let domain_cell = self.domain_cell(domain);

        let mut agent = agent_cell.lock();
        let mut dom = domain_cell.lock();

        agent.window.prune(now);
        dom.prune(now);
        let reclaimed = agent.reclaim_slots(now, self.slot_timeout);
        if reclaimed > 0 {
            debug!(agent_id, reclaimed, "Reclaimed abandoned concurrency slots");
        }

        if let Some(result) = Self::first_exceeded(&limits, agent_id, domain, &agent, &dom, now) {
            trace!(agent_id, domain, key = ?result.exceeded_key, "Rate limit exceeded");
            return result;
        }

        agent.window.hits.push_back(now);
        dom.hits.push_back(now);
        let slot = SlotId(self.next_slot.fetch_add(1, Ordering::Relaxed));
        agent.slots.push_back((slot, now));
        RateLimitResult::pass(Some(slot))
    }

    fn first_exceeded(
        limits: &RateLimits,
        agent_id: &str,
        domain: &str,
        agent: &AgentState,
        dom: &Window,
        now: Instant,
    ) -> Option<RateLimitResult> {
        let per_agent = limits.per_agent;
        let per_domain = limits.per_domain;

        let concurrent = u32::try_from(agent.slots.len()).unwrap_or(u32::MAX);
        let checks = [
            (concurrent, per_agent.max_concurrent, "agent", agent_id, "concurrent"),
            (
                agent.window.count_within(now, MINUTE),
                per_agent.requests_per_minute,
                "agent",
                agent_id,
                "minute",
            ),
            (agent.window.hour_count(), per_agent.requests_per_hour, "agent", agent_id, "hour"),
            (
                dom.count_within(now, MINUTE),
                per_domain.requests_per_minute,
                "domain",
                domain,
                "minute",
            ),
            (dom.hour_count(), per_domain.requests_per_hour, "domain", domain, "hour"),
        ];

        checks
            .into_iter()
            .find(|(used, limit, ..)| used >= limit)
            .map(|(_, limit, scope, id, window)| {
                RateLimitResult::exceeded(format!("{scope}:{id}:{window}"), limit)
            })
    }

    /// Release one concurrency slot for the agent. Never goes below zero.
    pub fn complete(&self, agent_id: &str, domain: &str) {
        if let Some(cell) = self.agents.get(agent_id).map(|c| Arc::clone(c.value())) {
            let released = cell.lock().slots.pop_front().is_some();
            trace!(agent_id, domain, released, "Concurrency slot completed");
        }
    }

    /// Release one specific slot. Returns false when it is no longer held,
    /// for instance because it was reclaimed after the slot timeout.
    pub fn release(&self, agent_id: &str, slot: SlotId) -> bool {
        let Some(cell) = self.agents.get(agent_id).map(|c| Arc::clone(c.value())) else {
            return false;
        };
        let mut state = cell.lock();
        let Some(index) = state.slots.iter().position(|(held, _)| *held == slot) else {
            trace!(agent_id, ?slot, "Slot already reclaimed");
            return false;
        };
        state.slots.remove(index);
        true
    }

    /// Current counters for an agent.
    pub fn get_usage(&self, agent_id: &str) -> RateUsage {
        self.usage_at(agent_id, Instant::now())
    }

    pub(crate) fn usage_at(&self, agent_id: &str, now: Instant) -> RateUsage {
        let Some(cell) = self.agents.get(agent_id).map(|c| Arc::clone(c.value())) else {
            return RateUsage::default();
        };
        let mut state = cell.lock();
        state.window.prune(now);
        state.reclaim_slots(now, self.slot_timeout);
        RateUsage {
            minute: state.window.count_within(now, MINUTE),
            hour: state.window.hour_count(),
            concurrent: u32::try_from(state.slots.len()).unwrap_or(u32::MAX),
        }
    }

    /// Number of tracked keys (agents plus domains).
    pub fn tracked_keys(&self) -> usize {
        self.agents.len() + self.domains.len()
    }

    /// Drop keys with no hits in the last hour and no held slots.
    ///
    /// An entry is only removed while the map is its sole owner, so a check
    /// that already holds the handle never writes to a detached window.
    pub fn sweep(&self, now: Instant) {
        let timeout = self.slot_timeout;
        self.agents.retain(|_, cell| {
            if Arc::strong_count(cell) > 1 {
                return true;
            }
            let mut state = cell.lock();
            state.window.prune(now);
            state.reclaim_slots(now, timeout);
            !(state.window.hits.is_empty() && state.slots.is_empty())
        });
        self.domains.retain(|_, cell| {
            if Arc::strong_count(cell) > 1 {
                return true;
            }
            let mut window = cell.lock();
            window.prune(now);
            !window.hits.is_empty()
        });
    }

    fn agent_cell(&self, agent_id: &str) -> Arc<Mutex<AgentState>> {
        if let Some(cell) = self.agents.get(agent_id) {
            return Arc::clone(cell.value());
        }
        Arc::clone(self.agents.entry(agent_id.to_string()).or_default().value())
    }

    fn domain_cell(&self, domain: &str) -> Arc<Mutex<Window>> {
        if let Some(cell) = self.domains.get(domain) {
            return Arc::clone(cell.value());
        }
        Arc::clone(self.domains.entry(domain.to_string()).or_default().value())
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("agents", &self.agents.len())
            .field("domains", &self.domains.len())
            .field("slot_timeout", &self.slot_timeout)
            .finish()
    }
}
