//! Per-site bookkeeping: the per-backend failure window counter and the
//! decision engine that turns a stream of probe results into remediation
//! directives.
//!
//! The engine is deliberately split into two synchronous phases per cycle:
//! [`SiteRecord::update`] absorbs probe results and never emits anything,
//! [`SiteRecord::derive`] walks the resulting state and emits directives.
//! Keeping the phases apart means derivation always sees a consistent
//! snapshot and no action can re-enter the state machine.

use core::time::Duration;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;

use tracing::{debug, info};

use crate::config::SiteConfig;
use crate::probe::ProbeResult;

/// Statuses above this are treated as probe failures.
const FAILURE_THRESHOLD: u16 = 400;

/// Failure bookkeeping for one backend. Created on the first observed
/// failure, garbage-collected once the backend is healthy again.
#[derive(Debug, Clone)]
struct HostRecord {
    /// Failures observed within the current window, clamped to the site's
    /// `max_failed`.
    count: u32,
    /// End of the current failure window. A result arriving later than this
    /// resets the counter instead of accumulating.
    expire_at: Instant,
    /// Earliest instant another offline-style action may fire for this host.
    next_action_at: Option<Instant>,
    /// Earliest instant another notify-only message may fire for this host.
    next_notify_at: Option<Instant>,
    /// Most recent HTTP status, 504 for unreachable.
    last_status: u16,
}

impl HostRecord {
    fn new(status: u16, now: Instant, window: Duration) -> Self {
        Self {
            count: 1,
            expire_at: now + window,
            next_action_at: None,
            next_notify_at: None,
            last_status: status,
        }
    }

    /// The window-counter primitive: accumulate within the window, reset to
    /// the delta after it expired, always clamp to `0..=cap` and push the
    /// window forward.
    fn update(&mut self, delta: i32, now: Instant, window: Duration, cap: u32) {
        let base = if now <= self.expire_at {
            i64::from(self.count) + i64::from(delta)
        } else {
            i64::from(delta)
        };
        self.count = base.clamp(0, i64::from(cap)) as u32;
        self.expire_at = now + window;
    }

    fn is_action_due(&self, now: Instant) -> bool {
        self.next_action_at.is_none_or(|at| at <= now)
    }

    fn is_notify_due(&self, now: Instant) -> bool {
        self.next_notify_at.is_none_or(|at| at <= now)
    }
}

/// What the supervisor should do about one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DirectiveKind {
    /// Take the backend out of rotation (or re-arm its remediation if it is
    /// already out and still failing).
    Offline,
    /// The safety cap forbids another offline; operators get a message only.
    Notify,
    /// The backend recovered, bring it back into rotation.
    Online,
}

/// One emitted decision: `(kind, host, last observed status)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Directive {
    pub kind: DirectiveKind,
    pub host: String,
    pub last_status: u16,
}

/// Per-site table of [`HostRecord`]s plus the set of backends currently out
/// of rotation. Owned and mutated exclusively by the task driving the site's
/// cycles.
pub(crate) struct SiteRecord {
    name: String,
    max_failed: u32,
    window: Duration,
    cooldown: Duration,
    max_inactive: usize,
    record: HashMap<String, HostRecord>,
    inactive: HashSet<String>,
}

impl SiteRecord {
    pub(crate) fn new(config: &SiteConfig) -> Self {
        Self {
            name: config.name.clone(),
            max_failed: config.max_failed,
            window: config.duration,
            cooldown: config.auto_interval,
            max_inactive: config.max_inactive,
            record: HashMap::new(),
            inactive: HashSet::new(),
        }
    }

    /// Phase one: absorb one cycle's probe results. Never emits anything.
    pub(crate) fn update(&mut self, results: &[ProbeResult], now: Instant) {
        for result in results {
            if result.status > FAILURE_THRESHOLD {
                match self.record.entry(result.server.clone()) {
                    Entry::Vacant(vacant) => {
                        debug!(site = %self.name, server = %result.server, status = result.status,
                            "first failure observed");
                        vacant.insert(HostRecord::new(result.status, now, self.window));
                    }
                    Entry::Occupied(mut occupied) => {
                        // Offlined backends and backends already at the cap
                        // only refresh their window; the counter stays put.
                        let delta = if self.inactive.contains(&result.server)
                            || occupied.get().count >= self.max_failed
                        {
                            0
                        } else {
                            1
                        };
                        let record = occupied.get_mut();
                        record.update(delta, now, self.window, self.max_failed);
                        record.last_status = result.status;
                    }
                }
            } else if let Some(record) = self.record.get_mut(&result.server) {
                if record.count > 0 {
                    record.update(-1, now, self.window, self.max_failed);
                }
            }
        }
    }

    /// Phase two: walk the table and emit directives.
    ///
    /// Iteration order over the table is unspecified; the only inter-host
    /// coupling is the inactive cap, evaluated against the live set as it
    /// grows within this single call.
    pub(crate) fn derive(&mut self, now: Instant) -> Vec<Directive> {
        let mut emitted = Vec::new();
        let hosts: Vec<String> = self.record.keys().cloned().collect();
        for host in hosts {
            let Some(record) = self.record.get_mut(&host) else {
                continue;
            };
            let last_status = record.last_status;
            if record.count >= self.max_failed {
                if self.inactive.contains(&host) {
                    // Still failing while out of rotation: re-arm the
                    // remediation at cooldown cadence.
                    if record.is_action_due(now) {
                        record.next_action_at = Some(now + self.cooldown);
                        emitted.push(Directive {
                            kind: DirectiveKind::Offline,
                            host: host.clone(),
                            last_status,
                        });
                    }
                } else if self.inactive.len() < self.max_inactive {
                    info!(site = %self.name, %host, "taking backend out of rotation");
                    record.next_action_at = Some(now + self.cooldown);
                    self.inactive.insert(host.clone());
                    emitted.push(Directive {
                        kind: DirectiveKind::Offline,
                        host: host.clone(),
                        last_status,
                    });
                } else if record.is_notify_due(now) {
                    info!(site = %self.name, %host,
                        "backend over threshold but the inactive cap is reached, notifying only");
                    record.next_notify_at = Some(now + self.cooldown);
                    emitted.push(Directive {
                        kind: DirectiveKind::Notify,
                        host: host.clone(),
                        last_status,
                    });
                }
            } else if record.count == 0 {
                self.record.remove(&host);
                if self.inactive.remove(&host) {
                    info!(site = %self.name, %host, "backend recovered, bringing it back");
                    emitted.push(Directive {
                        kind: DirectiveKind::Online,
                        host: host.clone(),
                        last_status,
                    });
                }
            }
        }
        debug_assert!(
            self.inactive.len() <= self.max_inactive,
            "inactive cap exceeded after derivation"
        );
        debug_assert!(
            self.inactive.iter().all(|host| self.record.contains_key(host)),
            "inactive backend without a record"
        );
        emitted
    }

    /// Backends currently considered broken: everything out of rotation plus
    /// everything at the failure cap. Only used to build notification text.
    pub(crate) fn error_hosts(&self) -> BTreeSet<String> {
        let mut hosts: BTreeSet<String> = self
            .record
            .iter()
            .filter(|(_, record)| record.count >= self.max_failed)
            .map(|(host, _)| host.clone())
            .collect();
        hosts.extend(self.inactive.iter().cloned());
        hosts
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::config::ProbeMethod;

    const WINDOW: Duration = Duration::from_secs(60);
    const COOLDOWN: Duration = Duration::from_secs(300);

    fn site_config(servers: &[&str], max_inactive: usize) -> SiteConfig {
        SiteConfig {
            name: "www.example.com".to_string(),
            servers: servers.iter().map(|s| (*s).to_string()).collect(),
            path: "/".to_string(),
            method: ProbeMethod::Get,
            post_data: None,
            timeout: Duration::from_secs(5),
            max_failed: 3,
            duration: WINDOW,
            max_inactive,
            auto_interval: COOLDOWN,
            check_interval: Duration::from_secs(5),
            recover: None,
        }
    }

    fn fail(server: &str) -> ProbeResult {
        ProbeResult {
            status: 500,
            server: server.to_string(),
        }
    }

    fn ok(server: &str) -> ProbeResult {
        ProbeResult {
            status: 200,
            server: server.to_string(),
        }
    }

    fn at(t0: Instant, secs: u64) -> Instant {
        t0 + Duration::from_secs(secs)
    }

    /// Runs one cycle: update then derive at the same instant.
    fn cycle(record: &mut SiteRecord, results: &[ProbeResult], now: Instant) -> Vec<Directive> {
        record.update(results, now);
        record.derive(now)
    }

    #[test]
    fn counter_clamps_at_cap_and_zero() {
        let t0 = Instant::now();
        let mut record = HostRecord::new(500, t0, WINDOW);
        for step in 1..10 {
            record.update(1, at(t0, step), WINDOW, 3);
        }
        assert_eq!(record.count, 3, "counter must clamp at the cap");
        for step in 10..20 {
            record.update(-1, at(t0, step), WINDOW, 3);
        }
        assert_eq!(record.count, 0, "counter must clamp at zero");
    }

    #[test]
    fn counter_resets_after_the_window_expired() {
        let t0 = Instant::now();
        let mut record = HostRecord::new(500, t0, WINDOW);
        record.update(1, at(t0, 10), WINDOW, 3);
        assert_eq!(record.count, 2);
        // The window now ends at t=70; a failure at t=200 starts over.
        record.update(1, at(t0, 200), WINDOW, 3);
        assert_eq!(record.count, 1, "stale window must reset, not accumulate");
    }

    #[test]
    fn trigger_offline_after_max_failed_and_stay_quiet_within_cooldown() {
        // S1: A fails every 5s while B stays healthy.
        let config = site_config(&["a:80", "b:80"], 1);
        let mut record = SiteRecord::new(&config);
        let t0 = Instant::now();

        assert!(cycle(&mut record, &[fail("a:80"), ok("b:80")], t0).is_empty());
        assert!(cycle(&mut record, &[fail("a:80"), ok("b:80")], at(t0, 5)).is_empty());

        let emitted = cycle(&mut record, &[fail("a:80"), ok("b:80")], at(t0, 10));
        assert_eq!(
            emitted,
            vec![Directive {
                kind: DirectiveKind::Offline,
                host: "a:80".to_string(),
                last_status: 500,
            }]
        );
        assert!(record.inactive.contains("a:80"));

        // Still failing, but the cooldown keeps further actions suppressed.
        assert!(cycle(&mut record, &[fail("a:80"), ok("b:80")], at(t0, 15)).is_empty());
        assert!(cycle(&mut record, &[fail("a:80"), ok("b:80")], at(t0, 20)).is_empty());
        assert_eq!(record.record.get("a:80").map(|r| r.count), Some(3));
    }

    #[test]
    fn inactive_cap_turns_excess_offlines_into_notifies() {
        // S2: A and B cross the threshold in the same cycles, but only one
        // slot is available.
        let config = site_config(&["a:80", "b:80", "c:80"], 1);
        let mut record = SiteRecord::new(&config);
        let t0 = Instant::now();

        let both = [fail("a:80"), fail("b:80"), ok("c:80")];
        assert!(cycle(&mut record, &both, t0).is_empty());
        assert!(cycle(&mut record, &both, at(t0, 5)).is_empty());

        let emitted = cycle(&mut record, &both, at(t0, 10));
        assert_eq!(emitted.len(), 2);
        let kinds: Vec<DirectiveKind> = emitted.iter().map(|d| d.kind).collect();
        assert!(
            kinds.contains(&DirectiveKind::Offline) && kinds.contains(&DirectiveKind::Notify),
            "one backend goes offline, the other only notifies: {emitted:?}"
        );
        let hosts: BTreeSet<&str> = emitted.iter().map(|d| d.host.as_str()).collect();
        assert_eq!(hosts, BTreeSet::from(["a:80", "b:80"]));
        assert_eq!(record.inactive.len(), 1, "cap must hold after the cycle");
    }

    #[test]
    fn recovery_counts_down_then_emits_online_and_forgets() {
        // S3: continue S1 with failures up to t=295, successes from t=300.
        let config = site_config(&["a:80"], 1);
        let mut record = SiteRecord::new(&config);
        let t0 = Instant::now();

        let mut t = 0;
        while t <= 295 {
            cycle(&mut record, &[fail("a:80")], at(t0, t));
            t += 5;
        }
        assert!(record.inactive.contains("a:80"));

        assert!(cycle(&mut record, &[ok("a:80")], at(t0, 300)).is_empty());
        assert_eq!(record.record.get("a:80").map(|r| r.count), Some(2));
        assert!(cycle(&mut record, &[ok("a:80")], at(t0, 305)).is_empty());

        let emitted = cycle(&mut record, &[ok("a:80")], at(t0, 310));
        assert_eq!(
            emitted,
            vec![Directive {
                kind: DirectiveKind::Online,
                host: "a:80".to_string(),
                last_status: 200,
            }]
        );
        assert!(record.inactive.is_empty());
        assert!(
            !record.record.contains_key("a:80"),
            "healthy history must be garbage-collected"
        );
    }

    #[test]
    fn stale_failures_restart_the_count() {
        // S4: two failures, one success, then a failure long after the
        // window closed.
        let config = site_config(&["a:80"], 1);
        let mut record = SiteRecord::new(&config);
        let t0 = Instant::now();

        cycle(&mut record, &[fail("a:80")], t0);
        cycle(&mut record, &[fail("a:80")], at(t0, 10));
        assert_eq!(record.record.get("a:80").map(|r| r.count), Some(2));
        cycle(&mut record, &[ok("a:80")], at(t0, 15));
        assert_eq!(record.record.get("a:80").map(|r| r.count), Some(1));

        // expire_at is t=75; this failure lands well past it.
        cycle(&mut record, &[fail("a:80")], at(t0, 200));
        assert_eq!(record.record.get("a:80").map(|r| r.count), Some(1));
    }

    #[test]
    fn offlined_backend_reemits_offline_after_cooldown() {
        // S5: the backend stays broken while out of rotation; the offline
        // directive is re-emitted once the cooldown elapses, driving another
        // restart downstream.
        let config = site_config(&["a:80"], 1);
        let mut record = SiteRecord::new(&config);
        let t0 = Instant::now();

        cycle(&mut record, &[fail("a:80")], t0);
        cycle(&mut record, &[fail("a:80")], at(t0, 5));
        let emitted = cycle(&mut record, &[fail("a:80")], at(t0, 10));
        assert_eq!(emitted.len(), 1, "first offline at the threshold");

        // Cooldown runs until t=310.
        assert!(cycle(&mut record, &[fail("a:80")], at(t0, 309)).is_empty());
        let emitted = cycle(&mut record, &[fail("a:80")], at(t0, 311));
        assert_eq!(
            emitted,
            vec![Directive {
                kind: DirectiveKind::Offline,
                host: "a:80".to_string(),
                last_status: 500,
            }]
        );
        assert!(record.inactive.contains("a:80"), "still out of rotation");
    }

    #[test]
    fn notify_respects_its_own_cooldown() {
        // With the single slot taken by A, B keeps failing: one notify, then
        // silence until the cooldown elapses.
        let config = site_config(&["a:80", "b:80"], 1);
        let mut record = SiteRecord::new(&config);
        let t0 = Instant::now();

        let both = [fail("a:80"), fail("b:80")];
        cycle(&mut record, &both, t0);
        cycle(&mut record, &both, at(t0, 5));
        let emitted = cycle(&mut record, &both, at(t0, 10));
        let notifies: Vec<&Directive> = emitted
            .iter()
            .filter(|d| d.kind == DirectiveKind::Notify)
            .collect();
        assert_eq!(notifies.len(), 1);
        let notified = notifies[0].host.clone();

        for t in [15, 100, 305] {
            let emitted = cycle(&mut record, &both, at(t0, t));
            assert!(
                emitted
                    .iter()
                    .all(|d| d.kind != DirectiveKind::Notify || d.host != notified),
                "no repeat notify for {notified} within the cooldown (t={t}): {emitted:?}"
            );
        }
        let emitted = cycle(&mut record, &both, at(t0, 311));
        assert!(
            emitted
                .iter()
                .any(|d| d.kind == DirectiveKind::Notify && d.host == notified),
            "notify must re-fire once the cooldown elapsed: {emitted:?}"
        );
    }

    #[test]
    fn healthy_pool_produces_no_state_and_no_emissions() {
        // S6 start + invariant 7: successes for unknown hosts never create
        // records.
        let config = site_config(&["a:80", "b:80", "c:80", "d:80"], 2);
        let mut record = SiteRecord::new(&config);
        let t0 = Instant::now();

        let healthy = [ok("a:80"), ok("b:80"), ok("c:80"), ok("d:80")];
        for t in [0, 5, 10, 15] {
            assert!(cycle(&mut record, &healthy, at(t0, t)).is_empty());
        }
        assert!(record.record.is_empty());
        assert!(record.inactive.is_empty());
    }

    #[test]
    fn emissions_start_only_at_the_threshold() {
        // S6 rest: X failing emits nothing until its count reaches the cap.
        let config = site_config(&["a:80", "b:80", "c:80", "d:80"], 2);
        let mut record = SiteRecord::new(&config);
        let t0 = Instant::now();

        let x_down = [ok("a:80"), fail("b:80"), ok("c:80"), ok("d:80")];
        assert!(cycle(&mut record, &x_down, t0).is_empty());
        assert!(cycle(&mut record, &x_down, at(t0, 5)).is_empty());
        let emitted = cycle(&mut record, &x_down, at(t0, 10));
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].kind, DirectiveKind::Offline);
        assert_eq!(emitted[0].host, "b:80");
    }

    #[test]
    fn timeouts_count_like_any_other_failure() {
        let config = site_config(&["a:80"], 1);
        let mut record = SiteRecord::new(&config);
        let t0 = Instant::now();

        let unreachable = ProbeResult {
            status: 504,
            server: "a:80".to_string(),
        };
        cycle(&mut record, core::slice::from_ref(&unreachable), t0);
        cycle(&mut record, core::slice::from_ref(&unreachable), at(t0, 5));
        let emitted = cycle(&mut record, core::slice::from_ref(&unreachable), at(t0, 10));
        assert_eq!(emitted[0].last_status, 504);
    }

    #[test]
    fn error_hosts_is_the_union_of_inactive_and_capped() {
        let config = site_config(&["a:80", "b:80", "c:80"], 1);
        let mut record = SiteRecord::new(&config);
        let t0 = Instant::now();

        let both = [fail("a:80"), fail("b:80"), ok("c:80")];
        for t in [0, 5, 10] {
            cycle(&mut record, &both, at(t0, t));
        }
        // One of a/b is inactive, the other is capped but in rotation.
        assert_eq!(
            record.error_hosts(),
            BTreeSet::from(["a:80".to_string(), "b:80".to_string()])
        );
    }
}
