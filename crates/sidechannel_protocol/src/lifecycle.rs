use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

/// Returned by [`LifecycleMap::remaining_time`] for a key that isn't stored.
pub const ABSENT: i64 = -1;

// -----------------------------------------------------------------------------
// Clocks
// -----------------------------------------------------------------------------

/// Millisecond wall clock the scheduler measures lifetimes against.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(start_millis),
        })
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(millis(by), Ordering::SeqCst);
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

// -----------------------------------------------------------------------------
// Entries
// -----------------------------------------------------------------------------

/// Identifies one stored lifetime. Storing the same key again issues a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct EntryId(pub Uuid);

impl EntryId {
    fn fresh() -> Self {
        EntryId(Uuid::new_v4())
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy)]
struct Lifetime {
    id: EntryId,
    origin: i64,
    /// `None` lives until removed.
    duration: Option<i64>,
}

impl Lifetime {
    fn remaining(&self, now: i64) -> i64 {
        match self.duration {
            None => i64::MAX,
            Some(d) => self.origin.saturating_add(d).saturating_sub(now),
        }
    }
}

// -----------------------------------------------------------------------------
// LifecycleMap
// -----------------------------------------------------------------------------

/// A TTL store: "keep doing X until T milliseconds have elapsed".
///
/// Single-writer; it lives in the main-loop state of whichever side owns it.
/// Iteration order is unspecified.
pub struct LifecycleMap<T> {
    entries: HashMap<T, Lifetime>,
    clock: Arc<dyn Clock>,
}

impl<T: fmt::Debug> fmt::Debug for LifecycleMap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleMap").field("len", &self.entries.len()).finish()
    }
}

impl<T: Eq + Hash> Default for LifecycleMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq + Hash> LifecycleMap<T> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: HashMap::new(),
            clock,
        }
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Insert or overwrite `key`, starting its lifetime now.
    pub fn store(&mut self, key: T, duration: Duration) -> EntryId {
        let now = self.clock.now_millis();
        self.put(key, now, millis(duration))
    }

    /// Insert or overwrite `key` with an explicit origin.
    pub fn put(&mut self, key: T, origin_millis: i64, duration_millis: i64) -> EntryId {
        let id = EntryId::fresh();
        self.entries.insert(
            key,
            Lifetime {
                id,
                origin: origin_millis,
                duration: Some(duration_millis),
            },
        );
        id
    }

    /// Insert or overwrite `key` with a lifetime that never runs out.
    pub fn store_infinite(&mut self, key: T) -> EntryId {
        let id = EntryId::fresh();
        let origin = self.clock.now_millis();
        self.entries.insert(key, Lifetime { id, origin, duration: None });
        id
    }

    /// Milliseconds left for `key`: [`ABSENT`] if it isn't stored, `i64::MAX`
    /// if it never expires, and `<= 0` if it expired but hasn't been swept.
    pub fn remaining_time(&self, key: &T) -> i64 {
        match self.entries.get(key) {
            Some(lifetime) => lifetime.remaining(self.clock.now_millis()),
            None => ABSENT,
        }
    }

    pub fn id_of(&self, key: &T) -> Option<EntryId> {
        self.entries.get(key).map(|l| l.id)
    }

    /// Whether `key` is stored and still alive.
    pub fn is_live(&self, key: &T) -> bool {
        self.remaining_time(key) > 0
    }

    pub fn remove(&mut self, key: &T) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn remove_by_id(&mut self, id: EntryId) -> Option<T>
    where
        T: Clone,
    {
        let key = self
            .entries
            .iter()
            .find(|(_, l)| l.id == id)
            .map(|(k, _)| k.clone())?;
        self.entries.remove(&key);
        Some(key)
    }

    /// Drop every expired entry and return how many went.
    pub fn sweep(&mut self) -> usize {
        if self.entries.is_empty() {
            return 0;
        }
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, l| l.remaining(now) > 0);
        let removed = before - self.entries.len();
        if removed > 0 {
            trace!(removed, live = self.entries.len(), "swept expired entries");
        }
        removed
    }

    /// Keys that are alive right now, judged as each one is reached.
    pub fn live(&self) -> impl Iterator<Item = &T> + '_ {
        self.entries
            .iter()
            .filter(|(_, l)| l.remaining(self.clock.now_millis()) > 0)
            .map(|(k, _)| k)
    }

    /// One scheduler tick: sweep, then replay `f` over every live key.
    ///
    /// Each entry's lifetime is checked again right before its replay, so an
    /// entry that runs out part way through the tick is skipped. Returns the
    /// number of replays.
    pub fn tick<F>(&mut self, mut f: F) -> usize
    where
        F: FnMut(&T),
    {
        self.sweep();
        let mut replayed = 0;
        for (key, lifetime) in &self.entries {
            if lifetime.remaining(self.clock.now_millis()) > 0 {
                f(key);
                replayed += 1;
            }
        }
        replayed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn manual() -> (Arc<ManualClock>, LifecycleMap<&'static str>) {
        let clock = ManualClock::new(1_000);
        let map = LifecycleMap::with_clock(clock.clone());
        (clock, map)
    }

    #[test]
    fn remaining_time_counts_down() {
        let (clock, mut map) = manual();
        map.store("overlay", ms(500));
        assert_eq!(map.remaining_time(&"overlay"), 500);

        clock.advance(ms(200));
        assert_eq!(map.remaining_time(&"overlay"), 300);

        clock.advance(ms(400));
        assert_eq!(map.remaining_time(&"overlay"), -100);
        assert!(!map.is_live(&"overlay"));
    }

    #[test]
    fn missing_key_reports_sentinel() {
        let (_, map) = manual();
        assert_eq!(map.remaining_time(&"nothing"), ABSENT);
    }

    #[test]
    fn expired_key_is_swept_and_not_replayed() {
        let (clock, mut map) = manual();
        map.store("k", ms(100));
        clock.advance(ms(101));

        assert_eq!(map.sweep(), 1);
        assert_eq!(map.remaining_time(&"k"), ABSENT);
        assert_eq!(map.tick(|_| panic!("nothing should replay")), 0);
    }

    #[test]
    fn sweep_removes_all_then_is_a_no_op() {
        let (clock, mut map) = manual();
        for key in ["a", "b", "c"] {
            map.store(key, ms(100));
        }
        clock.advance(ms(150));

        assert_eq!(map.sweep(), 3);
        assert!(map.is_empty());
        assert_eq!(map.sweep(), 0);
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let (clock, mut map) = manual();
        map.store("k", ms(100));
        clock.advance(ms(100));
        assert_eq!(map.remaining_time(&"k"), 0);
        assert_eq!(map.live().count(), 0);
        assert_eq!(map.sweep(), 1);
    }

    #[test]
    fn store_overwrites_lifetime_and_id() {
        let (clock, mut map) = manual();
        let first = map.store("k", ms(100));
        clock.advance(ms(80));
        let second = map.store("k", ms(100));

        assert_ne!(first, second);
        assert_eq!(map.len(), 1);
        assert_eq!(map.remaining_time(&"k"), 100);
        assert_eq!(map.remove_by_id(first), None);
        assert_eq!(map.remove_by_id(second), Some("k"));
        assert!(map.is_empty());
    }

    #[test]
    fn infinite_entries_survive_sweeps() {
        let (clock, mut map) = manual();
        map.store_infinite("hud");
        clock.advance(Duration::from_secs(86_400 * 365));
        assert_eq!(map.sweep(), 0);
        assert_eq!(map.remaining_time(&"hud"), i64::MAX);
        assert!(map.remove(&"hud"));
        assert!(!map.remove(&"hud"));
    }

    #[test]
    fn entry_running_out_mid_tick_is_skipped() {
        let (clock, mut map) = manual();
        map.store("short", ms(100));
        map.store("long", ms(100));
        map.store_infinite("forever");

        // whichever entry replays first pushes the clock past both 100ms lifetimes
        let mut seen = Vec::new();
        let replayed = map.tick(|key| {
            seen.push(*key);
            clock.advance(ms(150));
        });

        assert!(seen.contains(&"forever"));
        assert!(replayed <= 2);
        let short_lived = seen.iter().filter(|k| **k != "forever").count();
        assert!(short_lived <= 1, "at most one 100ms entry can replay, saw {seen:?}");
    }

    #[test]
    fn tick_replays_each_live_key_once() {
        let (clock, mut map) = manual();
        map.store("a", ms(100));
        map.store("b", ms(300));
        map.store("c", ms(300));
        clock.advance(ms(200));

        let mut seen = Vec::new();
        assert_eq!(map.tick(|k| seen.push(*k)), 2);
        seen.sort();
        assert_eq!(seen, vec!["b", "c"]);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn system_clock_lifetime_elapses() {
        let mut map = LifecycleMap::new();
        map.store(7u32, ms(50));
        let remaining = map.remaining_time(&7);
        assert!(remaining > 0 && remaining <= 50, "remaining = {remaining}");

        std::thread::sleep(ms(80));
        assert_eq!(map.sweep(), 1);
        assert_eq!(map.tick(|_| {}), 0);
    }
}
