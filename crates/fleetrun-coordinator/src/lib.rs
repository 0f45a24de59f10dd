//! Coordination points between concurrently executing script contexts.
//!
//! Holds the named countdown latches behind `signal`/`wait-for`, the waiter
//! queues released when a latch reaches zero, and the independent counters
//! used by countdown gates. This is the only state shared across contexts;
//! everything is mutated under one lock, so a waiter can never slip into the
//! queue after its latch has already resolved.
//!
//! Missing or already-resolved latches are soft conditions: orchestration
//! scripts race ahead of declaration across hosts, so `signal` on an unknown
//! name logs and moves on, and `wait-for` on an unknown name resolves
//! immediately instead of hanging.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, error, info, warn};

/// A suspended command instance queued against a latch name.
///
/// `resume` is invoked exactly once, with the waiter's pending input, when
/// the latch reaches zero — or never, if the run aborts first.
pub struct Waiter {
  /// Uid of the suspended command instance; used to deregister a waiter
  /// whose activation was torn down.
  pub uid: u64,
  /// The input the suspended node will be resumed with.
  pub input: Value,
  resume: Box<dyn FnOnce(Value) + Send>,
}

impl Waiter {
  pub fn new(uid: u64, input: Value, resume: impl FnOnce(Value) + Send + 'static) -> Self {
    Self {
      uid,
      input,
      resume: Box::new(resume),
    }
  }

  fn resolve(self) {
    let input = self.input;
    (self.resume)(input);
  }
}

type Observer = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Inner {
  latches: BTreeMap<String, i64>,
  latch_times: BTreeMap<String, Instant>,
  waiters: BTreeMap<String, Vec<Waiter>>,
  counters: BTreeMap<String, i64>,
}

/// Per-run registry of latches, waiter queues, and counters.
#[derive(Default)]
pub struct Coordinator {
  inner: Mutex<Inner>,
  observers: Mutex<Vec<Observer>>,
}

impl Coordinator {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a callback fired (with the latch name) whenever a latch
  /// reaches zero.
  pub fn add_observer(&self, observer: impl Fn(&str) + Send + Sync + 'static) {
    self
      .observers
      .lock()
      .expect("observer lock poisoned")
      .push(Box::new(observer));
  }

  /// Declare a latch. Re-declaring an active (>0) latch keeps the current
  /// count unless `forced`. A count of zero or less trivially completes,
  /// releasing anything already queued.
  pub fn set_signal(&self, name: &str, count: i64, forced: bool) {
    let released = {
      let mut inner = self.inner.lock().expect("coordinator lock poisoned");
      if !forced {
        if let Some(current) = inner.latches.get(name) {
          if *current > 0 {
            warn!(
              signal = name,
              current, requested = count, "duplicate set-signal, keeping current count"
            );
            return;
          }
        }
      }
      inner.latches.insert(name.to_string(), count.max(0));
      if count <= 0 {
        inner.latch_times.insert(name.to_string(), Instant::now());
        inner.waiters.remove(name)
      } else {
        None
      }
    };
    if let Some(waiters) = released {
      self.release(name, waiters);
    }
  }

  /// Decrement a latch. Missing latches and latches already at zero are
  /// logged no-ops; counts never go below zero.
  pub fn signal(&self, name: &str) {
    let released = {
      let mut inner = self.inner.lock().expect("coordinator lock poisoned");
      let Some(count) = inner.latches.get_mut(name) else {
        warn!(signal = name, "signal for undeclared latch, ignoring");
        return;
      };
      if *count > 0 {
        *count -= 1;
        debug!(signal = name, remaining = *count, "signal");
        if *count == 0 {
          inner.latch_times.insert(name.to_string(), Instant::now());
          inner.waiters.remove(name)
        } else {
          None
        }
      } else {
        debug!(signal = name, "signal for already-resolved latch, ignoring");
        None
      }
    };
    if let Some(waiters) = released {
      self.release(name, waiters);
    }
  }

  /// Queue `waiter` against `name`, or resolve it immediately when the
  /// latch is missing or already at zero.
  pub fn wait_for(&self, name: &str, waiter: Waiter) {
    let immediate = {
      let mut inner = self.inner.lock().expect("coordinator lock poisoned");
      match inner.latches.get(name) {
        None => {
          error!(signal = name, "wait-for on undeclared latch, resolving immediately");
          Some(waiter)
        }
        Some(count) if *count <= 0 => {
          info!(signal = name, "wait-for on resolved latch, resolving immediately");
          Some(waiter)
        }
        Some(count) => {
          debug!(signal = name, count, "wait-for queued");
          inner.waiters.entry(name.to_string()).or_default().push(waiter);
          None
        }
      }
    };
    if let Some(waiter) = immediate {
      waiter.resolve();
    }
  }

  /// Drop a queued waiter without resolving it.
  pub fn remove_waiter(&self, name: &str, uid: u64) {
    let mut inner = self.inner.lock().expect("coordinator lock poisoned");
    if let Some(queue) = inner.waiters.get_mut(name) {
      queue.retain(|w| w.uid != uid);
    }
  }

  /// Drop every queued waiter without resolving it. Used on run abort so
  /// stuck cross-host waits cannot block termination.
  pub fn clear_waiters(&self) {
    let dropped: usize = {
      let mut inner = self.inner.lock().expect("coordinator lock poisoned");
      let dropped = inner.waiters.values().map(Vec::len).sum();
      inner.waiters.clear();
      dropped
    };
    if dropped > 0 {
      info!(dropped, "cleared pending waiters");
    }
  }

  /// Current latch count, clamped at zero. Missing latches read as zero.
  pub fn get_signal_count(&self, name: &str) -> i64 {
    let inner = self.inner.lock().expect("coordinator lock poisoned");
    match inner.latches.get(name) {
      Some(count) => (*count).max(0),
      None => {
        error!(signal = name, "get-signal-count for undeclared latch, defaulting to 0");
        0
      }
    }
  }

  pub fn has_latch(&self, name: &str) -> bool {
    let inner = self.inner.lock().expect("coordinator lock poisoned");
    inner.latches.contains_key(name)
  }

  /// Increment an independent counter (created at zero).
  pub fn increase(&self, name: &str) -> i64 {
    let mut inner = self.inner.lock().expect("coordinator lock poisoned");
    let counter = inner.counters.entry(name.to_string()).or_insert(0);
    *counter += 1;
    *counter
  }

  /// Decrement an independent counter, lazily initialized to `initial`.
  pub fn decrease(&self, name: &str, initial: i64) -> i64 {
    let mut inner = self.inner.lock().expect("coordinator lock poisoned");
    let counter = inner.counters.entry(name.to_string()).or_insert(initial);
    *counter -= 1;
    *counter
  }

  pub fn get_counter(&self, name: &str) -> i64 {
    let mut inner = self.inner.lock().expect("coordinator lock poisoned");
    *inner.counters.entry(name.to_string()).or_insert(0)
  }

  /// Snapshot of latch counts, for diagnostics.
  pub fn latches(&self) -> BTreeMap<String, i64> {
    self.inner.lock().expect("coordinator lock poisoned").latches.clone()
  }

  /// Snapshot of when each latch reached zero.
  pub fn latch_times(&self) -> BTreeMap<String, Instant> {
    self
      .inner
      .lock()
      .expect("coordinator lock poisoned")
      .latch_times
      .clone()
  }

  /// Snapshot of counter values.
  pub fn counters(&self) -> BTreeMap<String, i64> {
    self.inner.lock().expect("coordinator lock poisoned").counters.clone()
  }

  /// Snapshot of queued waiter counts per latch name.
  pub fn waiting(&self) -> BTreeMap<String, usize> {
    self
      .inner
      .lock()
      .expect("coordinator lock poisoned")
      .waiters
      .iter()
      .map(|(name, queue)| (name.clone(), queue.len()))
      .collect()
  }

  /// Resolve released waiters and fire observers outside the state lock, so
  /// continuations are free to call back into the coordinator.
  fn release(&self, name: &str, waiters: Vec<Waiter>) {
    info!(signal = name, waiters = waiters.len(), "latch reached zero");
    for waiter in waiters {
      waiter.resolve();
    }
    let observers = self.observers.lock().expect("observer lock poisoned");
    for observer in observers.iter() {
      observer(name);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::Arc;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn counting_waiter(uid: u64, hits: &Arc<AtomicUsize>) -> Waiter {
    let hits = hits.clone();
    Waiter::new(uid, json!(""), move |_| {
      hits.fetch_add(1, Ordering::SeqCst);
    })
  }

  #[test]
  fn waiter_resolves_only_at_zero() {
    let coordinator = Coordinator::new();
    let hits = Arc::new(AtomicUsize::new(0));
    coordinator.set_signal("ready", 2, false);
    coordinator.wait_for("ready", counting_waiter(1, &hits));

    coordinator.signal("ready");
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    coordinator.signal("ready");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    // a third signal must not resolve anything again
    coordinator.signal("ready");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(coordinator.get_signal_count("ready"), 0);
  }

  #[test]
  fn wait_for_undeclared_latch_resolves_immediately() {
    let coordinator = Coordinator::new();
    let hits = Arc::new(AtomicUsize::new(0));
    coordinator.wait_for("never-declared", counting_waiter(1, &hits));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn duplicate_set_signal_keeps_count_unless_forced() {
    let coordinator = Coordinator::new();
    coordinator.set_signal("x", 3, false);
    coordinator.signal("x");
    coordinator.set_signal("x", 10, false);
    assert_eq!(coordinator.get_signal_count("x"), 2);
    coordinator.set_signal("x", 10, true);
    assert_eq!(coordinator.get_signal_count("x"), 10);
  }

  #[test]
  fn cleared_waiters_never_resolve() {
    let coordinator = Coordinator::new();
    let hits = Arc::new(AtomicUsize::new(0));
    coordinator.set_signal("gate", 1, false);
    coordinator.wait_for("gate", counting_waiter(1, &hits));
    coordinator.clear_waiters();
    coordinator.signal("gate");
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(coordinator.get_signal_count("gate"), 0);
  }

  #[test]
  fn removed_waiter_is_skipped() {
    let coordinator = Coordinator::new();
    let hits = Arc::new(AtomicUsize::new(0));
    coordinator.set_signal("gate", 1, false);
    coordinator.wait_for("gate", counting_waiter(7, &hits));
    coordinator.wait_for("gate", counting_waiter(8, &hits));
    coordinator.remove_waiter("gate", 7);
    coordinator.signal("gate");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn counters_are_independent_of_latches() {
    let coordinator = Coordinator::new();
    coordinator.set_signal("name", 5, false);
    assert_eq!(coordinator.decrease("name", 2), 1);
    assert_eq!(coordinator.decrease("name", 2), 0);
    // the latch of the same name is untouched
    assert_eq!(coordinator.get_signal_count("name"), 5);
    assert_eq!(coordinator.increase("other"), 1);
    assert_eq!(coordinator.get_counter("other"), 1);
  }

  #[test]
  fn trivial_set_signal_releases_queued_waiters() {
    let coordinator = Coordinator::new();
    let hits = Arc::new(AtomicUsize::new(0));
    coordinator.set_signal("gate", 1, false);
    coordinator.wait_for("gate", counting_waiter(1, &hits));
    coordinator.set_signal("gate", 0, true);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn observers_fire_on_zero() {
    let coordinator = Coordinator::new();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    coordinator.add_observer(move |name| sink.lock().unwrap().push(name.to_string()));
    coordinator.set_signal("a", 1, false);
    coordinator.signal("a");
    assert_eq!(*seen.lock().unwrap(), vec!["a".to_string()]);
  }
}
