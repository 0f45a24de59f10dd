//! Worker pools.
//!
//! Three independent bounded pools: command activation, deferred/timed
//! tasks, and I/O-completion callbacks. Keeping them separate stops a
//! blocking session read from starving unrelated hosts' continuations, and
//! a burst of timer firings from delaying completions.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub(crate) type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Pool sizing. Defaults follow available parallelism for command work and
/// small fixed pools for timers and callbacks.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
  pub exec_workers: usize,
  pub deferred_workers: usize,
  pub callback_workers: usize,
}

impl Default for DispatcherConfig {
  fn default() -> Self {
    let parallelism = std::thread::available_parallelism()
      .map(|n| n.get())
      .unwrap_or(4);
    Self {
      exec_workers: parallelism,
      deferred_workers: (parallelism / 2).max(2),
      callback_workers: 3,
    }
  }
}

struct Pool {
  tx: mpsc::UnboundedSender<Job>,
  workers: Vec<JoinHandle<()>>,
}

impl Pool {
  fn spawn(name: &'static str, count: usize, cancel: CancellationToken) -> Self {
    let (tx, rx) = mpsc::unbounded_channel::<Job>();
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let workers = (0..count.max(1))
      .map(|index| {
        let rx = rx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
          loop {
            let job = {
              let mut rx = rx.lock().await;
              tokio::select! {
                job = rx.recv() => job,
                _ = cancel.cancelled() => None,
              }
            };
            match job {
              Some(job) => job.await,
              None => break,
            }
          }
          trace!(pool = name, index, "worker stopped");
        })
      })
      .collect();
    Self { tx, workers }
  }

  fn submit(&self, job: Job) {
    // a send failure means the pool already shut down; the job is dropped
    let _ = self.tx.send(job);
  }
}

/// Owner of the three worker pools.
///
/// Must be created from within a tokio runtime; workers are spawned
/// immediately and drain until [`Dispatcher::stop`].
pub struct Dispatcher {
  exec: Pool,
  deferred: Pool,
  callback: Pool,
  cancel: CancellationToken,
  running: AtomicBool,
}

impl Dispatcher {
  pub fn new(config: DispatcherConfig) -> Self {
    let cancel = CancellationToken::new();
    Self {
      exec: Pool::spawn("exec", config.exec_workers, cancel.clone()),
      deferred: Pool::spawn("deferred", config.deferred_workers, cancel.clone()),
      callback: Pool::spawn("callback", config.callback_workers, cancel.clone()),
      cancel,
      running: AtomicBool::new(true),
    }
  }

  /// Submit a command activation. Dropped silently once stopping.
  pub(crate) fn submit(&self, job: Job) {
    if self.is_running() {
      self.exec.submit(job);
    } else {
      debug!("dropping activation, dispatcher stopping");
    }
  }

  /// Run `job` on the deferred pool after `delay`. The returned handle
  /// aborts the pending fire (a job already dequeued still runs).
  pub(crate) fn schedule(self: &Arc<Self>, delay: Duration, job: Job) -> JoinHandle<()> {
    let this = self.clone();
    let cancel = self.cancel.clone();
    tokio::spawn(async move {
      tokio::select! {
        _ = tokio::time::sleep(delay) => {
          if this.is_running() {
            this.deferred.submit(job);
          }
        }
        _ = cancel.cancelled() => {}
      }
    })
  }

  /// Submit an I/O-completion callback.
  pub(crate) fn submit_callback(&self, job: Job) {
    if self.is_running() {
      self.callback.submit(job);
    }
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
  }

  /// Stop accepting work and wind the workers down.
  pub fn stop(&self) {
    if self.running.swap(false, Ordering::SeqCst) {
      debug!("dispatcher stopping");
      self.cancel.cancel();
    }
  }
}

impl Drop for Dispatcher {
  fn drop(&mut self) {
    self.cancel.cancel();
    for pool in [&self.exec, &self.deferred, &self.callback] {
      for worker in &pool.workers {
        worker.abort();
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  #[tokio::test(flavor = "multi_thread")]
  async fn submitted_jobs_run() {
    let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig {
      exec_workers: 2,
      deferred_workers: 1,
      callback_workers: 1,
    }));
    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
      let hits = hits.clone();
      dispatcher.submit(Box::pin(async move {
        hits.fetch_add(1, Ordering::SeqCst);
      }));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 10);
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn scheduled_jobs_fire_after_delay() {
    let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::default()));
    let hits = Arc::new(AtomicUsize::new(0));
    let fired = hits.clone();
    dispatcher.schedule(
      Duration::from_millis(20),
      Box::pin(async move {
        fired.fetch_add(1, Ordering::SeqCst);
      }),
    );
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn cancelled_schedule_never_fires() {
    let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::default()));
    let hits = Arc::new(AtomicUsize::new(0));
    let fired = hits.clone();
    let handle = dispatcher.schedule(
      Duration::from_millis(50),
      Box::pin(async move {
        fired.fetch_add(1, Ordering::SeqCst);
      }),
    );
    handle.abort();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn stopped_dispatcher_drops_submissions() {
    let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::default()));
    dispatcher.stop();
    let hits = Arc::new(AtomicUsize::new(0));
    let fired = hits.clone();
    dispatcher.submit(Box::pin(async move {
      fired.fetch_add(1, Ordering::SeqCst);
    }));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
  }
}
