//! Periodic poll threads
//!
//! The entity poller and the remote-sensor poller each take the shared cache lock
//! once per cycle, collect their notifications, release the lock and then emit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cm_core::bus::emit;
use cm_core::{poll_remote, Cache, NotificationSink, SharedCache};
use cm_protocol::Notification;
use tracing::{debug, error, info, warn};

/// Consecutive lock failures between repeated error logs
const ERROR_LOG_EVERY: u32 = 10;

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Sleep for `interval`, waking early on shutdown
pub fn sleep_interruptible(shutdown: &AtomicBool, interval: Duration) {
    let mut remaining = interval;
    while !remaining.is_zero() && !shutdown.load(Ordering::SeqCst) {
        let slice = remaining.min(SLEEP_SLICE);
        thread::sleep(slice);
        remaining -= slice;
    }
}

fn run_periodic(
    name: &'static str,
    cache: SharedCache,
    sink: Arc<dyn NotificationSink>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    mut cycle: impl FnMut(&mut Cache) -> Vec<Notification>,
) {
    info!(poller = name, interval_ms = interval.as_millis() as u64, "Poller starting");
    let mut consecutive_errors: u32 = 0;

    while !shutdown.load(Ordering::SeqCst) {
        let notifications = match cache.acquire() {
            Ok(mut guard) => {
                let notes = cycle(&mut *guard);
                drop(guard);
                if consecutive_errors > 0 {
                    debug!(poller = name, "Recovered after {} lock failures", consecutive_errors);
                    consecutive_errors = 0;
                }
                notes
            }
            Err(e) => {
                consecutive_errors += 1;
                if consecutive_errors == 1 || consecutive_errors % ERROR_LOG_EVERY == 0 {
                    error!(poller = name, count = consecutive_errors, "Poll skipped: {}", e);
                } else {
                    warn!(poller = name, "Poll skipped: {}", e);
                }
                Vec::new()
            }
        };

        emit(sink.as_ref(), &notifications);
        sleep_interruptible(&shutdown, interval);
    }

    info!(poller = name, "Poller stopped");
}

/// Poll every entity each `interval` until shutdown
pub fn run_entity_poll(
    cache: SharedCache,
    sink: Arc<dyn NotificationSink>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) {
    run_periodic("entity", cache, sink, interval, shutdown, |c| c.poll_entities());
}

/// Recompute external-control groups each `interval` until shutdown
pub fn run_remote_poll(
    cache: SharedCache,
    sink: Arc<dyn NotificationSink>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) {
    run_periodic("remote", cache, sink, interval, shutdown, poll_remote);
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_core::{CollectingSink, PlatformConfig, SimHal};

    fn shared() -> SharedCache {
        let config = PlatformConfig::default();
        let sim = SimHal::populated(&config);
        SharedCache::new(Cache::build(config, Box::new(sim)).unwrap())
    }

    #[test]
    fn test_entity_poller_emits_then_stops() {
        let cache = shared();
        let sink = Arc::new(CollectingSink::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = {
            let cache = cache.clone();
            let sink: Arc<dyn NotificationSink> = sink.clone();
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || run_entity_poll(cache, sink, Duration::from_millis(10), shutdown))
        };
        thread::sleep(Duration::from_millis(100));
        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap();

        let notes = sink.take();
        assert!(notes.iter().any(|n| n.key == "entity/card/1"));
        assert!(cache.acquire().unwrap().entities().iter().all(|e| e.present));
    }

    #[test]
    fn test_poller_survives_lock_timeout() {
        let cache = shared().with_timeout(Duration::from_millis(5));
        let sink = Arc::new(CollectingSink::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let guard = cache.acquire().unwrap();
        let handle = {
            let cache = cache.clone();
            let sink: Arc<dyn NotificationSink> = sink.clone();
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || run_entity_poll(cache, sink, Duration::from_millis(5), shutdown))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(sink.take().is_empty());
        drop(guard);

        thread::sleep(Duration::from_millis(50));
        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        assert!(!sink.take().is_empty());
    }

    #[test]
    fn test_sleep_wakes_on_shutdown() {
        let shutdown = AtomicBool::new(true);
        let start = std::time::Instant::now();
        sleep_interruptible(&shutdown, Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
