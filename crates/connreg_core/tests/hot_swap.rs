use connreg_core::{Closeable, Registry, RegistryError, RetryPolicy};
use once_cell::sync::OnceCell;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

type CloseObserver = Arc<OnceCell<Box<dyn Fn(&str) -> Option<u32> + Send + Sync>>>;

#[derive(Debug)]
struct Unreachable(u32);

impl Display for Unreachable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "backend unreachable (call {})", self.0)
    }
}

impl std::error::Error for Unreachable {}

struct Handle {
    name: String,
    generation: u32,
    closes: AtomicUsize,
    visible_on_close: AtomicU32,
    observer: CloseObserver,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("name", &self.name)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl Closeable for Handle {
    type Error = String;

    fn close(&self) -> Result<(), String> {
        if self.closes.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(format!("generation {} already closed", self.generation));
        }
        if let Some(observer) = self.observer.get() {
            let visible = observer(&self.name).unwrap_or(0);
            self.visible_on_close.store(visible, Ordering::SeqCst);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("gen-{}", self.generation)
    }
}

/// Opener that fails while `healthy` is false and otherwise hands out increasing generations.
fn switchable_opener(
    calls: Arc<AtomicU32>,
    healthy: Arc<AtomicBool>,
    observer: CloseObserver,
) -> impl Fn(&str) -> Result<Handle, Unreachable> + Send + Sync {
    let generations = Arc::new(AtomicU32::new(0));
    move |name: &str| {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !healthy.load(Ordering::SeqCst) {
            return Err(Unreachable(call));
        }
        Ok(Handle {
            name: name.to_string(),
            generation: generations.fetch_add(1, Ordering::SeqCst) + 1,
            closes: AtomicUsize::new(0),
            visible_on_close: AtomicU32::new(0),
            observer: Arc::clone(&observer),
        })
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy::new(5, Duration::from_millis(30))
}

#[test]
fn open_succeeds_on_third_attempt_with_fixed_spacing() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let stamps = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&stamps);
    let registry = Registry::with_retry_policy(
        move |name: &str| {
            recorded.lock().expect("stamps lock").push(Instant::now());
            let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if call < 3 {
                return Err(Unreachable(call));
            }
            Ok(Handle {
                name: name.to_string(),
                generation: call,
                closes: AtomicUsize::new(0),
                visible_on_close: AtomicU32::new(0),
                observer: CloseObserver::default(),
            })
        },
        fast_policy(),
    );

    let handle = registry.open("db1").expect("third attempt should succeed");
    assert_eq!(handle.generation, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(registry.get("db1").expect("db1 active").generation, 3);

    let stamps = stamps.lock().expect("stamps lock");
    for pair in stamps.windows(2) {
        assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(30));
    }
}

#[test]
fn failing_update_keeps_original_after_all_attempts() {
    let calls = Arc::new(AtomicU32::new(0));
    let healthy = Arc::new(AtomicBool::new(true));
    let registry = Registry::with_retry_policy(
        switchable_opener(Arc::clone(&calls), Arc::clone(&healthy), CloseObserver::default()),
        RetryPolicy::new(5, Duration::from_millis(200)),
    );
    let original = registry.open("db1").expect("initial open");

    healthy.store(false, Ordering::SeqCst);
    let started = Instant::now();
    let err = registry.update("db1").expect_err("update must fail");
    let elapsed = started.elapsed();

    assert!(matches!(err, RegistryError::UpdateRejected { attempts: 5, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1 + 5);
    // Four sleeps between five attempts; none after the last failure.
    assert!(elapsed >= Duration::from_millis(4 * 200), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(5 * 200), "elapsed {elapsed:?}");
    assert!(Arc::ptr_eq(
        &original,
        &registry.get("db1").expect("original still active")
    ));
    assert_eq!(original.closes.load(Ordering::SeqCst), 0);
}

#[test]
fn failing_first_open_is_fatal() {
    let registry = Registry::with_retry_policy(
        switchable_opener(
            Arc::default(),
            Arc::new(AtomicBool::new(false)),
            CloseObserver::default(),
        ),
        RetryPolicy::new(2, Duration::from_millis(1)),
    );

    let err = registry.open("db1").expect_err("open must fail");
    assert!(err.is_fatal());
    assert!(err.to_string().contains("unavailable"));
    assert!(registry.get("db1").is_none());
}

#[test]
fn displaced_handle_is_closed_after_replacement_is_visible() {
    let observer = CloseObserver::default();
    let registry = Arc::new(Registry::with_retry_policy(
        switchable_opener(
            Arc::default(),
            Arc::new(AtomicBool::new(true)),
            Arc::clone(&observer),
        ),
        fast_policy(),
    ));
    let weak = Arc::downgrade(&registry);
    let installed = observer.set(Box::new(move |name: &str| {
        weak.upgrade()
            .and_then(|registry| registry.get(name))
            .map(|handle| handle.generation)
    }));
    assert!(installed.is_ok());

    let first = registry.open("db1").expect("open");
    registry.update("db1").expect("first update");
    let second = registry.get("db1").expect("second generation");
    registry.update("db1").expect("second update");

    assert_eq!(first.closes.load(Ordering::SeqCst), 1);
    assert_eq!(first.visible_on_close.load(Ordering::SeqCst), 2);
    assert_eq!(second.closes.load(Ordering::SeqCst), 1);
    assert_eq!(second.visible_on_close.load(Ordering::SeqCst), 3);
    assert_eq!(registry.get("db1").expect("current").generation, 3);
}

#[test]
fn readers_never_observe_absent_during_update() {
    let registry = Arc::new(Registry::with_retry_policy(
        switchable_opener(
            Arc::default(),
            Arc::new(AtomicBool::new(true)),
            CloseObserver::default(),
        ),
        fast_policy(),
    ));
    registry.open("db1").expect("open");

    let start = Arc::new(Barrier::new(2));
    let reader = {
        let registry = Arc::clone(&registry);
        let start = Arc::clone(&start);
        thread::spawn(move || {
            start.wait();
            let mut seen = Vec::with_capacity(1000);
            for _ in 0..1000 {
                let handle = registry.get("db1").expect("db1 must never be absent");
                seen.push(handle.generation);
            }
            seen
        })
    };

    start.wait();
    for _ in 0..5 {
        registry.update("db1").expect("update");
    }

    let seen = reader.join().expect("reader thread");
    assert_eq!(seen.len(), 1000);
    assert!(seen.iter().all(|generation| (1..=6).contains(generation)));
    assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[test]
fn concurrent_updates_on_same_name_close_each_displaced_handle_once() {
    let registry = Arc::new(Registry::with_retry_policy(
        switchable_opener(
            Arc::default(),
            Arc::new(AtomicBool::new(true)),
            CloseObserver::default(),
        ),
        fast_policy(),
    ));
    let kept = Arc::new(Mutex::new(vec![registry.open("db1").expect("open")]));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let kept = Arc::clone(&kept);
            thread::spawn(move || {
                for _ in 0..10 {
                    registry.update("db1").expect("update");
                    if let Some(current) = registry.get("db1") {
                        kept.lock().expect("kept lock").push(current);
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker thread");
    }

    let active = registry.get("db1").expect("db1 active");
    for handle in kept.lock().expect("kept lock").iter() {
        let expected = if Arc::ptr_eq(handle, &active) { 0 } else { 1 };
        assert_eq!(handle.closes.load(Ordering::SeqCst), expected);
    }
}

#[test]
fn close_all_closes_three_entries_once() {
    let registry = Registry::with_retry_policy(
        switchable_opener(
            Arc::default(),
            Arc::new(AtomicBool::new(true)),
            CloseObserver::default(),
        ),
        fast_policy(),
    );
    let handles: Vec<_> = ["db1", "db2", "db3"]
        .into_iter()
        .map(|name| registry.open(name).expect("open"))
        .collect();

    assert_eq!(registry.close_all(), 3);
    for (name, handle) in ["db1", "db2", "db3"].into_iter().zip(&handles) {
        assert_eq!(handle.closes.load(Ordering::SeqCst), 1);
        assert!(registry.get(name).is_none());
    }
}

#[test]
fn concurrent_close_all_never_double_closes() {
    let registry = Arc::new(Registry::with_retry_policy(
        switchable_opener(
            Arc::default(),
            Arc::new(AtomicBool::new(true)),
            CloseObserver::default(),
        ),
        fast_policy(),
    ));
    let handles: Vec<_> = (0..64)
        .map(|i| registry.open(&format!("db{i}")).expect("open"))
        .collect();

    let start = Arc::new(Barrier::new(2));
    let drains: Vec<_> = (0..2)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                registry.close_all()
            })
        })
        .collect();
    let closed: usize = drains
        .into_iter()
        .map(|drain| drain.join().expect("drain thread"))
        .sum();

    assert_eq!(closed, 64);
    assert!(registry.is_empty());
    for handle in handles {
        assert_eq!(handle.closes.load(Ordering::SeqCst), 1);
    }
}
