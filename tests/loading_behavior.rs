// ==============================================
// LOADING BEHAVIOR TESTS (integration)
// ==============================================
//
// Single-flight loads, failure hygiene, bulk loads, cancellation, and
// refresh. Loads that need real concurrency use the default spawning
// executor; everything else pins the direct executor for determinism.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use lfukit::builder::CacheBuilder;
use lfukit::cache::CacheCore;
use lfukit::error::LoadError;
use lfukit::traits::DirectExecutor;

fn cache() -> Arc<CacheCore<u64, String>> {
    Arc::new(
        CacheBuilder::new()
            .maximum_size(100)
            .executor(Arc::new(DirectExecutor))
            .record_stats()
            .build::<u64, String>(),
    )
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// ==============================================
// Single-flight
// ==============================================

mod single_flight {
    use super::*;

    #[test]
    fn concurrent_gets_share_one_load() {
        let cache = cache();
        let loads = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            let loads = Arc::clone(&loads);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                let loader = |_k: &u64| {
                    loads.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(50));
                    Ok::<_, LoadError>("loaded".to_string())
                };
                barrier.wait();
                cache.get_with(&1, &loader).unwrap()
            }));
        }
        let values: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();

        assert_eq!(loads.load(Ordering::SeqCst), 1, "loader ran more than once");
        for value in &values {
            assert_eq!(value.as_str(), "loaded");
            assert!(Arc::ptr_eq(value, &values[0]), "waiters saw a different value");
        }
        cache.clean_up();
        assert_eq!(cache.stats().load_successes, 1);
        cache.debug_validate();
    }

    #[test]
    fn loaded_value_is_cached_for_later_gets() {
        let cache = cache();
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let loader = move |k: &u64| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, LoadError>(format!("value-{k}"))
        };

        assert_eq!(cache.get_with(&1, &loader).unwrap().as_str(), "value-1");
        assert_eq!(cache.get_with(&1, &loader).unwrap().as_str(), "value-1");
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}

// ==============================================
// Failure hygiene
// ==============================================

mod failure {
    use super::*;

    #[test]
    fn failed_load_leaves_no_trace() {
        let cache = cache();
        let loader =
            |_k: &u64| Err::<String, _>(LoadError::Failed("backend down".into()));

        let result = cache.get_with(&1, &loader);
        assert!(matches!(result, Err(LoadError::Failed(_))));

        assert_eq!(cache.get_if_present(&1), None);
        cache.clean_up();
        assert_eq!(cache.estimated_size(), 0);
        assert_eq!(cache.stats().load_failures, 1);
        cache.debug_validate();
    }

    #[test]
    fn panicking_loader_is_a_load_failure() {
        let cache = cache();
        let loader = |_k: &u64| -> Result<String, LoadError> { panic!("loader bug") };

        let result = cache.get_with(&1, &loader);
        assert!(matches!(result, Err(LoadError::Failed(_))));
        cache.clean_up();
        assert_eq!(cache.estimated_size(), 0);
        assert_eq!(cache.stats().load_failures, 1);
    }

    #[test]
    fn failure_then_success_reloads() {
        let cache = cache();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let loader = move |_k: &u64| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(LoadError::NullValue)
            } else {
                Ok("second-try".to_string())
            }
        };

        assert_eq!(cache.get_with(&1, &loader), Err(LoadError::NullValue));
        assert_eq!(cache.get_with(&1, &loader).unwrap().as_str(), "second-try");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        cache.clean_up();
        assert_eq!(cache.stats().load_failures, 1);
        assert_eq!(cache.stats().load_successes, 1);
    }
}

// ==============================================
// Bulk loads
// ==============================================

mod bulk {
    use super::*;
    use lfukit::traits::Loader;

    struct OverFetching;

    impl Loader<u64, String> for OverFetching {
        fn load(&self, key: &u64) -> Result<String, LoadError> {
            Ok(format!("single-{key}"))
        }

        fn load_all(&self, _keys: &[u64]) -> Option<Result<Vec<(u64, String)>, LoadError>> {
            Some(Ok((1..=5).map(|k| (k, format!("bulk-{k}"))).collect()))
        }
    }

    #[test]
    fn bulk_load_may_exceed_the_request() {
        let cache = cache();
        let result = cache.get_all(&[1, 2, 3], &OverFetching);

        let mut keys: Vec<_> = result.keys().copied().collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![1, 2, 3], "result must cover exactly the request");

        cache.clean_up();
        assert!(cache.estimated_size() >= 5, "extras must be cached");
        assert!(cache.get_if_present(&4).is_some());
        assert!(cache.get_if_present(&5).is_some());
        assert_eq!(cache.stats().load_successes, 1, "bulk load counts once");
        cache.debug_validate();
    }

    #[test]
    fn present_keys_skip_the_loader() {
        let cache = cache();
        cache.put(1, "resident".to_string());

        let result = cache.get_all(&[1, 2], &OverFetching);
        assert_eq!(result[&1].as_str(), "resident");
        assert_eq!(result[&2].as_str(), "bulk-2");
    }

    #[test]
    fn without_bulk_support_keys_load_in_parallel() {
        let cache = cache();
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let loader = move |k: &u64| {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            Ok::<_, LoadError>(format!("v{k}"))
        };

        let started = Instant::now();
        let keys: Vec<u64> = (0..8).collect();
        let result = cache.get_all(&keys, &loader);
        let elapsed = started.elapsed();

        assert_eq!(result.len(), 8);
        assert_eq!(loads.load(Ordering::SeqCst), 8);
        // Eight 20ms loads in parallel finish far sooner than in series.
        assert!(elapsed < Duration::from_millis(120), "loads ran serially: {elapsed:?}");
        cache.clean_up();
        cache.debug_validate();
    }
}

// ==============================================
// Async loads and cancellation
// ==============================================

mod async_loading {
    use super::*;

    #[test]
    fn async_get_returns_a_shared_future() {
        let cache: Arc<CacheCore<u64, String>> = Arc::new(
            CacheBuilder::new()
                .maximum_size(100)
                .record_stats()
                .build::<u64, String>(),
        );
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = std::sync::Mutex::new(release_rx);
        let loader = Arc::new(move |_k: &u64| {
            release_rx.lock().unwrap().recv().unwrap();
            Ok::<_, LoadError>("async".to_string())
        });

        let first = cache.async_get(&1, &loader);
        let second = cache.async_get(&1, &loader);
        assert!(first.same_as(&second), "concurrent async gets must share the flight");
        assert!(first.is_pending());

        release_tx.send(()).unwrap();
        assert_eq!(first.wait().unwrap().as_str(), "async");
        assert!(wait_until(Duration::from_secs(5), || {
            cache.get_if_present(&1).is_some()
        }));
        assert_eq!(cache.stats().load_successes, 1);
    }

    #[test]
    fn cancellation_removes_the_slot_and_records_one_failure() {
        let cache: Arc<CacheCore<u64, String>> = Arc::new(
            CacheBuilder::new()
                .maximum_size(100)
                .record_stats()
                .build::<u64, String>(),
        );
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = std::sync::Mutex::new(release_rx);
        let loader = Arc::new(move |_k: &u64| {
            release_rx.lock().unwrap().recv().unwrap();
            Ok::<_, LoadError>("too late".to_string())
        });

        let future = cache.async_get(&1, &loader);
        assert!(future.cancel());
        assert_eq!(future.wait(), Err(LoadError::Cancelled));

        // Let the loader finish; its completion callback observes the
        // cancellation and reclaims the slot.
        release_tx.send(()).unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            cache.stats().load_failures == 1
        }));
        assert_eq!(cache.get_if_present(&1), None);
        cache.clean_up();
        assert_eq!(cache.estimated_size(), 0);
        assert_eq!(cache.stats().load_failures, 1, "failure recorded exactly once");
        cache.debug_validate();
    }

    #[test]
    fn pending_future_is_invisible_to_get_if_present() {
        let cache: Arc<CacheCore<u64, String>> = Arc::new(
            CacheBuilder::new().maximum_size(100).build::<u64, String>(),
        );
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = std::sync::Mutex::new(release_rx);
        let loader = Arc::new(move |_k: &u64| {
            release_rx.lock().unwrap().recv().unwrap();
            Ok::<_, LoadError>("slow".to_string())
        });

        let future = cache.async_get(&1, &loader);
        assert_eq!(cache.get_if_present(&1), None);

        release_tx.send(()).unwrap();
        future.wait().unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            cache.get_if_present(&1).is_some()
        }));
    }
}

// ==============================================
// Refresh
// ==============================================

mod refresh {
    use super::*;

    #[test]
    fn refresh_replaces_value_on_success() {
        let cache = cache();
        cache.put(1, "stale".to_string());

        let loader = Arc::new(|_k: &u64| Ok::<_, LoadError>("fresh".to_string()));
        cache.refresh(&1, &loader);

        assert_eq!(
            cache.get_if_present(&1).as_deref().map(String::as_str),
            Some("fresh")
        );
        cache.clean_up();
        assert_eq!(cache.stats().load_successes, 1);
        cache.debug_validate();
    }

    #[test]
    fn refresh_failure_keeps_old_value() {
        let cache = cache();
        cache.put(1, "kept".to_string());

        let loader =
            Arc::new(|_k: &u64| Err::<String, _>(LoadError::Failed("flaky".into())));
        cache.refresh(&1, &loader);

        assert_eq!(
            cache.get_if_present(&1).as_deref().map(String::as_str),
            Some("kept")
        );
        cache.clean_up();
        assert_eq!(cache.stats().load_failures, 1);
    }

    #[test]
    fn refresh_of_absent_key_loads_it() {
        let cache = cache();
        let loader = Arc::new(|k: &u64| Ok::<_, LoadError>(format!("loaded-{k}")));
        cache.refresh(&7, &loader);
        assert_eq!(
            cache.get_if_present(&7).as_deref().map(String::as_str),
            Some("loaded-7")
        );
    }
}
