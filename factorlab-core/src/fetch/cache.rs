//! In-memory TTL cache with single-flight fetch collapsing.
//!
//! A hit within the TTL returns the cached `Arc<Table>` without touching the
//! provider. A miss installs an in-flight slot; concurrent requests for the
//! same key block on that slot instead of issuing duplicate fetches, so one
//! provider call serves every waiter.

use super::FetchError;
use crate::domain::Table;
use crate::selection::CacheKey;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// How a lookup was satisfied, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from memory within the TTL.
    Hit,
    /// This caller performed the fetch.
    Miss,
    /// Another caller was already fetching; this caller waited on it.
    Coalesced,
}

#[derive(Default)]
struct FlightResult {
    outcome: Mutex<Option<Result<Arc<Table>, FetchError>>>,
    done: Condvar,
}

enum Slot {
    Ready { table: Arc<Table>, stored_at: Instant },
    InFlight(Arc<FlightResult>),
}

/// Keyed table cache shared by all concurrent pipeline evaluations.
pub struct TableCache {
    slots: Mutex<HashMap<CacheKey, Slot>>,
    ttl: Duration,
}

impl TableCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up `key`, running `fetch` on a miss. Stale entries (older than
    /// the TTL) are refetched. The fetch closure runs outside the cache lock.
    /// A caller coalescing onto an in-flight fetch waits at most until its
    /// own `deadline`; the leader's fetch is bounded by the closure itself.
    pub fn get_or_fetch<F>(
        &self,
        key: &CacheKey,
        deadline: Instant,
        fetch: F,
    ) -> (Result<Arc<Table>, FetchError>, CacheStatus)
    where
        F: FnOnce() -> Result<Table, FetchError>,
    {
        let flight = {
            let mut slots = self.slots.lock().unwrap();
            match slots.get(key) {
                Some(Slot::Ready { table, stored_at }) if stored_at.elapsed() < self.ttl => {
                    return (Ok(table.clone()), CacheStatus::Hit);
                }
                Some(Slot::InFlight(flight)) => {
                    let flight = flight.clone();
                    drop(slots);
                    return (self.wait_for(&flight, deadline), CacheStatus::Coalesced);
                }
                // Vacant or stale: this caller becomes the leader.
                _ => {
                    let flight = Arc::new(FlightResult::default());
                    slots.insert(key.clone(), Slot::InFlight(flight.clone()));
                    flight
                }
            }
        };

        let result = fetch().map(Arc::new);

        {
            let mut slots = self.slots.lock().unwrap();
            match &result {
                Ok(table) => {
                    slots.insert(
                        key.clone(),
                        Slot::Ready {
                            table: table.clone(),
                            stored_at: Instant::now(),
                        },
                    );
                }
                // Failed fetches are not cached; the next caller retries.
                Err(_) => {
                    slots.remove(key);
                }
            }
        }

        let mut outcome = flight.outcome.lock().unwrap();
        *outcome = Some(result.clone());
        drop(outcome);
        flight.done.notify_all();

        (result, CacheStatus::Miss)
    }

    fn wait_for(
        &self,
        flight: &FlightResult,
        deadline: Instant,
    ) -> Result<Arc<Table>, FetchError> {
        let mut outcome = flight.outcome.lock().unwrap();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            let now = Instant::now();
            if now >= deadline {
                // The leader keeps fetching for later callers; only this
                // waiter gives up. The fetcher fills in the endpoint.
                return Err(FetchError::DeadlineExceeded {
                    endpoint: String::new(),
                });
            }
            let (guard, _) = flight.done.wait_timeout(outcome, deadline - now).unwrap();
            outcome = guard;
        }
    }

    /// Drop every cached entry (in-flight fetches are unaffected).
    pub fn clear(&self) {
        self.slots
            .lock()
            .unwrap()
            .retain(|_, slot| matches!(slot, Slot::InFlight(_)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RowKey;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    fn sample_table(value: f64) -> Table {
        let key = RowKey::new("000001.SZ", NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        Table::builder(vec![key])
            .float("close", vec![Some(value)])
            .unwrap()
            .build()
    }

    #[test]
    fn hit_within_ttl_returns_identical_table() {
        let cache = TableCache::new(Duration::from_secs(60));
        let key = CacheKey("k1".into());

        let (first, status) = cache.get_or_fetch(&key, far_deadline(), || Ok(sample_table(1.0)));
        assert_eq!(status, CacheStatus::Miss);

        let (second, status) = cache.get_or_fetch(&key, far_deadline(), || panic!("must not fetch on a hit"));
        assert_eq!(status, CacheStatus::Hit);
        assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
    }

    #[test]
    fn stale_entry_triggers_fresh_fetch() {
        let cache = TableCache::new(Duration::from_millis(10));
        let key = CacheKey("k1".into());

        cache.get_or_fetch(&key, far_deadline(), || Ok(sample_table(1.0)));
        std::thread::sleep(Duration::from_millis(25));

        let (table, status) = cache.get_or_fetch(&key, far_deadline(), || Ok(sample_table(2.0)));
        assert_eq!(status, CacheStatus::Miss);
        assert_eq!(
            table.unwrap().float_column("close").unwrap(),
            &[Some(2.0)]
        );
    }

    #[test]
    fn failed_fetch_is_not_cached() {
        let cache = TableCache::new(Duration::from_secs(60));
        let key = CacheKey("k1".into());

        let (result, _) = cache.get_or_fetch(&key, far_deadline(), || {
            Err(FetchError::ProviderUnavailable("down".into()))
        });
        assert!(result.is_err());

        let (result, status) = cache.get_or_fetch(&key, far_deadline(), || Ok(sample_table(1.0)));
        assert_eq!(status, CacheStatus::Miss);
        assert!(result.is_ok());
    }

    #[test]
    fn concurrent_lookups_collapse_into_one_fetch() {
        let cache = Arc::new(TableCache::new(Duration::from_secs(60)));
        let key = CacheKey("shared".into());
        let fetches = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let key = key.clone();
                let fetches = fetches.clone();
                std::thread::spawn(move || {
                    let (result, _) = cache.get_or_fetch(&key, far_deadline(), || {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        // Hold the flight open long enough for others to pile on.
                        std::thread::sleep(Duration::from_millis(50));
                        Ok(sample_table(7.0))
                    });
                    result.unwrap()
                })
            })
            .collect();

        let tables: Vec<Arc<Table>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        for table in &tables[1..] {
            assert!(Arc::ptr_eq(&tables[0], table));
        }
    }

    #[test]
    fn waiters_observe_the_leader_error() {
        let cache = Arc::new(TableCache::new(Duration::from_secs(60)));
        let key = CacheKey("failing".into());

        let leader = {
            let cache = cache.clone();
            let key = key.clone();
            std::thread::spawn(move || {
                cache
                    .get_or_fetch(&key, far_deadline(), || {
                        std::thread::sleep(Duration::from_millis(50));
                        Err(FetchError::ProviderUnavailable("down".into()))
                    })
                    .0
            })
        };
        std::thread::sleep(Duration::from_millis(10));
        let (result, status) = cache.get_or_fetch(&key, far_deadline(), || panic!("waiter must not fetch"));

        assert_eq!(status, CacheStatus::Coalesced);
        assert!(matches!(result, Err(FetchError::ProviderUnavailable(_))));
        assert!(leader.join().unwrap().is_err());
    }

    #[test]
    fn waiter_deadline_cuts_a_coalesced_wait_short() {
        let cache = Arc::new(TableCache::new(Duration::from_secs(60)));
        let key = CacheKey("slow".into());

        let leader = {
            let cache = cache.clone();
            let key = key.clone();
            std::thread::spawn(move || {
                cache
                    .get_or_fetch(&key, far_deadline(), || {
                        std::thread::sleep(Duration::from_millis(400));
                        Ok(sample_table(1.0))
                    })
                    .0
            })
        };
        std::thread::sleep(Duration::from_millis(50));

        // The waiter's own deadline expires long before the leader finishes.
        let started = Instant::now();
        let (result, status) =
            cache.get_or_fetch(&key, started + Duration::from_millis(50), || {
                panic!("waiter must not fetch")
            });
        assert_eq!(status, CacheStatus::Coalesced);
        assert!(matches!(result, Err(FetchError::DeadlineExceeded { .. })));
        assert!(started.elapsed() < Duration::from_millis(300));

        // The leader is unaffected and later callers see its table.
        assert!(leader.join().unwrap().is_ok());
        let (cached, status) =
            cache.get_or_fetch(&key, far_deadline(), || panic!("must be cached by now"));
        assert_eq!(status, CacheStatus::Hit);
        assert!(cached.is_ok());
    }
}
