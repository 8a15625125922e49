//! Rate-limited credential rotation.
//!
//! Holds a pool of API credentials and tracks recent-use timestamps per
//! credential in a sliding window. `acquire` hands out the current
//! credential while it stays under the per-window limit and rotates
//! otherwise; when every credential is saturated it degrades gracefully
//! to the least-recently-selected one instead of failing.
//!
//! All pool state sits behind a single mutex so check-and-rotate is
//! atomic across concurrent requests. Critical sections never await.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::{GenerationConfig, RotationConfig};
use crate::generation::GenerationError;
use crate::PersonaError;

pub struct KeyPool {
    state: Mutex<PoolState>,
    rate_limit: usize,
    window: Duration,
}

struct PoolState {
    keys: Vec<String>,
    /// Index of the current credential in cyclic order
    current: usize,
    /// Recent-use instants per credential, pruned to the window
    history: HashMap<String, VecDeque<Instant>>,
    /// When each credential was last selected (for the saturated case)
    last_selected: Vec<Instant>,
}

impl KeyPool {
    pub fn new(
        keys: Vec<String>,
        rate_limit: usize,
        window: Duration,
    ) -> Result<Self, PersonaError> {
        if keys.is_empty() {
            return Err(PersonaError::InvalidInput(
                "no API credentials configured".to_string(),
            ));
        }

        let now = Instant::now();
        let history = keys
            .iter()
            .map(|k| (k.clone(), VecDeque::new()))
            .collect();
        let last_selected = vec![now; keys.len()];

        Ok(Self {
            state: Mutex::new(PoolState {
                keys,
                current: 0,
                history,
                last_selected,
            }),
            rate_limit,
            window,
        })
    }

    /// Build the pool from config, falling back to the
    /// PERSONA_API_KEY / PERSONA_API_KEY_2..4 environment variables when
    /// the config list is empty.
    pub fn from_config(
        generation: &GenerationConfig,
        rotation: &RotationConfig,
    ) -> Result<Self, PersonaError> {
        let keys = if generation.api_keys.is_empty() {
            ["PERSONA_API_KEY", "PERSONA_API_KEY_2", "PERSONA_API_KEY_3", "PERSONA_API_KEY_4"]
                .iter()
                .filter_map(|name| std::env::var(name).ok())
                .filter(|k| !k.is_empty())
                .collect()
        } else {
            generation.api_keys.clone()
        };

        Self::new(
            keys,
            rotation.rate_limit,
            Duration::from_secs(rotation.window_seconds),
        )
    }

    pub fn key_count(&self) -> usize {
        self.state.lock().expect("keypool mutex poisoned").keys.len()
    }

    /// Return an unsaturated credential, rotating past saturated ones.
    /// When every credential is saturated, returns the least-recently
    /// selected one rather than failing.
    pub fn acquire(&self) -> String {
        let mut state = self.state.lock().expect("keypool mutex poisoned");
        self.acquire_locked(&mut state)
    }

    /// Record a use of the given credential.
    pub fn record_use(&self, key: &str) {
        let mut state = self.state.lock().expect("keypool mutex poisoned");
        if let Some(entries) = state.history.get_mut(key) {
            entries.push_back(Instant::now());
        }
    }

    /// Advance the cyclic pointer unconditionally and return the new
    /// current credential.
    pub fn rotate(&self) -> String {
        let mut state = self.state.lock().expect("keypool mutex poisoned");
        let next = (state.current + 1) % state.keys.len();
        self.select_locked(&mut state, next)
    }

    /// Number of uses recorded for a credential inside the current window.
    pub fn recent_uses(&self, key: &str) -> usize {
        let mut state = self.state.lock().expect("keypool mutex poisoned");
        self.prune_locked(&mut state, key);
        state.history.get(key).map(|h| h.len()).unwrap_or(0)
    }

    /// Invoke `op` with an acquired credential, recording the use before
    /// the call. Rate-limit failures rotate and retry, up to one attempt
    /// per configured credential; any other failure propagates
    /// immediately. Exhausting every credential yields
    /// `GenerationError::AllKeysExhausted`.
    pub async fn with_rotation<T, F, Fut>(&self, op: F) -> Result<T, GenerationError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, GenerationError>>,
    {
        let attempts = self.key_count();

        for attempt in 0..attempts {
            // Acquire and record under one lock so two concurrent
            // requests cannot both count the same slot as free.
            let key = {
                let mut state = self.state.lock().expect("keypool mutex poisoned");
                let key = self.acquire_locked(&mut state);
                if let Some(entries) = state.history.get_mut(&key) {
                    entries.push_back(Instant::now());
                }
                key
            };

            match op(key).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_rate_limited() => {
                    if attempt + 1 < attempts {
                        tracing::warn!(
                            attempt = attempt + 1,
                            attempts,
                            "Rate limit hit, rotating to next credential"
                        );
                        self.rotate();
                    } else {
                        tracing::error!("All credentials rate limited");
                        return Err(GenerationError::AllKeysExhausted { attempts });
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(GenerationError::AllKeysExhausted { attempts })
    }

    fn acquire_locked(&self, state: &mut PoolState) -> String {
        let len = state.keys.len();
        let start = state.current;

        for offset in 0..len {
            let idx = (start + offset) % len;
            let key = state.keys[idx].clone();
            self.prune_locked(state, &key);
            let uses = state.history.get(&key).map(|h| h.len()).unwrap_or(0);
            if uses < self.rate_limit {
                return self.select_locked(state, idx);
            }
        }

        // Every credential saturated: fall back to the one selected
        // longest ago (closest to having window entries expire).
        let idx = state
            .last_selected
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| **t)
            .map(|(i, _)| i)
            .unwrap_or(start);
        self.select_locked(state, idx)
    }

    fn select_locked(&self, state: &mut PoolState, idx: usize) -> String {
        state.current = idx;
        state.last_selected[idx] = Instant::now();
        state.keys[idx].clone()
    }

    fn prune_locked(&self, state: &mut PoolState, key: &str) {
        let window = self.window;
        if let Some(entries) = state.history.get_mut(key) {
            let now = Instant::now();
            while let Some(front) = entries.front() {
                if now.duration_since(*front) >= window {
                    entries.pop_front();
                } else {
                    break;
                }
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(keys: &[&str], limit: usize) -> KeyPool {
        KeyPool::new(
            keys.iter().map(|k| k.to_string()).collect(),
            limit,
            Duration::from_secs(60),
        )
        .expect("pool construction failed")
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(KeyPool::new(Vec::new(), 15, Duration::from_secs(60)).is_err());
    }

    #[test]
    fn burst_rotates_and_never_exceeds_limit() {
        let pool = pool(&["key-a", "key-b"], 15);
        let mut rotated = false;

        for _ in 0..20 {
            let key = pool.acquire();
            pool.record_use(&key);
            if key == "key-b" {
                rotated = true;
            }
        }

        assert!(rotated, "burst of 20 against limit 15 must rotate at least once");
        assert!(pool.recent_uses("key-a") <= 15);
        assert!(pool.recent_uses("key-b") <= 15);
        assert_eq!(pool.recent_uses("key-a") + pool.recent_uses("key-b"), 20);
    }

    #[test]
    fn single_saturated_key_degrades_gracefully() {
        let pool = pool(&["only-key"], 2);
        for _ in 0..5 {
            let key = pool.acquire();
            assert_eq!(key, "only-key", "saturated pool still hands out a key");
            pool.record_use(&key);
        }
    }

    #[test]
    fn rotate_cycles_through_keys() {
        let pool = pool(&["a", "b", "c"], 15);
        assert_eq!(pool.rotate(), "b");
        assert_eq!(pool.rotate(), "c");
        assert_eq!(pool.rotate(), "a");
    }

    #[tokio::test]
    async fn with_rotation_retries_on_rate_limit() {
        let pool = pool(&["key-a", "key-b"], 15);

        let result = pool
            .with_rotation(|key| async move {
                if key == "key-a" {
                    Err(GenerationError::Api {
                        code: 429,
                        message: "rate limit exceeded".to_string(),
                    })
                } else {
                    Ok(format!("ok:{}", key))
                }
            })
            .await;

        assert_eq!(result.expect("should succeed on second key"), "ok:key-b");
    }

    #[tokio::test]
    async fn with_rotation_exhausts_all_keys() {
        let pool = pool(&["a", "b", "c"], 15);
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = pool
            .with_rotation(|_key| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(GenerationError::Api {
                        code: 429,
                        message: "quota exceeded".to_string(),
                    })
                }
            })
            .await;

        match result {
            Err(GenerationError::AllKeysExhausted { attempts }) => assert_eq!(attempts, 3),
            other => panic!("Expected AllKeysExhausted, got {:?}", other.err()),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3, "one attempt per credential");
    }

    #[tokio::test]
    async fn with_rotation_propagates_other_errors_immediately() {
        let pool = pool(&["a", "b"], 15);
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = pool
            .with_rotation(|_key| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(GenerationError::Api {
                        code: 500,
                        message: "internal error".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(GenerationError::Api { code: 500, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "no retry on non-rate-limit errors");
    }

    #[tokio::test]
    async fn with_rotation_records_usage() {
        let pool = pool(&["a"], 15);
        let _ = pool
            .with_rotation(|_key| async { Ok::<_, GenerationError>(()) })
            .await;
        assert_eq!(pool.recent_uses("a"), 1);
    }
}
