/*
 * Podcast Knowledge Pipeline - Rust Edition
 * Copyright (c) 2024 Podcast Knowledge Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

//! Multi-key rotation and quota management. One pool instance is shared by
//! the LLM and embedding clients so their consumption is coordinated.
//!
//! Per (key, model) the pool tracks a sliding minute window (requests and
//! tokens) and a fixed daily window. `acquire` reserves a request slot under
//! the pool mutex, so two workers can never double-book a key's minute
//! budget; `report` settles the reservation and persists state.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{IngestError, Result};

const MINUTE_MS: i64 = 60_000;
const INVALID_KEY_BACKOFF_START_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelBudget {
    pub requests_per_minute: u32,
    pub requests_per_day: u32,
    pub tokens_per_minute: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RateLimited,
    InvalidKey,
    TransientError,
}

/// Opaque lease on one key for one call. Must be settled with
/// [`KeyPool::report`].
#[derive(Debug)]
pub struct KeyHandle {
    pub api_key: String,
    pub model: String,
    key_index: usize,
    event_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WindowEvent {
    id: u64,
    at_ms: i64,
    tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct KeyModelState {
    minute_events: VecDeque<WindowEvent>,
    day: Option<NaiveDate>,
    day_requests: u32,
    /// Unix ms until which this (key, model) is blocked after a rate limit.
    blocked_until_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyEntry {
    /// SHA-256 fingerprint of the key; raw keys are never written to disk.
    fingerprint: String,
    #[serde(skip)]
    api_key: String,
    invalid_until_ms: Option<i64>,
    invalid_backoff_secs: u64,
    models: HashMap<String, KeyModelState>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    version: u32,
    saved_at: DateTime<Utc>,
    keys: Vec<KeyEntry>,
}

struct PoolInner {
    keys: Vec<KeyEntry>,
    budgets: HashMap<String, ModelBudget>,
    next_event_id: u64,
}

pub struct KeyPool {
    inner: Mutex<PoolInner>,
    state_path: PathBuf,
    day_reset_hour: u32,
}

fn fingerprint(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

impl KeyPool {
    pub fn new(
        api_keys: &[String],
        budgets: HashMap<String, ModelBudget>,
        state_path: PathBuf,
        day_reset_hour: u32,
    ) -> Self {
        let mut keys: Vec<KeyEntry> = api_keys
            .iter()
            .map(|k| KeyEntry {
                fingerprint: fingerprint(k),
                api_key: k.clone(),
                invalid_until_ms: None,
                invalid_backoff_secs: INVALID_KEY_BACKOFF_START_SECS,
                models: HashMap::new(),
            })
            .collect();

        let mut next_event_id = 1;
        if let Some(persisted) = Self::load_state(&state_path) {
            let today = Self::quota_day(Utc::now(), day_reset_hour);
            for entry in &mut keys {
                if let Some(saved) = persisted
                    .keys
                    .iter()
                    .find(|s| s.fingerprint == entry.fingerprint)
                {
                    entry.invalid_until_ms = saved.invalid_until_ms;
                    entry.invalid_backoff_secs = saved.invalid_backoff_secs;
                    entry.models = saved.models.clone();
                    for state in entry.models.values_mut() {
                        // Daily counters whose day has ended are reset.
                        if state.day != Some(today) {
                            state.day = Some(today);
                            state.day_requests = 0;
                        }
                        for event in &state.minute_events {
                            next_event_id = next_event_id.max(event.id + 1);
                        }
                    }
                }
            }
            debug!(path = %state_path.display(), "restored key pool state");
        }

        KeyPool {
            inner: Mutex::new(PoolInner {
                keys,
                budgets,
                next_event_id,
            }),
            state_path,
            day_reset_hour,
        }
    }

    /// The quota day a timestamp falls in, given the configured reset hour.
    fn quota_day(now: DateTime<Utc>, reset_hour: u32) -> NaiveDate {
        (now - ChronoDuration::hours(reset_hour as i64)).date_naive()
    }

    fn load_state(path: &PathBuf) -> Option<PersistedState> {
        let raw = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str::<PersistedState>(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable key pool state");
                None
            }
        }
    }

    fn persist(&self, inner: &PoolInner) {
        let state = PersistedState {
            version: 1,
            saved_at: Utc::now(),
            keys: inner.keys.clone(),
        };
        let result = (|| -> std::io::Result<()> {
            let parent = self
                .state_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."));
            let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
            tmp.write_all(serde_json::to_string_pretty(&state)?.as_bytes())?;
            tmp.persist(&self.state_path)
                .map_err(|e| e.error)?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(error = %e, "failed to persist key pool state");
        }
    }

    /// Acquire the key with the most headroom for `model`, suspending up to
    /// `deadline` when every key is exhausted or blocked.
    pub async fn acquire(&self, model: &str, deadline: Duration) -> Result<KeyHandle> {
        let started = tokio::time::Instant::now();
        loop {
            let now_ms = Utc::now().timestamp_millis();
            let decision = {
                let mut inner = self.inner.lock();
                self.try_acquire(&mut inner, model, now_ms)
            };
            match decision {
                AcquireDecision::Acquired(handle) => return Ok(handle),
                AcquireDecision::Wait(wake_ms) => {
                    let elapsed = started.elapsed();
                    if elapsed >= deadline {
                        return Err(IngestError::QuotaExhausted(format!(
                            "no key available for model '{}' within {:?}",
                            model, deadline
                        )));
                    }
                    let wait = Duration::from_millis((wake_ms - now_ms).max(50) as u64);
                    let remaining = deadline - elapsed;
                    tokio::time::sleep(wait.min(remaining)).await;
                }
            }
        }
    }

    fn try_acquire(&self, inner: &mut PoolInner, model: &str, now_ms: i64) -> AcquireDecision {
        let budget = match inner.budgets.get(model) {
            Some(b) => *b,
            None => ModelBudget {
                requests_per_minute: u32::MAX,
                requests_per_day: u32::MAX,
                tokens_per_minute: u64::MAX,
            },
        };
        let today = Self::quota_day(Utc::now(), self.day_reset_hour);

        let mut best: Option<(usize, f64, i64)> = None;
        let mut earliest_wake: Option<i64> = None;
        let note_wake = |candidate: i64, earliest: &mut Option<i64>| {
            *earliest = Some(match *earliest {
                Some(current) => current.min(candidate),
                None => candidate,
            });
        };

        for (index, key) in inner.keys.iter_mut().enumerate() {
            if let Some(until) = key.invalid_until_ms {
                if until > now_ms {
                    note_wake(until, &mut earliest_wake);
                    continue;
                }
                key.invalid_until_ms = None;
            }

            let state = key.models.entry(model.to_string()).or_default();
            while state
                .minute_events
                .front()
                .map_or(false, |e| e.at_ms + MINUTE_MS <= now_ms)
            {
                state.minute_events.pop_front();
            }
            if state.day != Some(today) {
                state.day = Some(today);
                state.day_requests = 0;
            }
            if let Some(until) = state.blocked_until_ms {
                if until > now_ms {
                    note_wake(until, &mut earliest_wake);
                    continue;
                }
                state.blocked_until_ms = None;
            }

            let used_requests = state.minute_events.len() as u32;
            let used_tokens: u64 = state.minute_events.iter().map(|e| e.tokens).sum();
            let window_expiry = state
                .minute_events
                .front()
                .map(|e| e.at_ms + MINUTE_MS)
                .unwrap_or(i64::MAX);

            if used_requests >= budget.requests_per_minute || used_tokens >= budget.tokens_per_minute
            {
                note_wake(window_expiry, &mut earliest_wake);
                continue;
            }
            if state.day_requests >= budget.requests_per_day {
                // Daily budget frees at the next reset boundary; the deadline
                // almost always expires first.
                note_wake(now_ms + MINUTE_MS, &mut earliest_wake);
                continue;
            }

            let rpm_headroom = 1.0
                - used_requests as f64 / budget.requests_per_minute.max(1) as f64;
            let rpd_headroom =
                1.0 - state.day_requests as f64 / budget.requests_per_day.max(1) as f64;
            let tpm_headroom = 1.0 - used_tokens as f64 / budget.tokens_per_minute.max(1) as f64;
            let headroom = rpm_headroom.min(rpd_headroom).min(tpm_headroom);

            let better = match best {
                None => true,
                Some((_, best_headroom, best_expiry)) => {
                    headroom > best_headroom
                        || (headroom == best_headroom && window_expiry < best_expiry)
                }
            };
            if better {
                best = Some((index, headroom, window_expiry));
            }
        }

        let Some((index, _, _)) = best else {
            return AcquireDecision::Wait(earliest_wake.unwrap_or(now_ms + MINUTE_MS));
        };

        let event_id = inner.next_event_id;
        inner.next_event_id += 1;
        let key = &mut inner.keys[index];
        let api_key = key.api_key.clone();
        let state = key.models.entry(model.to_string()).or_default();
        state.minute_events.push_back(WindowEvent {
            id: event_id,
            at_ms: now_ms,
            tokens: 0,
        });
        state.day_requests += 1;

        AcquireDecision::Acquired(KeyHandle {
            api_key,
            model: model.to_string(),
            key_index: index,
            event_id,
        })
    }

    /// Settle a lease. `tokens_used` only applies to `Success`.
    pub fn report(&self, handle: KeyHandle, outcome: Outcome, tokens_used: Option<u64>) {
        let now_ms = Utc::now().timestamp_millis();
        let mut inner = self.inner.lock();
        let Some(key) = inner.keys.get_mut(handle.key_index) else {
            return;
        };
        let Some(state) = key.models.get_mut(&handle.model) else {
            return;
        };

        match outcome {
            Outcome::Success => {
                if let Some(event) = state
                    .minute_events
                    .iter_mut()
                    .find(|e| e.id == handle.event_id)
                {
                    event.tokens = tokens_used.unwrap_or(0);
                }
                key.invalid_backoff_secs = INVALID_KEY_BACKOFF_START_SECS;
            }
            Outcome::RateLimited => {
                let window_expiry = state
                    .minute_events
                    .front()
                    .map(|e| e.at_ms + MINUTE_MS)
                    .unwrap_or(now_ms + MINUTE_MS);
                state.blocked_until_ms = Some(window_expiry.max(now_ms + 1_000));
                debug!(model = %handle.model, "key rate limited until window expiry");
            }
            Outcome::InvalidKey => {
                state.minute_events.retain(|e| e.id != handle.event_id);
                state.day_requests = state.day_requests.saturating_sub(1);
                key.invalid_until_ms = Some(now_ms + (key.invalid_backoff_secs as i64) * 1_000);
                key.invalid_backoff_secs = key.invalid_backoff_secs.saturating_mul(2);
                warn!(fingerprint = %key.fingerprint, "key marked invalid, backing off");
            }
            Outcome::TransientError => {
                // Transient failures do not penalize quota.
                state.minute_events.retain(|e| e.id != handle.event_id);
                state.day_requests = state.day_requests.saturating_sub(1);
            }
        }

        self.persist(&inner);
    }

    /// Remaining daily requests per key for `model`, for operator surfaces.
    pub fn headroom_summary(&self, model: &str) -> Vec<(String, u32)> {
        let inner = self.inner.lock();
        let budget_rpd = inner
            .budgets
            .get(model)
            .map(|b| b.requests_per_day)
            .unwrap_or(u32::MAX);
        inner
            .keys
            .iter()
            .map(|key| {
                let used = key
                    .models
                    .get(model)
                    .map(|s| s.day_requests)
                    .unwrap_or(0);
                (key.fingerprint.clone(), budget_rpd.saturating_sub(used))
            })
            .collect()
    }
}

enum AcquireDecision {
    Acquired(KeyHandle),
    Wait(i64),
}
