use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{self, Instant};

use crate::FailureClass;

const DEFAULT_GRACE_MS: u64 = 2000;

/// An API key. Debug and Display only ever show the last four characters.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn masked(&self) -> String {
        let tail: String = self
            .0
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("...{tail}")
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.masked())
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("all {size} credentials in pool '{pool}' are cooling down")]
pub struct CredentialExhausted {
    pub pool: String,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownPolicy {
    pub quota: Duration,
    pub invalid_key: Duration,
    pub server_error: Duration,
    pub rate_limit: Duration,
    pub generic: Duration,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            quota: Duration::from_secs(24 * 60 * 60),
            invalid_key: Duration::from_secs(365 * 24 * 60 * 60),
            server_error: Duration::from_secs(120),
            rate_limit: Duration::from_secs(65),
            generic: Duration::from_secs(65),
        }
    }
}

impl CooldownPolicy {
    pub fn duration_for(&self, class: FailureClass) -> Duration {
        match class {
            FailureClass::Quota => self.quota,
            FailureClass::InvalidKey => self.invalid_key,
            FailureClass::ServerError => self.server_error,
            FailureClass::RateLimit => self.rate_limit,
            FailureClass::Generic => self.generic,
        }
    }
}

/// Whether a successful `acquire` moves the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    /// Keep handing out the same credential until it fails.
    #[default]
    Sticky,
    /// Advance after every hand-out.
    RoundRobin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    pub grace: Duration,
    pub cooldowns: CooldownPolicy,
    pub rotation: RotationMode,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(DEFAULT_GRACE_MS),
            cooldowns: CooldownPolicy::default(),
            rotation: RotationMode::Sticky,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub pool: String,
    pub size: usize,
    pub available: usize,
    pub cooling_down: usize,
    pub failure_streak: usize,
}

#[derive(Debug)]
struct PoolState {
    current_index: usize,
    failure_streak: usize,
    last_failure: Option<Instant>,
    cooldown_until: Vec<Option<Instant>>,
}

impl PoolState {
    fn is_available(&self, index: usize, now: Instant) -> bool {
        match self.cooldown_until.get(index).copied().flatten() {
            Some(until) => now >= until,
            None => true,
        }
    }

    fn rotate(&mut self, len: usize) {
        if len > 0 {
            self.current_index = (self.current_index + 1) % len;
        }
    }
}

/// Rotating set of API credentials with per-credential cooldowns.
#[derive(Debug)]
pub struct CredentialPool {
    name: String,
    credentials: Vec<Credential>,
    options: PoolOptions,
    state: Mutex<PoolState>,
}

impl CredentialPool {
    pub fn new(name: impl Into<String>, credentials: Vec<Credential>, options: PoolOptions) -> Self {
        let name = name.into();
        if credentials.is_empty() {
            tracing::warn!("credential pool {name} created without credentials");
        } else {
            tracing::info!(
                "credential pool {name} initialized with {} credentials",
                credentials.len()
            );
        }
        let state = PoolState {
            current_index: 0,
            failure_streak: 0,
            last_failure: None,
            cooldown_until: vec![None; credentials.len()],
        };
        Self {
            name,
            credentials,
            options,
            state: Mutex::new(state),
        }
    }

    /// Build a pool from raw key strings; blank entries are skipped and
    /// comma-joined entries are split.
    pub fn from_keys<I, S>(name: impl Into<String>, keys: I, options: PoolOptions) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let credentials = keys
            .into_iter()
            .flat_map(|raw| {
                raw.as_ref()
                    .split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(Credential::new)
                    .collect::<Vec<_>>()
            })
            .collect();
        Self::new(name, credentials, options)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    fn exhausted(&self) -> CredentialExhausted {
        CredentialExhausted {
            pool: self.name.clone(),
            size: self.credentials.len(),
        }
    }

    /// Hand out the first usable credential at or after the cursor.
    ///
    /// When at least half the pool has failed in a row and the last failure was
    /// within the grace interval, the caller is held back for the remainder first.
    pub async fn acquire(&self) -> Result<Credential, CredentialExhausted> {
        let len = self.credentials.len();
        if len == 0 {
            return Err(self.exhausted());
        }

        let throttle = {
            let state = self.state.lock().await;
            match state.last_failure {
                Some(last) if state.failure_streak * 2 >= len => {
                    self.options.grace.checked_sub(last.elapsed())
                }
                _ => None,
            }
        };
        if let Some(wait) = throttle.filter(|w| !w.is_zero()) {
            tracing::warn!(
                "credential pool {} under failure burst, throttling for {:.2}s",
                self.name,
                wait.as_secs_f64()
            );
            time::sleep(wait).await;
        }

        let mut state = self.state.lock().await;
        let now = Instant::now();
        for _ in 0..len {
            let index = state.current_index;
            if state.is_available(index, now) {
                state.failure_streak = 0;
                if self.options.rotation == RotationMode::RoundRobin {
                    state.rotate(len);
                }
                return Ok(self.credentials[index].clone());
            }
            state.rotate(len);
        }

        tracing::warn!("credential pool {} exhausted: all {len} credentials cooling down", self.name);
        Err(self.exhausted())
    }

    /// Put `credential` on cooldown for the duration tied to `class` and move the cursor on.
    /// Credentials that do not belong to this pool are ignored.
    pub async fn report_failure(&self, credential: &Credential, class: FailureClass) {
        let Some(position) = self.credentials.iter().position(|c| c == credential) else {
            return;
        };
        let cooldown = self.options.cooldowns.duration_for(class);

        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.last_failure = Some(now);
        state.failure_streak += 1;
        state.cooldown_until[position] = Some(now + cooldown);
        state.rotate(self.credentials.len());

        tracing::warn!(
            "credential {credential} in pool {} failed ({}), cooling down for {}s, streak {}",
            self.name,
            class.as_str(),
            cooldown.as_secs(),
            state.failure_streak
        );
    }

    /// Move the cursor to the next credential without penalizing the current one.
    pub async fn rotate(&self) {
        let mut state = self.state.lock().await;
        state.rotate(self.credentials.len());
    }

    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        let now = Instant::now();
        let available = (0..self.credentials.len())
            .filter(|&i| state.is_available(i, now))
            .count();
        PoolStatus {
            pool: self.name.clone(),
            size: self.credentials.len(),
            available,
            cooling_down: self.credentials.len() - available,
            failure_streak: state.failure_streak,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn pool(keys: &[&str], rotation: RotationMode) -> CredentialPool {
        CredentialPool::from_keys(
            "test",
            keys.iter().copied(),
            PoolOptions {
                rotation,
                ..PoolOptions::default()
            },
        )
    }

    #[tokio::test]
    async fn empty_pool_is_exhausted() {
        let pool = pool(&[], RotationMode::Sticky);
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.size, 0);
    }

    #[test]
    fn from_keys_splits_and_trims() {
        let pool = CredentialPool::from_keys("p", ["a, b,,c", " "], PoolOptions::default());
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn credential_debug_is_masked() {
        let c = Credential::new("sk-secret-1234");
        assert_eq!(format!("{c:?}"), "Credential(...1234)");
        assert!(!format!("{c}").contains("secret"));
    }

    #[tokio::test]
    async fn sticky_pool_keeps_cursor_until_rotation() {
        let pool = pool(&["k1", "k2", "k3"], RotationMode::Sticky);
        assert_eq!(pool.acquire().await.unwrap().expose(), "k1");
        assert_eq!(pool.acquire().await.unwrap().expose(), "k1");
        pool.rotate().await;
        assert_eq!(pool.acquire().await.unwrap().expose(), "k2");
    }

    #[tokio::test]
    async fn round_robin_hands_out_every_credential_before_repeating() {
        let keys = ["k1", "k2", "k3", "k4"];
        let pool = pool(&keys, RotationMode::RoundRobin);
        let mut seen = HashSet::new();
        for _ in 0..keys.len() {
            seen.insert(pool.acquire().await.unwrap().expose().to_string());
        }
        assert_eq!(seen.len(), keys.len());
        assert_eq!(pool.acquire().await.unwrap().expose(), "k1");
    }

    #[tokio::test(start_paused = true)]
    async fn quota_failure_keeps_credential_out_until_cooldown_expires() {
        let pool = pool(&["k1", "k2"], RotationMode::RoundRobin);
        let k1 = pool.acquire().await.unwrap();
        assert_eq!(k1.expose(), "k1");
        pool.report_failure(&k1, FailureClass::Quota).await;

        for _ in 0..6 {
            assert_ne!(pool.acquire().await.unwrap(), k1);
        }
        time::advance(Duration::from_secs(23 * 60 * 60)).await;
        for _ in 0..4 {
            assert_ne!(pool.acquire().await.unwrap(), k1);
        }

        time::advance(Duration::from_secs(60 * 60 + 1)).await;
        let mut handed_out = HashSet::new();
        for _ in 0..2 {
            handed_out.insert(pool.acquire().await.unwrap());
        }
        assert!(handed_out.contains(&k1));
    }

    #[tokio::test(start_paused = true)]
    async fn all_credentials_failed_raises_exhausted() {
        let pool = pool(&["k1", "k2", "k3"], RotationMode::Sticky);
        for key in ["k1", "k2", "k3"] {
            pool.report_failure(&Credential::new(key), FailureClass::RateLimit)
                .await;
        }
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.size, 3);
        assert_eq!(err.pool, "test");
    }

    #[tokio::test(start_paused = true)]
    async fn failure_burst_throttles_for_grace_interval() {
        let pool = pool(&["k1", "k2"], RotationMode::Sticky);
        pool.report_failure(&Credential::new("k1"), FailureClass::ServerError)
            .await;

        let started = Instant::now();
        let key = pool.acquire().await.unwrap();
        assert_eq!(key.expose(), "k2");
        assert!(started.elapsed() >= Duration::from_millis(DEFAULT_GRACE_MS));
    }

    #[tokio::test(start_paused = true)]
    async fn no_throttle_once_grace_has_passed() {
        let pool = pool(&["k1", "k2"], RotationMode::Sticky);
        pool.report_failure(&Credential::new("k1"), FailureClass::ServerError)
            .await;
        time::advance(Duration::from_secs(3)).await;

        let started = Instant::now();
        pool.acquire().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn successful_acquire_resets_failure_streak() {
        let pool = pool(&["k1", "k2", "k3", "k4"], RotationMode::Sticky);
        pool.report_failure(&Credential::new("k1"), FailureClass::RateLimit)
            .await;
        assert_eq!(pool.status().await.failure_streak, 1);
        pool.acquire().await.unwrap();
        let status = pool.status().await;
        assert_eq!(status.failure_streak, 0);
        assert_eq!(status.cooling_down, 1);
        assert_eq!(status.available, 3);
    }

    #[tokio::test]
    async fn unknown_credential_report_is_ignored() {
        let pool = pool(&["k1"], RotationMode::Sticky);
        pool.report_failure(&Credential::new("stranger"), FailureClass::Quota)
            .await;
        let status = pool.status().await;
        assert_eq!(status.failure_streak, 0);
        assert_eq!(pool.acquire().await.unwrap().expose(), "k1");
    }

    #[test]
    fn cooldown_policy_matches_failure_classes() {
        let policy = CooldownPolicy::default();
        assert_eq!(policy.duration_for(FailureClass::Quota), Duration::from_secs(86_400));
        assert_eq!(policy.duration_for(FailureClass::ServerError), Duration::from_secs(120));
        assert_eq!(policy.duration_for(FailureClass::RateLimit), Duration::from_secs(65));
        assert!(policy.duration_for(FailureClass::InvalidKey) > Duration::from_secs(300 * 86_400));
    }
}
