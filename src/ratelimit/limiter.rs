//! Core rate limiter implementation.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, instrument, trace};

use super::clock::{Clock, SystemClock};
use super::key::{IdentifierResolver, LimitKey};
use super::local::LocalWindowStore;
use super::policy::{AdmissionPolicy, Counting};
use super::store::WindowStore;

/// Outcome of checking one policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    /// Whether the attempt is admitted
    pub allowed: bool,
    /// Attempts in the trailing window, this one included when recorded
    pub current_count: u64,
    /// The policy's `max_requests`
    pub limit: u64,
    /// Admissions left in the current window
    pub remaining: u64,
    /// Seconds until the oldest in-window attempt ages out; only on denial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<f64>,
}

impl Verdict {
    /// Verdict used when no store could answer and the deployment fails
    /// closed.
    fn unavailable(policy: &AdmissionPolicy) -> Self {
        Self {
            allowed: false,
            current_count: 0,
            limit: policy.max_requests(),
            remaining: 0,
            retry_after_seconds: Some(policy.period_secs()),
        }
    }
}

/// A verdict tagged with the policy that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyVerdict {
    pub scope: String,
    pub global: bool,
    #[serde(flatten)]
    pub verdict: Verdict,
}

/// Combined outcome of every policy guarding one call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    /// False if any policy denied
    pub allowed: bool,
    /// Longest retry hint among the denials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<f64>,
    pub verdicts: Vec<PolicyVerdict>,
}

impl Decision {
    fn from_verdicts(verdicts: Vec<PolicyVerdict>) -> Self {
        let allowed = verdicts.iter().all(|v| v.verdict.allowed);
        let retry_after_seconds = verdicts
            .iter()
            .filter_map(|v| v.verdict.retry_after_seconds)
            .reduce(f64::max);
        Self {
            allowed,
            retry_after_seconds,
            verdicts,
        }
    }
}

/// The single entry point guarding an operation.
///
/// The limiter holds no per-call state of its own; every window lives in
/// the store, so several limiters (one per process) can share a store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    resolver: IdentifierResolver,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter over `store` using the system clock and hashed keys.
    pub fn new(store: Arc<dyn WindowStore>) -> Self {
        Self {
            store,
            resolver: IdentifierResolver::new(),
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// Create a limiter over a fresh in-process store.
    pub fn local() -> Self {
        Self::new(Arc::new(LocalWindowStore::new()))
    }

    pub fn with_resolver(mut self, resolver: IdentifierResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn WindowStore> {
        &self.store
    }

    pub fn resolver(&self) -> &IdentifierResolver {
        &self.resolver
    }

    /// The key a policy/subject pair is counted under.
    ///
    /// Keys derive from the policy's window scope, so limits stacked on the
    /// same scope never share a window.
    pub fn key_for(&self, policy: &AdmissionPolicy, subject: &str) -> LimitKey {
        if policy.is_global() {
            self.resolver.resolve_global(&policy.window_scope())
        } else {
            self.resolver.resolve(&policy.window_scope(), subject)
        }
    }

    /// Check one policy for `subject`.
    ///
    /// The attempt is recorded before the limit is evaluated (unless the
    /// policy uses strict counting), so a denied call still occupies a slot.
    /// Global policies ignore `subject`. The raw subject is never logged;
    /// events carry the resolved key instead.
    #[instrument(skip(self, policy, subject), fields(scope = %policy.scope()))]
    pub async fn check(&self, policy: &AdmissionPolicy, subject: &str) -> Verdict {
        let key = self.key_for(policy, subject);
        self.check_key(policy, &key).await
    }

    /// Check a policy against the caller-independent global window.
    pub async fn check_global(&self, policy: &AdmissionPolicy) -> Verdict {
        let key = self.resolver.resolve_global(&policy.window_scope());
        self.check_key(policy, &key).await
    }

    /// Check every policy for `subject` and combine the verdicts.
    ///
    /// All policies are evaluated and recorded, even when one of them alone
    /// already denies the call.
    #[instrument(skip(self, policies, subject), fields(policies = policies.len()))]
    pub async fn check_all(&self, policies: &[AdmissionPolicy], subject: &str) -> Decision {
        let checks = policies.iter().map(|policy| async move {
            PolicyVerdict {
                scope: policy.scope().to_string(),
                global: policy.is_global(),
                verdict: self.check(policy, subject).await,
            }
        });
        Decision::from_verdicts(join_all(checks).await)
    }

    async fn check_key(&self, policy: &AdmissionPolicy, key: &LimitKey) -> Verdict {
        let now = self.clock.now();
        let period = policy.period();
        let limit = policy.max_requests();

        trace!(key = %key, now = now, "Checking rate limit");

        let result = match policy.counting() {
            Counting::WriteThenCheck => self.store.record_and_count(key, now, period).await,
            Counting::Strict => self.store.record_if_below(key, now, period, limit).await,
        };

        let sample = match result {
            Ok(sample) => sample,
            Err(e) => {
                debug!(key = %key, error = %e, "No window store available, denying");
                return Verdict::unavailable(policy);
            }
        };

        let allowed = match policy.counting() {
            Counting::WriteThenCheck => sample.count <= limit,
            Counting::Strict => sample.recorded,
        };

        let retry_after_seconds = if allowed {
            None
        } else {
            debug!(
                key = %key,
                count = sample.count,
                limit = limit,
                "Rate limit exceeded"
            );
            Some(sample.retry_after(now, period))
        };

        Verdict {
            allowed,
            current_count: sample.count,
            limit,
            remaining: limit.saturating_sub(sample.count),
            retry_after_seconds,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::local()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &self.store.name())
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::failover::tests::FlakyStore;
    use crate::ratelimit::failover::{FailoverStore, FallbackMode};
    use std::time::Duration;

    const START: f64 = 1_700_000_000.0;

    fn limiter_with_clock() -> (RateLimiter, ManualClock, Arc<LocalWindowStore>) {
        let clock = ManualClock::new(START);
        let store = Arc::new(LocalWindowStore::new());
        let limiter = RateLimiter::new(store.clone()).with_clock(Arc::new(clock.clone()));
        (limiter, clock, store)
    }

    fn login_policy() -> AdmissionPolicy {
        AdmissionPolicy::new("login", 5, Duration::from_secs(60)).unwrap()
    }

    #[tokio::test]
    async fn test_five_allowed_then_denied() {
        let (limiter, _clock, _store) = limiter_with_clock();
        let policy = login_policy();

        for expected in 1..=5 {
            let verdict = limiter.check(&policy, "addr:203.0.113.4").await;
            assert!(verdict.allowed, "Request {} should be allowed", expected);
            assert_eq!(verdict.current_count, expected);
            assert_eq!(verdict.remaining, 5 - expected);
            assert_eq!(verdict.retry_after_seconds, None);
        }

        let verdict = limiter.check(&policy, "addr:203.0.113.4").await;
        assert!(!verdict.allowed);
        assert_eq!(verdict.current_count, 6);
        assert_eq!(verdict.remaining, 0);
        assert_eq!(verdict.retry_after_seconds, Some(60.0));
    }

    #[tokio::test]
    async fn test_window_rolls_forward() {
        let (limiter, clock, _store) = limiter_with_clock();
        let policy = login_policy();

        for _ in 0..6 {
            limiter.check(&policy, "addr:203.0.113.4").await;
        }

        clock.advance(Duration::from_secs(61));
        let verdict = limiter.check(&policy, "addr:203.0.113.4").await;
        assert!(verdict.allowed);
        assert_eq!(verdict.current_count, 1);
    }

    #[tokio::test]
    async fn test_retry_after_tracks_oldest_entry() {
        let (limiter, clock, _store) = limiter_with_clock();
        let policy = login_policy();

        for _ in 0..5 {
            limiter.check(&policy, "s").await;
            clock.advance(Duration::from_secs(10));
        }

        // Oldest entry at START, now is START + 50
        let verdict = limiter.check(&policy, "s").await;
        assert!(!verdict.allowed);
        assert_eq!(verdict.retry_after_seconds, Some(10.0));
    }

    #[tokio::test]
    async fn test_denied_attempts_extend_lockout() {
        let (limiter, clock, _store) = limiter_with_clock();
        let policy = login_policy();

        for _ in 0..5 {
            assert!(limiter.check(&policy, "s").await.allowed);
        }
        clock.advance(Duration::from_secs(30));
        assert!(!limiter.check(&policy, "s").await.allowed);

        // The five admitted attempts have aged out, the denied one has not
        clock.advance(Duration::from_secs(31));
        let verdict = limiter.check(&policy, "s").await;
        assert!(verdict.allowed);
        assert_eq!(verdict.current_count, 2);
    }

    #[tokio::test]
    async fn test_strict_counting_does_not_record_denials() {
        let (limiter, _clock, store) = limiter_with_clock();
        let policy = login_policy().with_counting(Counting::Strict);

        for _ in 0..5 {
            assert!(limiter.check(&policy, "s").await.allowed);
        }
        for _ in 0..3 {
            let verdict = limiter.check(&policy, "s").await;
            assert!(!verdict.allowed);
            assert_eq!(verdict.current_count, 5);
        }

        let key = limiter.key_for(&policy, "s");
        assert_eq!(store.size(&key).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_subjects_are_isolated() {
        let (limiter, _clock, _store) = limiter_with_clock();
        let policy = login_policy();

        for _ in 0..5 {
            limiter.check(&policy, "addr:198.51.100.1").await;
        }
        let verdict = limiter.check(&policy, "addr:198.51.100.2").await;
        assert!(verdict.allowed);
        assert_eq!(verdict.current_count, 1);
    }

    #[tokio::test]
    async fn test_global_policy_aggregates_subjects() {
        let (limiter, _clock, _store) = limiter_with_clock();
        let policy = AdmissionPolicy::global("predict", 3, Duration::from_secs(10)).unwrap();

        for subject in ["a", "b", "c"] {
            assert!(limiter.check(&policy, subject).await.allowed);
        }
        let verdict = limiter.check(&policy, "d").await;
        assert!(!verdict.allowed);
        assert_eq!(verdict.current_count, 4);
    }

    #[tokio::test]
    async fn test_check_global_uses_shared_window() {
        let (limiter, _clock, _store) = limiter_with_clock();
        let policy = AdmissionPolicy::new("predict", 2, Duration::from_secs(10)).unwrap();

        limiter.check_global(&policy).await;
        limiter.check_global(&policy).await;
        assert!(!limiter.check_global(&policy).await.allowed);

        // The per-subject window for the same scope is untouched
        assert!(limiter.check(&policy, "a").await.allowed);
    }

    #[tokio::test]
    async fn test_empty_subject_is_still_limited() {
        let (limiter, _clock, _store) = limiter_with_clock();
        let policy = AdmissionPolicy::new("login", 1, Duration::from_secs(60)).unwrap();

        assert!(limiter.check(&policy, "").await.allowed);
        assert!(!limiter.check(&policy, "").await.allowed);
    }

    #[tokio::test]
    async fn test_check_all_records_every_policy() {
        let (limiter, _clock, store) = limiter_with_clock();
        let per_subject = AdmissionPolicy::new("login", 1, Duration::from_secs(60)).unwrap();
        let global = AdmissionPolicy::global("login-all", 10, Duration::from_secs(60)).unwrap();
        let policies = vec![per_subject.clone(), global.clone()];

        let first = limiter.check_all(&policies, "a").await;
        assert!(first.allowed);
        assert_eq!(first.verdicts.len(), 2);

        let second = limiter.check_all(&policies, "a").await;
        assert!(!second.allowed);
        assert_eq!(second.retry_after_seconds, Some(60.0));
        assert!(!second.verdicts[0].verdict.allowed);
        assert!(second.verdicts[1].verdict.allowed);

        // The global window counted the denied call too
        let global_key = limiter.key_for(&global, "a");
        assert_eq!(store.size(&global_key).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stacked_limits_keep_separate_windows() {
        let (limiter, clock, _store) = limiter_with_clock();
        let minute = AdmissionPolicy::new("user", 5, Duration::from_secs(60)).unwrap();
        let hour = AdmissionPolicy::new("user", 100, Duration::from_secs(3600)).unwrap();
        let policies = vec![minute.clone(), hour.clone()];
        assert_ne!(limiter.key_for(&minute, "s"), limiter.key_for(&hour, "s"));

        for expected in 1..=5 {
            let decision = limiter.check_all(&policies, "s").await;
            assert!(decision.allowed, "Request {} should be allowed", expected);
            assert_eq!(decision.verdicts[0].verdict.current_count, expected);
            assert_eq!(decision.verdicts[1].verdict.current_count, expected);
        }

        let denied = limiter.check_all(&policies, "s").await;
        assert!(!denied.allowed);
        assert!(!denied.verdicts[0].verdict.allowed);
        assert!(denied.verdicts[1].verdict.allowed);

        // The minute window has rolled over; the hour still holds all six
        clock.advance(Duration::from_secs(120));
        let decision = limiter.check_all(&policies, "s").await;
        assert!(decision.allowed);
        assert_eq!(decision.verdicts[0].verdict.current_count, 1);
        assert_eq!(decision.verdicts[1].verdict.current_count, 7);
    }

    #[tokio::test]
    async fn test_stacked_global_limits_keep_separate_windows() {
        let (limiter, _clock, _store) = limiter_with_clock();
        let burst = AdmissionPolicy::global("predict", 2, Duration::from_secs(1)).unwrap();
        let sustained = AdmissionPolicy::global("predict", 50, Duration::from_secs(60)).unwrap();
        let policies = vec![burst, sustained];

        for subject in ["a", "b"] {
            assert!(limiter.check_all(&policies, subject).await.allowed);
        }
        let decision = limiter.check_all(&policies, "c").await;
        assert!(!decision.allowed);
        assert_eq!(decision.verdicts[0].verdict.current_count, 3);
        assert_eq!(decision.verdicts[1].verdict.current_count, 3);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn test_raw_subject_never_logged() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(logs.clone())
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);

        let (limiter, _clock, _store) = limiter_with_clock();
        let policy = AdmissionPolicy::new("login", 1, Duration::from_secs(60)).unwrap();
        limiter.check(&policy, "key:sk-live-4f9a").await;
        limiter.check(&policy, "key:sk-live-4f9a").await;
        limiter.check_all(&[policy], "key:sk-live-4f9a").await;
        drop(guard);

        let output = String::from_utf8(logs.0.lock().clone()).unwrap();
        assert!(output.contains("Rate limit exceeded"));
        assert!(!output.contains("sk-live-4f9a"));
    }

    #[tokio::test]
    async fn test_fallback_keeps_limiting_during_outage() {
        let clock = ManualClock::new(START);
        let primary = Arc::new(FlakyStore::new(false));
        let failover = Arc::new(FailoverStore::new(
            primary,
            Arc::new(LocalWindowStore::new()),
            FallbackMode::Local,
        ));
        let limiter = RateLimiter::new(failover.clone()).with_clock(Arc::new(clock));
        let policy = login_policy();

        for expected in 1..=5 {
            let verdict = limiter.check(&policy, "s").await;
            assert!(verdict.allowed);
            assert_eq!(verdict.current_count, expected);
        }
        assert!(!limiter.check(&policy, "s").await.allowed);
        assert!(failover.is_degraded());
    }

    #[tokio::test]
    async fn test_fail_closed_denies_during_outage() {
        let failover = Arc::new(FailoverStore::new(
            Arc::new(FlakyStore::new(false)),
            Arc::new(LocalWindowStore::new()),
            FallbackMode::Deny,
        ));
        let limiter = RateLimiter::new(failover);
        let policy = login_policy();

        let verdict = limiter.check(&policy, "s").await;
        assert!(!verdict.allowed);
        assert_eq!(verdict.current_count, 0);
        assert_eq!(verdict.retry_after_seconds, Some(60.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_have_no_lost_updates() {
        let (limiter, _clock, store) = limiter_with_clock();
        let limiter = Arc::new(limiter);
        let policy = Arc::new(login_policy());
        const N: usize = 40;

        let handles: Vec<_> = (0..N)
            .map(|_| {
                let limiter = limiter.clone();
                let policy = policy.clone();
                tokio::spawn(async move { limiter.check(&policy, "s").await })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().allowed {
                allowed += 1;
            }
        }

        assert_eq!(allowed, 5);
        let key = limiter.key_for(&policy, "s");
        assert_eq!(store.size(&key).await.unwrap(), N as u64);
    }

    #[test]
    fn test_verdict_serialization() {
        let verdict = Verdict {
            allowed: false,
            current_count: 6,
            limit: 5,
            remaining: 0,
            retry_after_seconds: Some(12.5),
        };
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["allowed"], false);
        assert_eq!(json["retry_after_seconds"], 12.5);

        let allowed = Verdict {
            allowed: true,
            retry_after_seconds: None,
            ..verdict
        };
        let json = serde_json::to_value(&allowed).unwrap();
        assert!(json.get("retry_after_seconds").is_none());
    }

    #[test]
    fn test_check_from_sync_context() {
        let limiter = RateLimiter::local();
        let policy = login_policy();
        let verdict = tokio_test::block_on(limiter.check(&policy, "s"));
        assert!(verdict.allowed);
    }
}
