use crate::PlayError;
use async_trait::async_trait;
use derive_builder::Builder;
use std::time::Duration;
use tokio::time::Instant;

/// Multiplicative backoff growth between attempts.
const BACKOFF_FACTOR: f64 = 1.25;

/// Parameters for one bounded retry loop.
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into))]
pub struct RetryPolicy {
    /// Total wall-clock budget before the loop fails with a timeout.
    #[builder(default = "Duration::from_secs(30)")]
    pub timeout: Duration,
    /// Sleep between the first attempts, before backoff growth kicks in.
    #[builder(default = "Duration::from_millis(50)")]
    pub initial_interval: Duration,
    /// Cap on the backoff interval.
    #[builder(default = "Duration::from_secs(5)")]
    pub max_interval: Duration,
    /// One-off sleep before the very first attempt. Fresh installs and
    /// processes need a moment before any probe is meaningful.
    #[builder(default = "Duration::from_millis(100)")]
    pub lead_delay: Duration,
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    /// Next sleep interval after `current`, grown by the backoff factor and
    /// capped at `max_interval`.
    pub fn next_interval(&self, current: Duration) -> Duration {
        current.mul_f64(BACKOFF_FACTOR).min(self.max_interval)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            timeout: Duration::from_secs(30),
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(5),
            lead_delay: Duration::from_millis(100),
        }
    }
}

/// One pollable readiness condition.
///
/// `Ok(Some(v))` terminates the loop with `v`, `Ok(None)` means "not yet",
/// and `Err(_)` is fatal: the condition can never become true (for example
/// the process being probed already exited), so the loop aborts immediately
/// instead of burning the rest of its timeout budget.
#[async_trait]
pub trait PollTarget: Send {
    type Output: Send;

    async fn attempt(&mut self) -> Result<Option<Self::Output>, PlayError>;
}

/// Adapter turning a plain closure into a [`PollTarget`].
pub struct PollFn<F>(F);

pub fn poll_fn<T, F>(f: F) -> PollFn<F>
where
    T: Send,
    F: FnMut() -> Result<Option<T>, PlayError> + Send,
{
    PollFn(f)
}

#[async_trait]
impl<T, F> PollTarget for PollFn<F>
where
    T: Send,
    F: FnMut() -> Result<Option<T>, PlayError> + Send,
{
    type Output = T;

    async fn attempt(&mut self) -> Result<Option<T>, PlayError> {
        (self.0)()
    }
}

/// Drives `target` until it yields a value, fails, or the policy's wall-clock
/// budget runs out. `what` names the awaited condition in the timeout error.
pub async fn poll_until<P: PollTarget>(
    policy: &RetryPolicy,
    what: &str,
    target: &mut P,
) -> Result<P::Output, PlayError> {
    let begin = Instant::now();
    if !policy.lead_delay.is_zero() {
        tokio::time::sleep(policy.lead_delay).await;
    }
    let mut interval = policy.initial_interval;
    loop {
        if let Some(value) = target.attempt().await? {
            return Ok(value);
        }
        if begin.elapsed() >= policy.timeout {
            return Err(PlayError::timeout(what, begin.elapsed()));
        }
        tokio::time::sleep(interval).await;
        interval = policy.next_interval(interval);
    }
}
