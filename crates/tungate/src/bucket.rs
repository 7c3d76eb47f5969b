//! Single-key token bucket.
//!
//! Tokens are not refilled by a timer. Each access computes how many tokens
//! accrued since the last update and caps the result at the burst, so an
//! idle bucket costs nothing.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::WaitError;

/// Token bucket refilled at `rate` tokens per second up to `burst`
pub struct TokenBucket {
    rate: f64,
    burst: u32,
    state: Mutex<BucketState>,
}

struct BucketState {
    /// Token balance as of `last`; negative while reservations are pending
    tokens: f64,
    last: Instant,
    /// When the most recent reservation may act
    last_event: Instant,
    /// Last time anyone asked this bucket for a token
    touched: Instant,
}

enum Denied {
    Burst,
    Never,
    TooLong(Duration),
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// A rate of `f64::INFINITY` admits everything; negative or NaN rates
    /// are treated as zero.
    pub fn new(rate: f64, burst: u32) -> Self {
        let now = Instant::now();
        Self {
            rate: if rate.is_nan() { 0.0 } else { rate.max(0.0) },
            burst,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last: now,
                last_event: now,
                touched: now,
            }),
        }
    }

    /// Take a token if one is available right now
    pub fn allow(&self) -> bool {
        let now = Instant::now();
        let mut st = self.state.lock();
        self.reserve_locked(&mut st, now, Some(Duration::ZERO)).is_ok()
    }

    /// Take a token now, possibly on credit, and report when it may be used
    pub fn reserve(self: &Arc<Self>) -> Reservation {
        let now = Instant::now();
        let granted = {
            let mut st = self.state.lock();
            self.reserve_locked(&mut st, now, None)
        };
        match granted {
            Ok(time_to_act) => Reservation {
                bucket: Arc::clone(self),
                ok: true,
                time_to_act,
            },
            Err(_) => Reservation {
                bucket: Arc::clone(self),
                ok: false,
                time_to_act: now,
            },
        }
    }

    /// Wait until a token is available or `cancel` completes.
    ///
    /// On cancellation the reserved token is handed back.
    pub async fn wait<F>(&self, cancel: F) -> Result<(), WaitError>
    where
        F: Future<Output = ()>,
    {
        let now = Instant::now();
        let time_to_act = {
            let mut st = self.state.lock();
            self.reserve_locked(&mut st, now, None)
        }
        .map_err(|denied| self.wait_error(denied, Duration::MAX))?;

        if time_to_act <= now {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep_until(time_to_act) => Ok(()),
            _ = cancel => {
                self.cancel_at(time_to_act, Instant::now());
                Err(WaitError::Cancelled)
            }
        }
    }

    /// Wait for a token for at most `timeout`.
    ///
    /// Fails immediately, without consuming anything, when the token could
    /// not arrive in time.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<(), WaitError> {
        let now = Instant::now();
        let time_to_act = {
            let mut st = self.state.lock();
            self.reserve_locked(&mut st, now, Some(timeout))
        }
        .map_err(|denied| self.wait_error(denied, timeout))?;

        tokio::time::sleep_until(time_to_act).await;
        Ok(())
    }

    /// True when the bucket has been left alone for `idle_for` and has
    /// refilled completely, so dropping it loses no state.
    pub fn is_reclaimable(&self, now: Instant, idle_for: Duration) -> bool {
        let st = self.state.lock();
        if now.saturating_duration_since(st.touched) < idle_for {
            return false;
        }
        self.rate.is_infinite() || self.advance(&st, now) >= self.burst as f64
    }

    fn reserve_locked(
        &self,
        st: &mut BucketState,
        now: Instant,
        max_wait: Option<Duration>,
    ) -> Result<Instant, Denied> {
        st.touched = now;

        if self.rate.is_infinite() {
            return Ok(now);
        }
        if self.burst == 0 {
            return Err(Denied::Burst);
        }

        let tokens = self.advance(st, now) - 1.0;
        let wait = if tokens < 0.0 {
            self.duration_from_tokens(-tokens).ok_or(Denied::Never)?
        } else {
            Duration::ZERO
        };

        if let Some(max_wait) = max_wait {
            if wait > max_wait {
                return Err(Denied::TooLong(wait));
            }
        }

        let time_to_act = now.checked_add(wait).ok_or(Denied::Never)?;
        st.last = now;
        st.tokens = tokens;
        st.last_event = time_to_act;
        Ok(time_to_act)
    }

    /// Return a reserved token if its reservation has not matured yet
    fn cancel_at(&self, time_to_act: Instant, now: Instant) {
        if self.rate.is_infinite() || time_to_act < now {
            return;
        }

        let mut st = self.state.lock();
        // Tokens reserved after this one stay reserved.
        let later = self.tokens_from_duration(st.last_event.saturating_duration_since(time_to_act));
        let restore = 1.0 - later;
        if restore <= 0.0 {
            return;
        }

        st.tokens = (self.advance(&st, now) + restore).min(self.burst as f64);
        st.last = now;

        if time_to_act == st.last_event {
            let previous = self
                .duration_from_tokens(1.0)
                .and_then(|step| time_to_act.checked_sub(step));
            if let Some(previous) = previous {
                if previous >= now {
                    st.last_event = previous;
                }
            }
        }
    }

    fn advance(&self, st: &BucketState, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(st.last);
        let refilled = st.tokens + self.tokens_from_duration(elapsed);
        refilled.min(self.burst as f64)
    }

    fn duration_from_tokens(&self, tokens: f64) -> Option<Duration> {
        if self.rate <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(tokens / self.rate).ok()
    }

    fn tokens_from_duration(&self, d: Duration) -> f64 {
        d.as_secs_f64() * self.rate
    }

    fn wait_error(&self, denied: Denied, timeout: Duration) -> WaitError {
        match denied {
            Denied::Burst => WaitError::ExceedsBurst { burst: self.burst },
            Denied::Never => WaitError::NeverAvailable,
            Denied::TooLong(needed) => WaitError::DeadlineExceeded { timeout, needed },
        }
    }
}

/// A token taken ahead of time.
///
/// The caller decides whether to sleep for [`delay`](Self::delay), act at
/// once, or give the token back with [`cancel`](Self::cancel).
pub struct Reservation {
    bucket: Arc<TokenBucket>,
    ok: bool,
    time_to_act: Instant,
}

impl Reservation {
    /// Whether a token could be reserved at all
    pub fn ok(&self) -> bool {
        self.ok
    }

    /// Time left until the reserved token may be used
    pub fn delay(&self) -> Duration {
        self.delay_from(Instant::now())
    }

    /// Delay measured from `now`; `Duration::MAX` if nothing was reserved
    pub fn delay_from(&self, now: Instant) -> Duration {
        if !self.ok {
            return Duration::MAX;
        }
        self.time_to_act.saturating_duration_since(now)
    }

    /// Give the token back if the reservation has not matured
    pub fn cancel(self) {
        if self.ok {
            self.bucket.cancel_at(self.time_to_act, Instant::now());
        }
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("ok", &self.ok)
            .field("time_to_act", &self.time_to_act)
            .finish()
    }
}
