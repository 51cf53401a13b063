//! Bandwidth scheduling for download workers.
//!
//! Produces a token-bucket discipline per request: priority 0 bypasses
//! throttling entirely, everything else shares a global bucket whose rate
//! depends on whether the current time falls inside the configured peak
//! window.

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Timelike;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::DownloadConfig;

/// Daily peak interval in `HHMM` form. May span midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeakWindow {
    start: u32,
    end: u32,
}

impl PeakWindow {
    /// Parse `"HH:MM-HH:MM"`.
    pub fn parse(s: &str) -> Result<PeakWindow> {
        let (start, end) = match s.split_once('-') {
            Some(parts) => parts,
            None => bail!("expected HH:MM-HH:MM, got {:?}", s),
        };
        Ok(PeakWindow {
            start: parse_hhmm(start.trim())?,
            end: parse_hhmm(end.trim())?,
        })
    }

    /// Whether the given wall-clock time falls inside the window.
    pub fn contains(&self, time: chrono::NaiveTime) -> bool {
        let now = time.hour() * 100 + time.minute();
        if self.start > self.end {
            // Window spans midnight, e.g. 22:00-06:00.
            now >= self.start || now <= self.end
        } else {
            now >= self.start && now <= self.end
        }
    }
}

fn parse_hhmm(s: &str) -> Result<u32> {
    let (hour, minute) = match s.split_once(':') {
        Some(parts) => parts,
        None => bail!("expected HH:MM, got {:?}", s),
    };
    let hour: u32 = hour.parse()?;
    let minute: u32 = minute.parse()?;
    if hour > 23 {
        bail!("hour out of range: {}", hour);
    }
    if minute > 59 {
        bail!("minute out of range: {}", minute);
    }
    Ok(hour * 100 + minute)
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Shared token bucket measured in bytes.
///
/// Waiters sleep until enough tokens have accrued; acquisition larger than
/// the burst size is split into burst-sized chunks so one large read cannot
/// monopolise the bucket.
pub struct TokenBucket {
    rate_bytes_per_sec: f64,
    burst_bytes: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate_bytes_per_sec: f64, burst_bytes: f64) -> Self {
        Self {
            rate_bytes_per_sec,
            burst_bytes,
            state: Mutex::new(BucketState {
                tokens: burst_bytes,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn rate_bytes_per_sec(&self) -> f64 {
        self.rate_bytes_per_sec
    }

    /// Wait until `n` bytes worth of tokens are available and consume them.
    ///
    /// Cancellable: dropping the future leaves the bucket consistent.
    pub async fn acquire(&self, n: usize) {
        let mut remaining = n as f64;
        while remaining > 0.0 {
            let chunk = remaining.min(self.burst_bytes);
            self.take(chunk).await;
            remaining -= chunk;
        }
    }

    async fn take(&self, n: f64) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate_bytes_per_sec)
                    .min(self.burst_bytes);
                state.last_refill = now;
                if state.tokens >= n {
                    state.tokens -= n;
                    return;
                }
                (n - state.tokens) / self.rate_bytes_per_sec
            };
            tokio::time::sleep(std::time::Duration::from_secs_f64(wait)).await;
        }
    }
}

/// Decides which bucket (if any) governs a request.
///
/// Pure with respect to its inputs: the same priority and clock always map to
/// the same bucket. The two buckets themselves are shared across all workers
/// so the configured budget is global, not per-request.
pub struct RateScheduler {
    off_peak: Arc<TokenBucket>,
    peak: Option<Arc<TokenBucket>>,
    window: Option<PeakWindow>,
}

impl RateScheduler {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let rate = mbps_to_bytes_per_sec(config.rate_limit_mbps);
        let off_peak = Arc::new(TokenBucket::new(rate, rate * 5.0));

        let schedule = &config.rate_limit_schedule;
        let (window, peak) = if schedule.peak_hours.is_empty() {
            (None, None)
        } else {
            let window = PeakWindow::parse(&schedule.peak_hours)?;
            let peak_rate = rate * schedule.peak_limit_percent as f64 / 100.0;
            (
                Some(window),
                Some(Arc::new(TokenBucket::new(peak_rate, peak_rate * 5.0))),
            )
        };

        Ok(Self {
            off_peak,
            peak,
            window,
        })
    }

    /// The bucket governing a download at `priority` started at `time`, or
    /// `None` for an unthrottled (priority 0) transfer.
    pub fn limiter_for(&self, priority: u8, time: chrono::NaiveTime) -> Option<Arc<TokenBucket>> {
        if priority == 0 {
            return None;
        }
        match (&self.window, &self.peak) {
            (Some(window), Some(peak)) if window.contains(time) => Some(peak.clone()),
            _ => Some(self.off_peak.clone()),
        }
    }
}

fn mbps_to_bytes_per_sec(mbps: f64) -> f64 {
    mbps * 1024.0 * 1024.0 / 8.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn parses_peak_window() {
        let window = PeakWindow::parse("06:00-23:00").unwrap();
        assert!(window.contains(time(6, 0)));
        assert!(window.contains(time(12, 30)));
        assert!(window.contains(time(23, 0)));
        assert!(!window.contains(time(23, 1)));
        assert!(!window.contains(time(5, 59)));
    }

    #[test]
    fn rejects_malformed_windows() {
        assert!(PeakWindow::parse("").is_err());
        assert!(PeakWindow::parse("06:00").is_err());
        assert!(PeakWindow::parse("25:00-06:00").is_err());
        assert!(PeakWindow::parse("06:61-23:00").is_err());
        assert!(PeakWindow::parse("six-seven").is_err());
    }

    #[test]
    fn window_spanning_midnight_is_honoured_on_both_sides() {
        let window = PeakWindow::parse("22:00-06:00").unwrap();
        assert!(window.contains(time(23, 30)));
        assert!(window.contains(time(0, 15)));
        assert!(window.contains(time(5, 59)));
        assert!(!window.contains(time(12, 0)));
        assert!(!window.contains(time(21, 59)));
    }

    fn test_config(mbps: f64, peak_hours: &str, peak_percent: u32) -> DownloadConfig {
        let mut config = DownloadConfig::default();
        config.rate_limit_mbps = mbps;
        config.rate_limit_schedule.peak_hours = peak_hours.to_string();
        config.rate_limit_schedule.peak_limit_percent = peak_percent;
        config
    }

    #[test]
    fn priority_zero_is_never_throttled() {
        let scheduler = RateScheduler::new(&test_config(1.0, "00:00-23:59", 10)).unwrap();
        assert!(scheduler.limiter_for(0, time(12, 0)).is_none());
        assert!(scheduler.limiter_for(1, time(12, 0)).is_some());
    }

    #[test]
    fn peak_window_selects_reduced_bucket() {
        let scheduler = RateScheduler::new(&test_config(8.0, "06:00-23:00", 25)).unwrap();

        let peak = scheduler.limiter_for(3, time(12, 0)).unwrap();
        let off_peak = scheduler.limiter_for(3, time(3, 0)).unwrap();

        assert_eq!(off_peak.rate_bytes_per_sec(), 8.0 * 1024.0 * 1024.0 / 8.0);
        assert_eq!(peak.rate_bytes_per_sec(), off_peak.rate_bytes_per_sec() * 0.25);
    }

    #[test]
    fn empty_window_disables_peak_throttling() {
        let scheduler = RateScheduler::new(&test_config(8.0, "", 25)).unwrap();
        let bucket = scheduler.limiter_for(3, time(12, 0)).unwrap();
        assert_eq!(bucket.rate_bytes_per_sec(), 8.0 * 1024.0 * 1024.0 / 8.0);
    }

    #[test]
    fn buckets_are_shared_across_calls() {
        let scheduler = RateScheduler::new(&test_config(8.0, "", 25)).unwrap();
        let a = scheduler.limiter_for(1, time(1, 0)).unwrap();
        let b = scheduler.limiter_for(5, time(2, 0)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_within_burst_is_immediate() {
        let bucket = TokenBucket::new(1000.0, 5000.0);
        let before = Instant::now();
        bucket.acquire(5000).await;
        assert_eq!(Instant::now(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_beyond_burst_waits_for_refill() {
        let bucket = TokenBucket::new(1000.0, 1000.0);
        bucket.acquire(1000).await;

        let before = Instant::now();
        bucket.acquire(2000).await;
        let waited = Instant::now().duration_since(before);

        // 2000 bytes at 1000 B/s: roughly two seconds of refill.
        assert!(waited.as_secs_f64() >= 1.9, "waited {:?}", waited);
        assert!(waited.as_secs_f64() <= 2.5, "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_rate_is_bounded() {
        let bucket = TokenBucket::new(10_000.0, 50_000.0);
        let start = Instant::now();
        // Burst plus ten seconds of sustained rate.
        bucket.acquire(150_000).await;
        let elapsed = Instant::now().duration_since(start).as_secs_f64();
        assert!(elapsed >= 9.9, "elapsed {}", elapsed);
    }
}
