//! Lightweight timing for the evaluation hot path.
//!
//! Counters are always cheap to update; whether callers record into them is
//! decided by [`is_enabled`], which can be switched on programmatically or
//! through the `DC_TIMING` environment variable. The variable is read once,
//! on first use.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

static ENABLED: AtomicBool = AtomicBool::new(false);
static FROM_ENV: OnceLock<bool> = OnceLock::new();

fn env_enabled() -> bool {
    *FROM_ENV.get_or_init(|| std::env::var_os("DC_TIMING").is_some())
}

/// Enable timing globally.
pub fn enable_timing() {
    ENABLED.store(true, Ordering::Relaxed);
}

/// Disable timing globally.
pub fn disable_timing() {
    ENABLED.store(false, Ordering::Relaxed);
}

/// Check if timing is enabled.
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed) || env_enabled()
}

/// Accumulating timer for tracking total time across multiple calls.
pub struct AccumulatingTimer {
    total_ns: AtomicU64,
    count: AtomicU64,
}

impl Default for AccumulatingTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl AccumulatingTimer {
    pub const fn new() -> Self {
        Self {
            total_ns: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a timing measurement.
    pub fn record(&self, duration_s: f64) {
        let nanos = (duration_s * 1e9) as u64;
        self.total_ns.fetch_add(nanos, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Run `f`, recording its wall time when timing is enabled.
    pub fn time<T>(&self, f: impl FnOnce() -> T) -> T {
        if !is_enabled() {
            return f();
        }
        let start = Instant::now();
        let out = f();
        self.record(start.elapsed().as_secs_f64());
        out
    }

    /// Total time spent (in seconds).
    pub fn total_seconds(&self) -> f64 {
        self.total_ns.load(Ordering::Relaxed) as f64 / 1e9
    }

    /// Number of recorded calls.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Average time per call (in seconds).
    pub fn average_seconds(&self) -> f64 {
        let count = self.count();
        if count > 0 {
            self.total_seconds() / count as f64
        } else {
            0.0
        }
    }

    pub fn reset(&self) {
        self.total_ns.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
    }
}

/// Per-callback timers for NLP evaluations.
pub mod eval_timing {
    use super::AccumulatingTimer;

    pub static OBJECTIVE: AccumulatingTimer = AccumulatingTimer::new();
    pub static GRADIENT: AccumulatingTimer = AccumulatingTimer::new();
    pub static CONSTRAINTS: AccumulatingTimer = AccumulatingTimer::new();
    pub static JACOBIAN: AccumulatingTimer = AccumulatingTimer::new();
    pub static HESSIAN: AccumulatingTimer = AccumulatingTimer::new();
    /// Factorization and solve of the primal-dual system.
    pub static KKT_SOLVE: AccumulatingTimer = AccumulatingTimer::new();

    fn all() -> [(&'static str, &'static AccumulatingTimer); 6] {
        [
            ("objective", &OBJECTIVE),
            ("gradient", &GRADIENT),
            ("constraints", &CONSTRAINTS),
            ("jacobian", &JACOBIAN),
            ("hessian", &HESSIAN),
            ("kkt solve", &KKT_SOLVE),
        ]
    }

    pub fn reset_all() {
        for (_, timer) in all() {
            timer.reset();
        }
    }

    /// Render a breakdown of every timer with at least one call.
    pub fn summary() -> String {
        let mut out = String::from("=== Evaluation Breakdown ===\n");
        for (label, timer) in all() {
            let count = timer.count();
            if count > 0 {
                out.push_str(&format!(
                    "{:<12} {} calls, {:.3}s total, {:.4}ms avg\n",
                    label,
                    count,
                    timer.total_seconds(),
                    timer.average_seconds() * 1000.0
                ));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulating_timer_averages() {
        let timer = AccumulatingTimer::new();
        timer.record(0.5);
        timer.record(1.5);
        assert_eq!(timer.count(), 2);
        assert!((timer.total_seconds() - 2.0).abs() < 1e-6);
        assert!((timer.average_seconds() - 1.0).abs() < 1e-6);
        timer.reset();
        assert_eq!(timer.count(), 0);
        assert_eq!(timer.average_seconds(), 0.0);
    }

    #[test]
    fn enable_and_disable() {
        enable_timing();
        assert!(is_enabled());
        disable_timing();
        if !env_enabled() {
            assert!(!is_enabled());
        }
    }

    #[test]
    fn environment_is_read_once() {
        let first = env_enabled();
        assert_eq!(FROM_ENV.get(), Some(&first));
        assert_eq!(env_enabled(), first);
    }

    #[test]
    fn time_returns_closure_value() {
        let timer = AccumulatingTimer::new();
        assert_eq!(timer.time(|| 41 + 1), 42);
    }
}
