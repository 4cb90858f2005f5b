//! # Tick Loop
//!
//! Fixed-timestep driver for the poll thread.
//!
//! ## Design
//!
//! Handlers only run inside `update()`, so whoever owns a peer must call it
//! at a steady cadence:
//!
//! ```text
//! loop {
//!     tick_loop.wait_for_next_tick();
//!     while tick_loop.should_tick() {
//!         let start = tick_loop.begin_tick();
//!         server.update();
//!         tick_loop.end_tick(start);
//!     }
//! }
//! ```

use std::time::{Duration, Instant};

use crate::config::NetSettings;

/// Fixed-timestep tick loop controller.
pub struct TickLoop {
    /// Target tick duration.
    tick_duration: Duration,
    /// Time of last tick.
    last_tick: Instant,
    /// Accumulated time since last tick.
    accumulator: Duration,
    /// Total ticks executed.
    tick_count: u64,
    /// Frame time statistics.
    stats: TickStats,
}

/// Tick timing statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct TickStats {
    /// Minimum tick duration observed.
    pub min_tick_us: u64,
    /// Maximum tick duration observed.
    pub max_tick_us: u64,
    /// Average tick duration (rolling).
    pub avg_tick_us: u64,
    /// Number of late ticks (took longer than budget).
    pub late_ticks: u64,
    /// Total ticks measured.
    pub total_ticks: u64,
}

impl TickStats {
    fn fresh(tick_duration: Duration) -> Self {
        Self {
            min_tick_us: u64::MAX,
            max_tick_us: 0,
            avg_tick_us: duration_us(tick_duration),
            late_ticks: 0,
            total_ticks: 0,
        }
    }

    /// Share of ticks that overran their budget, in percent.
    #[must_use]
    pub fn late_percent(&self) -> f64 {
        self.late_ticks as f64 / self.total_ticks.max(1) as f64 * 100.0
    }
}

fn duration_us(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

impl TickLoop {
    /// Creates a tick loop with the given interval (at least 1ms).
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        let tick_duration = interval.max(Duration::from_millis(1));

        Self {
            tick_duration,
            last_tick: Instant::now(),
            accumulator: Duration::ZERO,
            tick_count: 0,
            stats: TickStats::fresh(tick_duration),
        }
    }

    /// Creates a tick loop running at `tick_interval_ms`.
    #[must_use]
    pub fn from_settings(settings: &NetSettings) -> Self {
        Self::new(settings.tick_interval())
    }

    /// Returns true if it's time to execute a tick.
    ///
    /// Call this in a loop until it returns false.
    #[must_use]
    pub fn should_tick(&mut self) -> bool {
        let now = Instant::now();
        self.accumulator += now.duration_since(self.last_tick);
        self.last_tick = now;

        self.accumulator >= self.tick_duration
    }

    /// Marks the start of a tick.
    ///
    /// Returns the tick start time for duration measurement.
    #[must_use]
    pub fn begin_tick(&mut self) -> Instant {
        self.accumulator = self.accumulator.saturating_sub(self.tick_duration);
        self.tick_count += 1;
        Instant::now()
    }

    /// Marks the end of a tick.
    ///
    /// Records statistics about tick duration.
    pub fn end_tick(&mut self, start: Instant) {
        let duration = start.elapsed();
        let duration_us = duration_us(duration);

        self.stats.total_ticks += 1;
        self.stats.min_tick_us = self.stats.min_tick_us.min(duration_us);
        self.stats.max_tick_us = self.stats.max_tick_us.max(duration_us);

        // Rolling average
        self.stats.avg_tick_us = (self.stats.avg_tick_us * 15 + duration_us) / 16;

        if duration > self.tick_duration {
            self.stats.late_ticks += 1;
        }
    }

    /// Sleeps until the next tick is due.
    ///
    /// Network ticks tolerate millisecond jitter, so this never spins.
    pub fn wait_for_next_tick(&self) {
        let elapsed = self.last_tick.elapsed() + self.accumulator;
        if elapsed < self.tick_duration {
            std::thread::sleep(self.tick_duration - elapsed);
        }
    }

    /// Runs `tick` at the loop cadence until it returns false.
    pub fn run(&mut self, mut tick: impl FnMut(u64) -> bool) {
        loop {
            self.wait_for_next_tick();
            while self.should_tick() {
                let start = self.begin_tick();
                let keep_going = tick(self.tick_count);
                self.end_tick(start);
                if !keep_going {
                    return;
                }
            }
        }
    }

    /// Returns the current tick count.
    #[must_use]
    pub const fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Returns tick statistics.
    #[must_use]
    pub const fn stats(&self) -> &TickStats {
        &self.stats
    }

    /// Returns the target tick duration.
    #[must_use]
    pub const fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    /// Resets statistics.
    pub fn reset_stats(&mut self) {
        self.stats = TickStats::fresh(self.tick_duration);
    }
}

impl Default for TickLoop {
    fn default() -> Self {
        Self::from_settings(&NetSettings::default())
    }
}
