//! Throughput counters and run diagnostics.
//!
//! Throughput is measured in iterations times particles per second,
//! reported in millions (MIPPS).

use std::time::{Duration, Instant};

/// Iterations-times-particles counter.
#[derive(Clone, Debug, Default)]
pub struct IppsCounter {
    started: Option<Instant>,
    iterations: u64,
    particle_iterations: u128,
}

impl IppsCounter {
    /// A stopped counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts timing from now, discarding previous counts.
    pub fn start(&mut self) {
        *self = Self {
            started: Some(Instant::now()),
            ..Self::default()
        };
    }

    /// Alias of [`start`](Self::start), for interval counters.
    pub fn restart(&mut self) {
        self.start();
    }

    /// Accounts one iteration over `particles` particles.
    pub fn record(&mut self, particles: usize) {
        self.iterations += 1;
        self.particle_iterations += particles as u128;
    }

    /// Iterations recorded since the last start.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Time since the last start.
    pub fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    /// Throughput in millions of particle-iterations per second.
    pub fn mipps(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.particle_iterations as f64 / secs / 1.0e6
    }
}

/// Highest particle speed seen by any write.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PeakSpeed {
    /// Speed magnitude.
    pub speed: f64,
    /// Simulation time of the peak.
    pub t: f64,
}

impl PeakSpeed {
    /// Largest speed magnitude in `vel`, ignoring non-finite values.
    pub fn max_speed(vel: &[[f32; 4]]) -> f64 {
        vel.iter()
            .map(|v| {
                let [x, y, z, _] = v.map(f64::from);
                (x * x + y * y + z * z).sqrt()
            })
            .filter(|s| s.is_finite())
            .fold(0.0, f64::max)
    }

    /// Keeps `speed` if it exceeds the current peak.
    pub fn observe(&mut self, speed: f64, t: f64) {
        if speed > self.speed {
            self.speed = speed;
            self.t = t;
        }
    }

    /// Sound speed suggested for a weakly compressible run: ten times
    /// the peak plus ten percent margin.
    pub fn suggested_sound_speed(&self) -> f64 {
        self.speed * 1.1 * 10.0
    }
}
