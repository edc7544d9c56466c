//! Environment sensor abstraction. The `bme280` feature provides the real
//! I2C driver; the `sim` feature provides a simulated enclosure for
//! development without hardware.

use anyhow::Result;

/// One temperature/humidity sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Environment {
    /// Degrees Celsius.
    pub temperature: f64,
    /// Relative humidity, percent.
    pub humidity: f64,
}

/// A source of environment readings. Errors are driver I/O failures and are
/// not retried by the caller.
pub trait EnvironmentSensor: Send {
    fn read(&mut self) -> Result<Environment>;
}

// ---------------------------------------------------------------------------
// Simulated enclosure
// ---------------------------------------------------------------------------

#[cfg(feature = "sim")]
pub use sim::SimulatedSensor;

#[cfg(feature = "sim")]
mod sim {
    use super::{Environment, EnvironmentSensor};
    use anyhow::Result;
    use std::time::Instant;

    /// Approximate a sample from N(0,1) using the Irwin-Hall method:
    /// sum of 12 uniform [0,1) values minus 6.
    fn approx_std_normal() -> f64 {
        let mut sum: f64 = 0.0;
        for _ in 0..12 {
            sum += fastrand::f64();
        }
        sum - 6.0
    }

    /// Random walk with mean reversion for a single quantity.
    struct Channel {
        value: f64,
        center: f64,
        walk_sigma: f64,
        mean_reversion: f64,
        noise_sigma: f64,
        diurnal_amplitude: f64,
        min: f64,
        max: f64,
    }

    impl Channel {
        fn step(&mut self, phase: f64) -> f64 {
            let pull = self.mean_reversion * (self.center - self.value);
            self.value += pull + self.walk_sigma * approx_std_normal();
            self.value = self.value.clamp(self.min, self.max);

            let diurnal = self.diurnal_amplitude * phase.sin();
            let noise = self.noise_sigma * approx_std_normal();
            (self.value + diurnal + noise).clamp(self.min, self.max)
        }
    }

    /// Simulated vivarium: warm and humid, drifting slowly, with a
    /// day/night swing.
    pub struct SimulatedSensor {
        temperature: Channel,
        humidity: Channel,
        started: Instant,
        diurnal_period_s: f64,
    }

    impl SimulatedSensor {
        /// `diurnal_period_s` controls the day/night cycle length. Use 600
        /// (10 min) for fast dev iteration or 86400 for real-time.
        pub fn new(diurnal_period_s: f64) -> Self {
            tracing::info!(diurnal_period_s, "simulated environment sensor initialised");
            Self {
                temperature: Channel {
                    value: 24.0,
                    center: 24.0,
                    walk_sigma: 0.15,
                    mean_reversion: 0.05,
                    noise_sigma: 0.05,
                    diurnal_amplitude: 3.0,
                    min: -10.0,
                    max: 60.0,
                },
                humidity: Channel {
                    value: 55.0,
                    center: 55.0,
                    walk_sigma: 0.8,
                    mean_reversion: 0.05,
                    noise_sigma: 0.3,
                    // Humidity falls as the enclosure warms.
                    diurnal_amplitude: -8.0,
                    min: 0.0,
                    max: 100.0,
                },
                started: Instant::now(),
                diurnal_period_s: diurnal_period_s.max(1.0),
            }
        }
    }

    impl EnvironmentSensor for SimulatedSensor {
        fn read(&mut self) -> Result<Environment> {
            let elapsed = self.started.elapsed().as_secs_f64();
            let phase = std::f64::consts::TAU * elapsed / self.diurnal_period_s;
            Ok(Environment {
                temperature: self.temperature.step(phase),
                humidity: self.humidity.step(phase),
            })
        }
    }

}
