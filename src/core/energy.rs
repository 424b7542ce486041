//! Energy estimates for completed turns

/// Returned when no estimate can be produced
pub const ENERGY_UNAVAILABLE: f64 = -1.0;

pub trait EnergyEstimator: Send + Sync {
    /// Estimated charge used over `execution_time_ms`, or [`ENERGY_UNAVAILABLE`]
    fn estimate(&self, execution_time_ms: u64) -> f64;
}

/// Estimates charge from the device's average active CPU draw
#[derive(Debug, Clone, Default)]
pub struct PowerProfileEstimator {
    cpu_active_mah_per_sec: Option<f64>,
}

impl PowerProfileEstimator {
    pub fn new(cpu_active_mah_per_sec: Option<f64>) -> Self {
        Self {
            cpu_active_mah_per_sec,
        }
    }
}

impl EnergyEstimator for PowerProfileEstimator {
    fn estimate(&self, execution_time_ms: u64) -> f64 {
        let Some(cpu_active) = self.cpu_active_mah_per_sec else {
            tracing::warn!("no power profile configured, energy estimate unavailable");
            return ENERGY_UNAVAILABLE;
        };
        if !cpu_active.is_finite() || cpu_active < 0.0 {
            tracing::warn!(cpu_active, "invalid power profile, energy estimate unavailable");
            return ENERGY_UNAVAILABLE;
        }

        let estimated = cpu_active * (execution_time_ms as f64 / 1000.0);
        tracing::debug!(cpu_active, execution_time_ms, estimated, "estimated energy (mAh)");
        estimated
    }
}
