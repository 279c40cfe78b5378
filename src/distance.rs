//! Signal-strength to distance estimation.

/// Default calibration constant: expected signal strength at one meter, in
/// dBm.
pub const DEFAULT_TX_POWER: i16 = -59;

/// Empirical path-loss estimator mapping a dBm reading to meters.
///
/// The curve has two regimes around `ratio = signal / tx_power`: inside one
/// meter (`ratio < 1`) the estimate is `ratio^10`, beyond it
/// `0.89976 * ratio^7.7095 + 0.111`. The exponents and coefficients are
/// calibration constants; changing them changes every reported distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceEstimator {
    tx_power: i16,
}

impl Default for DistanceEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_TX_POWER)
    }
}

impl DistanceEstimator {
    /// Create an estimator calibrated to the given one-meter reference
    /// strength.
    pub fn new(tx_power: i16) -> Self {
        DistanceEstimator { tx_power }
    }

    /// Estimate the distance in meters for a signal-strength reading.
    ///
    /// A zero reading is a sensor fault; the estimate is infinite so that
    /// faulty devices sort after every real one instead of crashing the
    /// pipeline or masquerading as nearby.
    pub fn estimate(&self, signal: i16) -> f64 {
        if signal == 0 {
            return f64::INFINITY;
        }
        let ratio = f64::from(signal) / f64::from(self.tx_power);
        if ratio < 1.0 {
            ratio.powi(10)
        } else {
            0.89976 * ratio.powf(7.7095) + 0.111
        }
    }
}
