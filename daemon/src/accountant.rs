use kegbot_protocol::{TapIndex, TelemetryReading};
use tracing::debug;

/// Conversion from raw flow meter pulses to the volume unit taps are tracked in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Calibration {
    pub(crate) pulses_per_unit: f64,
    pub(crate) unit_divisor: f64,
}

impl Calibration {
    pub(crate) fn volume(&self, pulses: u32) -> f64 {
        f64::from(pulses) / self.pulses_per_unit / self.unit_divisor
    }
}

/// Policy for ignoring electrical noise on idle flow meter lines.
///
/// A reading is trusted only when at least one tap reports strictly more than
/// `threshold` pulses. When it is trusted, every tap's pulses count, even
/// those under the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NoiseGate {
    pub(crate) threshold: u32,
}

impl NoiseGate {
    pub(crate) fn admits(&self, reading: &TelemetryReading) -> bool {
        reading.pulses.iter().any(|p| *p > self.threshold)
    }
}

/// Volume dispensed per tap during one telemetry cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct VolumeDeltas(pub(crate) Vec<(TapIndex, f64)>);

impl VolumeDeltas {
    pub(crate) fn iter(&self) -> impl Iterator<Item = &(TapIndex, f64)> {
        self.0.iter()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct VolumeAccountant {
    calibration: Calibration,
    gate: NoiseGate,
}

impl VolumeAccountant {
    pub(crate) fn new(calibration: Calibration, gate: NoiseGate) -> Self {
        Self { calibration, gate }
    }

    /// Converts a reading into per-tap deltas, or `None` if it is just noise.
    pub(crate) fn deltas(&self, reading: &TelemetryReading) -> Option<VolumeDeltas> {
        if !self.gate.admits(reading) {
            debug!(
                "Pulse counts {:?} all within noise threshold of {}",
                reading.pulses, self.gate.threshold
            );
            return None;
        }

        Some(VolumeDeltas(
            reading
                .pulses
                .iter()
                .zip(1..=TapIndex::MAX)
                .map(|(pulses, tap)| (tap, self.calibration.volume(*pulses)))
                .collect(),
        ))
    }
}
