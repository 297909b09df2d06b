use regex::Regex;

/// One decoded report from the sensor controller.
///
/// `pulses[i]` belongs to tap `i + 1`; `temperatures[j]` to probe `j + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryReading {
    pub pulses: Vec<u32>,
    pub temperatures: Vec<f32>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("Malformed telemetry line: {line:?}")]
    Malformed { line: String },
}

/// Decoder for the controller's `tap1:<n> ... temp1:<t> ...` line protocol.
#[derive(Debug, Clone)]
pub struct TelemetryDecoder {
    pattern: Regex,
    tap_count: usize,
    probe_count: usize,
}

impl TelemetryDecoder {
    pub fn new(tap_count: usize, probe_count: usize) -> Result<Self, regex::Error> {
        let taps = (1..=tap_count).map(|i| format!(r"tap{i}:(\d+)"));
        let temps = (1..=probe_count).map(|j| format!(r"temp{j}:([-+]?\d+(?:\.\d+)?)"));
        let body = taps.chain(temps).collect::<Vec<_>>().join(r"\s+");

        let pattern = Regex::new(&format!(r"^{body}$"))?;

        Ok(Self {
            pattern,
            tap_count,
            probe_count,
        })
    }

    pub fn tap_count(&self) -> usize {
        self.tap_count
    }

    pub fn probe_count(&self) -> usize {
        self.probe_count
    }

    /// Decodes one line, rejecting anything that is not a complete frame.
    pub fn decode(&self, line: &str) -> Result<TelemetryReading, TelemetryError> {
        let malformed = || TelemetryError::Malformed {
            line: line.to_owned(),
        };

        let captures = self.pattern.captures(line.trim()).ok_or_else(malformed)?;

        let mut values = captures.iter().skip(1).map(|c| c.map(|m| m.as_str()));

        let pulses = values
            .by_ref()
            .take(self.tap_count)
            .map(|v| v.and_then(|v| v.parse::<u32>().ok()))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(malformed)?;

        let temperatures = values
            .take(self.probe_count)
            .map(|v| {
                v.and_then(|v| v.parse::<f32>().ok())
                    .filter(|t| t.is_finite())
            })
            .collect::<Option<Vec<_>>>()
            .ok_or_else(malformed)?;

        Ok(TelemetryReading {
            pulses,
            temperatures,
        })
    }

    /// Decodes raw bytes from the serial line, tolerating invalid UTF-8.
    pub fn decode_bytes(&self, bytes: &[u8]) -> Result<TelemetryReading, TelemetryError> {
        self.decode(&String::from_utf8_lossy(bytes))
    }
}
