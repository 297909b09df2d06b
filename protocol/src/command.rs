use crate::tap::{Tap, TapIndex, TapStatus};
use chrono::NaiveDate;
use regex::Regex;
use std::str::FromStr;

/// Date format used by operators when tapping a keg, e.g. `01/02/20`.
pub const TAPPED_ON_FORMAT: &str = "%m/%d/%y";

/// An operator request to describe the keg now attached to a tap.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplacementCommand {
    pub tap: TapIndex,
    pub remaining_volume: f64,
    pub total_volume: f64,
    pub status: TapStatus,
    pub tapped_on: NaiveDate,
    pub full_name: String,
    pub short_name: String,

    /// Identity of whoever sent the command.
    pub sender: String,

    /// The message the command was parsed from.
    pub raw: String,
}

impl ReplacementCommand {
    /// The tap as it should look once this command has been applied.
    pub fn to_tap(&self) -> Tap {
        Tap {
            index: self.tap,
            remaining_volume: self.remaining_volume,
            total_volume: self.total_volume,
            status: self.status,
            tapped_on: Some(self.tapped_on),
            full_name: self.full_name.clone(),
            short_name: self.short_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Matched(ReplacementCommand),

    /// The text does not carry the command marker at all.
    NotACommand,

    /// The marker is present but the fields are unusable.
    Malformed(String),
}

/// Parser for `<marker> <tap>:<remaining>:<total>:<status>:<date>:<full name>:<short name>`.
#[derive(Debug, Clone)]
pub struct CommandParser {
    marker: String,
    pattern: Regex,
    volume: Regex,
    tap_count: TapIndex,
}

impl CommandParser {
    pub fn new(marker: &str, tap_count: TapIndex) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!(
            r"(?m){}\s+([^:\s]*):([^:]*):([^:]*):([^:]*):([^:]*):(.*):(.*)$",
            regex::escape(marker)
        ))?;

        Ok(Self {
            marker: marker.to_owned(),
            pattern,
            volume: Regex::new(r"^\d+(?:\.\d*)?$")?,
            tap_count,
        })
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn parse(&self, sender: &str, text: &str) -> ParseOutcome {
        if !text.contains(&self.marker) {
            return ParseOutcome::NotACommand;
        }

        let Some(captures) = self.pattern.captures(text) else {
            return ParseOutcome::Malformed(format!(
                "expected {} <tap>:<remaining>:<total>:<ACTIVE|INACTIVE>:<mm/dd/yy>:<name>:<short name>",
                self.marker
            ));
        };

        let field = |i: usize| captures.get(i).map_or("", |m| m.as_str().trim());

        match self.fields(
            field(1),
            field(2),
            field(3),
            field(4),
            field(5),
        ) {
            Ok((tap, remaining_volume, total_volume, status, tapped_on)) => {
                ParseOutcome::Matched(ReplacementCommand {
                    tap,
                    remaining_volume,
                    total_volume,
                    status,
                    tapped_on,
                    full_name: field(6).to_owned(),
                    short_name: field(7).to_owned(),
                    sender: sender.to_owned(),
                    raw: text.to_owned(),
                })
            }
            Err(reason) => ParseOutcome::Malformed(reason),
        }
    }

    fn fields(
        &self,
        tap: &str,
        remaining: &str,
        total: &str,
        status: &str,
        date: &str,
    ) -> Result<(TapIndex, f64, f64, TapStatus, NaiveDate), String> {
        let tap = tap
            .parse::<TapIndex>()
            .ok()
            .filter(|t| (1..=self.tap_count).contains(t))
            .ok_or_else(|| format!("tap {tap} does not exist"))?;

        let remaining = self.parse_volume(remaining)?;
        let total = self.parse_volume(total)?;

        let status = TapStatus::from_str(status)
            .map_err(|_| format!("status {status:?} is not ACTIVE or INACTIVE"))?;

        let date = NaiveDate::parse_from_str(date, TAPPED_ON_FORMAT)
            .map_err(|_| format!("date {date:?} is not mm/dd/yy"))?;

        Ok((tap, remaining, total, status, date))
    }

    /// Plain decimal only, `5`, `5.` or `5.25`.
    fn parse_volume(&self, s: &str) -> Result<f64, String> {
        Some(s)
            .filter(|s| self.volume.is_match(s))
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .ok_or_else(|| format!("volume {s:?} is not a non-negative number"))
    }
}
