use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stable, 1-based identifier of a dispensing position.
pub type TapIndex = u8;

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum TapStatus {
    Active,
    #[default]
    Inactive,
}

/// One dispensing position and the keg currently attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tap {
    pub index: TapIndex,

    /// Volume left in the keg.
    ///
    /// Pulse overcounting can push this below zero or above `total_volume`;
    /// both are reported by [`Tap::anomaly`] rather than corrected.
    pub remaining_volume: f64,

    /// Capacity of the keg at the time it was tapped.
    pub total_volume: f64,

    pub status: TapStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tapped_on: Option<NaiveDate>,

    #[serde(default)]
    pub full_name: String,

    #[serde(default)]
    pub short_name: String,
}

/// A tap whose volumes no longer make physical sense.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VolumeAnomaly {
    Negative { remaining: f64 },
    Overfull { remaining: f64, total: f64 },
}

impl Tap {
    /// An inactive, empty, unnamed tap.
    pub fn empty(index: TapIndex) -> Self {
        Self {
            index,
            remaining_volume: 0.0,
            total_volume: 0.0,
            status: TapStatus::Inactive,
            tapped_on: None,
            full_name: String::new(),
            short_name: String::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TapStatus::Active
    }

    /// True when this tap is in service and has dropped below `threshold`.
    pub fn is_low(&self, threshold: f64) -> bool {
        self.is_active() && self.remaining_volume < threshold
    }

    pub fn anomaly(&self) -> Option<VolumeAnomaly> {
        if self.remaining_volume < 0.0 {
            Some(VolumeAnomaly::Negative {
                remaining: self.remaining_volume,
            })
        } else if self.remaining_volume > self.total_volume {
            Some(VolumeAnomaly::Overfull {
                remaining: self.remaining_volume,
                total: self.total_volume,
            })
        } else {
            None
        }
    }
}

/// Every tap known to the system, ordered by index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TapTable {
    taps: BTreeMap<TapIndex, Tap>,
}

impl TapTable {
    /// A table of `count` empty taps numbered `1..=count`.
    pub fn with_default_taps(count: TapIndex) -> Self {
        Self {
            taps: (1..=count).map(|i| (i, Tap::empty(i))).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.taps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }

    pub fn get(&self, index: TapIndex) -> Option<&Tap> {
        self.taps.get(&index)
    }

    pub fn get_mut(&mut self, index: TapIndex) -> Option<&mut Tap> {
        self.taps.get_mut(&index)
    }

    pub fn contains(&self, index: TapIndex) -> bool {
        self.taps.contains_key(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tap> {
        self.taps.values()
    }

    pub fn indices(&self) -> impl Iterator<Item = TapIndex> + '_ {
        self.taps.keys().copied()
    }

    /// Inserts a tap, keyed by its own index, returning any tap it replaced.
    pub fn insert(&mut self, tap: Tap) -> Option<Tap> {
        self.taps.insert(tap.index, tap)
    }

    /// Brings the table in line with the configured tap count.
    ///
    /// Missing positions in `1..=count` are filled with empty taps. Positions
    /// beyond `count` are kept and their indices returned so the caller can
    /// report them.
    pub fn reconcile(&mut self, count: TapIndex) -> Vec<TapIndex> {
        for i in 1..=count {
            self.taps.entry(i).or_insert_with(|| Tap::empty(i));
        }

        self.taps.keys().copied().filter(|i| *i > count).collect()
    }
}

impl FromIterator<Tap> for TapTable {
    fn from_iter<I: IntoIterator<Item = Tap>>(iter: I) -> Self {
        Self {
            taps: iter.into_iter().map(|t| (t.index, t)).collect(),
        }
    }
}

impl IntoIterator for TapTable {
    type Item = Tap;
    type IntoIter = std::collections::btree_map::IntoValues<TapIndex, Tap>;

    fn into_iter(self) -> Self::IntoIter {
        self.taps.into_values()
    }
}

impl Serialize for TapTable {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.taps.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TapTable {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let taps = BTreeMap::<TapIndex, Tap>::deserialize(deserializer)?;
        Ok(Self { taps })
    }
}
