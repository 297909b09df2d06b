//! The single authoritative copy of every tap, and its persistence.
//!
//! Every mutation takes the store lock, builds a candidate table, writes it to
//! both the record and the projection and only then makes it visible. A caller
//! that gets `Ok` back therefore knows the change is on disk, and a caller
//! that gets `Err` knows nothing changed in memory either.

mod files;

pub(crate) use files::StateFiles;

use crate::accountant::VolumeDeltas;
use kegbot_protocol::{ReplacementCommand, Tap, TapIndex, TapTable, VolumeAnomaly};
use std::{
    path::PathBuf,
    sync::{Mutex, MutexGuard, PoisonError},
};
use tracing::{error, info, warn};

#[derive(thiserror::Error, Debug)]
pub(crate) enum StoreError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Tap record {path} is invalid: {source}")]
    RecordFormat {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Projection {path} is invalid: {source}")]
    ProjectionFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode tap record: {0}")]
    EncodeRecord(#[from] toml::ser::Error),

    #[error("Failed to encode projection: {0}")]
    EncodeProjection(#[from] serde_json::Error),

    #[error("Tap {0} does not exist")]
    UnknownTap(TapIndex),
}

/// A tap as it was before and after one mutation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TapChange {
    pub(crate) before: Tap,
    pub(crate) after: Tap,
}

#[derive(Debug)]
struct StoreState {
    table: TapTable,
    temperatures: Vec<f32>,
}

#[derive(Debug)]
pub(crate) struct TapStore {
    files: StateFiles,
    state: Mutex<StoreState>,
}

impl TapStore {
    /// Loads the record (or starts from empty taps) and brings both files up to date.
    pub(crate) fn open(
        files: StateFiles,
        tap_count: TapIndex,
        probe_count: usize,
    ) -> Result<Self, StoreError> {
        let mut table = match files.load_record()? {
            Some(table) => {
                info!(
                    "Loaded {} taps from {}",
                    table.len(),
                    files.record_path().display()
                );
                table
            }
            None => {
                info!(
                    "No tap record at {}, starting with {} empty taps",
                    files.record_path().display(),
                    tap_count
                );
                TapTable::with_default_taps(tap_count)
            }
        };

        let extra = table.reconcile(tap_count);
        if !extra.is_empty() {
            warn!(
                "Tap record has taps {:?} beyond the configured {} taps, keeping them",
                extra, tap_count
            );
        }

        let temperatures = files
            .load_projection()
            .ok()
            .map(|p| p.temperature)
            .filter(|t| t.len() == probe_count)
            .unwrap_or_else(|| vec![0.0; probe_count]);

        files.write_record(&table)?;
        files.write_projection(&table, &temperatures)?;

        Ok(Self {
            files,
            state: Mutex::new(StoreState {
                table,
                temperatures,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read-only copy of every tap.
    pub(crate) fn snapshot(&self) -> TapTable {
        self.lock().table.clone()
    }

    pub(crate) fn temperatures(&self) -> Vec<f32> {
        self.lock().temperatures.clone()
    }

    /// Describes a newly tapped keg.
    pub(crate) fn apply_replacement(
        &self,
        command: &ReplacementCommand,
    ) -> Result<TapChange, StoreError> {
        let mut state = self.lock();

        let before = state
            .table
            .get(command.tap)
            .cloned()
            .ok_or(StoreError::UnknownTap(command.tap))?;
        let after = command.to_tap();

        let mut candidate = state.table.clone();
        candidate.insert(after.clone());

        let temperatures = state.temperatures.clone();
        self.commit(&mut state, candidate, temperatures)?;

        Ok(TapChange { before, after })
    }

    /// Takes poured volume off each tap and records the temperatures that came with it.
    pub(crate) fn apply_volume_deltas(
        &self,
        deltas: &VolumeDeltas,
        temperatures: &[f32],
    ) -> Result<Vec<TapChange>, StoreError> {
        let mut state = self.lock();

        let mut candidate = state.table.clone();
        let mut changes = Vec::new();

        for (index, delta) in deltas.iter() {
            let Some(tap) = candidate.get_mut(*index) else {
                warn!("Telemetry reports tap {} which is not in the tap table", index);
                continue;
            };

            let before = tap.clone();
            tap.remaining_volume -= delta;

            match tap.anomaly() {
                Some(VolumeAnomaly::Negative { remaining }) => {
                    warn!("Tap {} has negative remaining volume {:.3}", index, remaining)
                }
                Some(VolumeAnomaly::Overfull { remaining, total }) => warn!(
                    "Tap {} has more remaining ({:.3}) than its keg holds ({:.3})",
                    index, remaining, total
                ),
                None => {}
            }

            changes.push(TapChange {
                before,
                after: tap.clone(),
            });
        }

        self.commit(&mut state, candidate, temperatures.to_vec())?;

        Ok(changes)
    }

    /// Refreshes the projection's temperatures without touching any tap.
    pub(crate) fn record_temperatures(&self, temperatures: &[f32]) -> Result<(), StoreError> {
        let mut state = self.lock();
        self.files.write_projection(&state.table, temperatures)?;
        state.temperatures = temperatures.to_vec();
        Ok(())
    }

    fn commit(
        &self,
        state: &mut StoreState,
        table: TapTable,
        temperatures: Vec<f32>,
    ) -> Result<(), StoreError> {
        self.files.write_record(&table)?;

        if let Err(e) = self.files.write_projection(&table, &temperatures) {
            // Put the record back so the files never disagree with memory
            if let Err(rollback) = self.files.write_record(&state.table) {
                error!("Failed to restore tap record after failed update: {rollback}");
            }
            return Err(e);
        }

        state.table = table;
        state.temperatures = temperatures;
        Ok(())
    }
}
