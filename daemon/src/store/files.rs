use super::StoreError;
use chrono::{DateTime, Local};
use kegbot_protocol::{Tap, TapTable};
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::debug;

/// On-disk shape of the authoritative record.
#[derive(Debug, Serialize, Deserialize)]
struct RecordFile {
    taps: Vec<Tap>,
}

/// On-disk shape of the dashboard projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Projection {
    pub(crate) updated: DateTime<Local>,
    pub(crate) temperature: Vec<f32>,
    pub(crate) taps: TapTable,
}

/// Locations of the two files the store keeps in step.
#[derive(Debug, Clone)]
pub(crate) struct StateFiles {
    record: PathBuf,
    projection: PathBuf,
}

impl StateFiles {
    pub(crate) fn new(record: impl Into<PathBuf>, projection: impl Into<PathBuf>) -> Self {
        Self {
            record: record.into(),
            projection: projection.into(),
        }
    }

    pub(crate) fn record_path(&self) -> &Path {
        &self.record
    }

    /// Reads the record, `None` if it has never been written.
    pub(crate) fn load_record(&self) -> Result<Option<TapTable>, StoreError> {
        let contents = match fs::read_to_string(&self.record) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.record.clone(),
                    source,
                })
            }
        };

        let record: RecordFile =
            toml::from_str(&contents).map_err(|source| StoreError::RecordFormat {
                path: self.record.clone(),
                source,
            })?;

        Ok(Some(record.taps.into_iter().collect()))
    }

    pub(crate) fn write_record(&self, table: &TapTable) -> Result<(), StoreError> {
        let record = RecordFile {
            taps: table.iter().cloned().collect(),
        };
        let contents = toml::to_string(&record)?;

        write_atomically(&self.record, contents.as_bytes())
    }

    pub(crate) fn load_projection(&self) -> Result<Projection, StoreError> {
        let contents = fs::read(&self.projection).map_err(|source| StoreError::Read {
            path: self.projection.clone(),
            source,
        })?;

        serde_json::from_slice(&contents).map_err(|source| StoreError::ProjectionFormat {
            path: self.projection.clone(),
            source,
        })
    }

    pub(crate) fn write_projection(
        &self,
        table: &TapTable,
        temperature: &[f32],
    ) -> Result<(), StoreError> {
        let projection = Projection {
            updated: Local::now(),
            temperature: temperature.to_vec(),
            taps: table.clone(),
        };
        let contents = serde_json::to_vec_pretty(&projection)?;

        write_atomically(&self.projection, &contents)
    }
}

/// Replaces `path` with `contents` so readers only ever see a whole file.
fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    let write_error = |source| StoreError::Write {
        path: path.to_owned(),
        source,
    };

    fs::write(&tmp, contents).map_err(write_error)?;
    fs::rename(&tmp, path).map_err(|source| {
        let _ = fs::remove_file(&tmp);
        write_error(source)
    })?;

    debug!("Wrote {} bytes to {}", contents.len(), path.display());
    Ok(())
}
