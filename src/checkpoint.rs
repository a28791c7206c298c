//! Persisted training state.
//!
//! A checkpoint is a JSON document holding the flow, the optimizer moments
//! and the number of completed training steps. Files are written to a
//! temporary sibling first and renamed into place.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FlowError, Result};
use crate::flow::FlowModel;
use crate::optimizer::Adam;

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub flow: FlowModel,
    pub optimizer: Option<Adam>,
    /// Number of completed training steps
    pub step: u64,
}

#[derive(Serialize)]
pub(crate) struct CheckpointRef<'a> {
    format_version: u32,
    flow: &'a FlowModel,
    optimizer: Option<&'a Adam>,
    step: u64,
}

impl<'a> CheckpointRef<'a> {
    pub(crate) fn new(flow: &'a FlowModel, optimizer: Option<&'a Adam>, step: u64) -> Self {
        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            flow,
            optimizer,
            step,
        }
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub(crate) fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        let tmp = temporary_path(path);
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        info!(path = %path.display(), step = self.step, "saved checkpoint");
        Ok(())
    }
}

impl Checkpoint {
    pub fn new(flow: FlowModel, optimizer: Option<Adam>, step: u64) -> Self {
        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            flow,
            optimizer,
            step,
        }
    }

    fn borrowed(&self) -> CheckpointRef<'_> {
        CheckpointRef::new(&self.flow, self.optimizer.as_ref(), self.step)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.borrowed().to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        #[derive(Deserialize)]
        struct Version {
            format_version: u32,
        }
        let Version { format_version } = serde_json::from_slice(bytes)?;
        if format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(FlowError::UnsupportedCheckpoint(format_version));
        }
        let checkpoint: Checkpoint = serde_json::from_slice(bytes)?;
        checkpoint.flow.validate()?;
        Ok(checkpoint)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.borrowed().save(path.as_ref())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Where a trainer keeping its best parameters writes them, next to the
    /// checkpoint at `path`: `run.json` becomes `run.best.json`.
    pub fn best_path(path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        let stem = path.file_stem().unwrap_or_default().to_string_lossy();
        let name = match path.extension() {
            Some(ext) => format!("{stem}.best.{}", ext.to_string_lossy()),
            None => format!("{stem}.best"),
        };
        path.with_file_name(name)
    }
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
