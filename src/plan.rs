//! Sample planning and run bookkeeping.
//!
//! One run covers the full Cartesian product of the inclusive duty range and
//! the replicate count. The plan is generated up front so it can be shuffled
//! as a whole; shuffling changes iteration order only, never membership.

use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;
use rand::seq::SliceRandom;
use serde::Serialize;

use crate::errors::Result;

/// Mode for run and per-duty directories.
pub const DIR_MODE: u32 = 0o744;

/// One (duty, replicate) unit of work: one trigger, one capture, one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sample {
    pub duty: u8,
    pub directory: PathBuf,
    pub filename: String,
}

impl Sample {
    /// Full path of the sample's output file.
    pub fn target(&self) -> PathBuf {
        self.directory.join(&self.filename)
    }
}

/// Run identifier and the root directory every sample lands under.
#[derive(Debug, Clone, Serialize)]
pub struct RunManifest {
    pub model_id: String,
    pub data_dir: PathBuf,
}

impl RunManifest {
    /// Create `<base>/<epoch-seconds>` and return the manifest. The directory
    /// exists by the time this returns, and `data_dir` is absolute so the
    /// manifest line stays valid for consumers with a different working
    /// directory.
    pub fn create(base: &Path) -> Result<Self> {
        let base = base.canonicalize()?;
        let model_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .to_string();
        let data_dir = base.join(&model_id);
        DirBuilder::new().mode(DIR_MODE).create(&data_dir)?;
        debug!("run manifest created: model_id={}", model_id);
        Ok(Self { model_id, data_dir })
    }

    /// The one-line JSON form printed to stdout at startup.
    pub fn to_json_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Generate the sample plan for the run.
///
/// Produces `(duty_max - duty_min + 1) * (replicates + 1)` descriptors in
/// duty-major order; filenames carry a fixed-width two-digit replicate
/// suffix. With `randomize` the whole sequence is permuted uniformly.
pub fn generate(
    manifest: &RunManifest,
    duty_min: u8,
    duty_max: u8,
    replicates: u32,
    randomize: bool,
) -> Vec<Sample> {
    let mut samples = Vec::new();
    for duty in duty_min..=duty_max {
        let directory = manifest.data_dir.join(format!("{}_duty", duty));
        for replicate in 0..=replicates {
            samples.push(Sample {
                duty,
                directory: directory.clone(),
                filename: format!("serial{:02}.json", replicate),
            });
        }
    }
    if randomize {
        samples.shuffle(&mut rand::thread_rng());
    }
    samples
}

/// Percent complete after `completed` of `total` samples.
///
/// Rounds the ratio to two decimals before flooring, so 1 of 50 reports 2%.
pub fn percent_complete(completed: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    let ratio = completed as f64 / total as f64;
    let rounded = (ratio * 100.0).round() / 100.0;
    (rounded * 100.0).floor() as u32
}

/// Progress line for one finished sample, built from the target path's final
/// two components.
pub fn status_line(target: &Path, completed: usize, total: usize) -> String {
    let filename = target
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let directory = target
        .parent()
        .and_then(|p| p.file_name())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!(
        "{}% complete. {}/{}",
        percent_complete(completed, total),
        directory,
        filename
    )
}
