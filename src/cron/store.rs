//! Persistence for the cron job table.
//!
//! A single `{ version: 1, jobs: [...] }` document at
//! `<stateDir>/cron/jobs.json`, written with the atomic pattern plus a
//! best-effort `.bak`. The scheduler process owns the file exclusively, so
//! no cross-process lock is needed; atomic writes protect against partial
//! writes on crash.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cron::types::CronJob;
use crate::error::StoreError;
use crate::util::fs::{rename_aside, write_json_atomic};

const STORE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CronJobsFile {
    version: u32,
    jobs: Vec<CronJob>,
}

pub struct CronStore {
    path: PathBuf,
}

impl CronStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the job table. A missing file is empty; a corrupt file is moved
    /// aside and treated as empty.
    pub async fn load(&self) -> Result<Vec<CronJob>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<CronJobsFile>(&bytes) {
            Ok(file) => {
                if file.version != STORE_VERSION {
                    warn!(
                        version = file.version,
                        "Cron store has an unexpected version, loading anyway"
                    );
                }
                Ok(file.jobs)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Cron store corrupt, resetting");
                if let Err(rename_err) = rename_aside(&self.path).await {
                    warn!(error = %rename_err, "Failed to move corrupt cron store aside");
                }
                Ok(Vec::new())
            }
        }
    }

    pub async fn save(&self, jobs: &[CronJob]) -> Result<(), StoreError> {
        let file = CronJobsFile {
            version: STORE_VERSION,
            jobs: jobs.to_vec(),
        };
        write_json_atomic(&self.path, &file).await?;
        Ok(())
    }
}
