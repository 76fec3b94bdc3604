//! Job definition templates
//!
//! A template turns one parametric job record into the grid job definitions
//! submitted on its behalf. The variability point is the [`JobTemplate`]
//! trait, selected and configured at construction time; [`ScriptTemplate`]
//! is the standard implementation driven by the `[parametricjobs]`
//! configuration section.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::config::ParametricJobsConfig;
use crate::grid::GridJobDefinition;
use crate::models::ParametricJobModel;

/// Temporary on-disk workspace holding the files a submission ships to the
/// grid. The backing directory lives as long as this value.
pub struct StagedWorkspace {
    _dir: TempDir,
    pub runscript: PathBuf,
}

/// Builds grid job definitions for a parametric job.
pub trait JobTemplate: Send + Sync {
    /// Stage the submission workspace (runscript and friends) on disk.
    fn stage(&self) -> Result<StagedWorkspace>;

    /// Build one or more definitions for the given parametric job. More than
    /// one definition is produced when the job is large enough that a single
    /// submission call could time out waiting for the backend to expand it.
    fn build(
        &self,
        job: &ParametricJobModel,
        workspace: &StagedWorkspace,
    ) -> Result<Vec<GridJobDefinition>>;
}

/// Standard template: a configured shell script run once per parameter value.
pub struct ScriptTemplate {
    executable: String,
    script: String,
    args: Vec<String>,
    default_num_jobs: i64,
    max_jobs_per_definition: usize,
}

impl ScriptTemplate {
    pub fn new(config: &ParametricJobsConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            script: config.script.clone(),
            args: config.args.clone(),
            default_num_jobs: config.default_num_jobs,
            max_jobs_per_definition: config.max_jobs_per_definition,
        }
    }
}

impl JobTemplate for ScriptTemplate {
    fn stage(&self) -> Result<StagedWorkspace> {
        let dir = TempDir::with_prefix("prodsys-submit-")
            .context("Failed to create submission workspace")?;
        let runscript = dir.path().join("runscript.sh");
        fs::write(&runscript, &self.script)
            .with_context(|| format!("Failed to write {}", runscript.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&runscript, fs::Permissions::from_mode(0o755))
                .with_context(|| format!("Failed to chmod {}", runscript.display()))?;
        }

        Ok(StagedWorkspace {
            _dir: dir,
            runscript,
        })
    }

    fn build(
        &self,
        job: &ParametricJobModel,
        workspace: &StagedWorkspace,
    ) -> Result<Vec<GridJobDefinition>> {
        let requested = if job.num_jobs > 0 {
            job.num_jobs
        } else {
            self.default_num_jobs
        };
        anyhow::ensure!(
            requested > 0,
            "Parametric job {}.{} requests no jobs",
            job.request_id,
            job.id
        );

        let parameters: Vec<i64> = (1..=requested).collect();
        let chunks: Vec<&[i64]> = parameters.chunks(self.max_jobs_per_definition.max(1)).collect();
        let split = chunks.len() > 1;

        let definitions = chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                let name = if split {
                    format!("prodsys_{}.{}_{}", job.request_id, job.id, index + 1)
                } else {
                    format!("prodsys_{}.{}", job.request_id, job.id)
                };
                GridJobDefinition {
                    name,
                    executable: self.executable.clone(),
                    args: self.args.clone(),
                    parameters: chunk.to_vec(),
                    site: job.site.clone(),
                    priority: job.priority,
                    input_sandbox: vec![workspace.runscript.clone()],
                }
            })
            .collect();

        Ok(definitions)
    }
}
