//! Artifact collection.
//!
//! After a step (or at pipeline end) the collector visits each declared output
//! location, promotes what it finds into the task's `output/` directory,
//! computes a content checksum, and reports the gap when a required output was
//! promised but never produced. Some tools drop files into a shared directory
//! outside the task tree; those are moved in, never left behind.

use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use conveyor_core::{Artifact, Error, Result};
use conveyor_workspace::Workspace;

use crate::step::{DeclaredOutput, OutputLocation, StepDef};

/// Hex-encoded SHA-256 of a file's content, streamed in fixed-size chunks.
pub fn checksum_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .map_err(|e| Error::file_system(path.to_path_buf(), "open for checksum", e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::file_system(path.to_path_buf(), "read for checksum", e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Normalizes pipeline outputs into the task's output directory.
#[derive(Debug, Clone)]
pub struct ArtifactCollector {
    shared_output_dir: Option<PathBuf>,
}

impl ArtifactCollector {
    #[must_use]
    pub fn new(shared_output_dir: Option<PathBuf>) -> Self {
        Self { shared_output_dir }
    }

    /// The shared drop area this collector sweeps, if one is configured
    #[must_use]
    pub fn shared_dir(&self) -> Option<&Path> {
        self.shared_output_dir.as_deref()
    }

    /// Collect one step's declared outputs.
    ///
    /// `taken_names` holds logical names already in use by earlier steps;
    /// collisions are resolved by suffixing with the producing step's index.
    pub fn collect(
        &self,
        step: &StepDef,
        step_index: usize,
        workspace: &Workspace,
        taken_names: &mut HashSet<String>,
    ) -> Result<Vec<Artifact>> {
        let mut artifacts = Vec::new();

        for declared in &step.outputs {
            let source = self.resolve(declared, workspace);
            match source {
                Some(path) if path.is_dir() => {
                    for entry in walkdir::WalkDir::new(&path)
                        .into_iter()
                        .filter_map(|e| e.ok())
                        .filter(|e| e.file_type().is_file())
                    {
                        let rel = entry
                            .path()
                            .strip_prefix(&path)
                            .unwrap_or(entry.path())
                            .to_string_lossy()
                            .replace('/', "-");
                        let name = format!("{}-{rel}", declared.name);
                        artifacts.push(self.promote(
                            entry.path(),
                            &name,
                            step,
                            step_index,
                            workspace,
                            taken_names,
                        )?);
                    }
                }
                Some(path) => {
                    artifacts.push(self.promote(
                        &path,
                        &declared.name,
                        step,
                        step_index,
                        workspace,
                        taken_names,
                    )?);
                }
                None if declared.required => {
                    return Err(Error::artifact_missing(&step.name, &declared.name));
                }
                None => {
                    tracing::debug!(
                        step = %step.name,
                        output = %declared.name,
                        "optional output not produced"
                    );
                }
            }
        }

        Ok(artifacts)
    }

    /// Find the file a declaration points at, if it exists.
    fn resolve(&self, declared: &DeclaredOutput, workspace: &Workspace) -> Option<PathBuf> {
        let path = match &declared.location {
            OutputLocation::Workspace(rel) => workspace.root().join(rel),
            OutputLocation::Shared(name) => self.shared_output_dir.as_ref()?.join(name),
        };
        path.exists().then_some(path)
    }

    /// Move/copy a produced file into `output/` and record it.
    fn promote(
        &self,
        source: &Path,
        name: &str,
        step: &StepDef,
        step_index: usize,
        workspace: &Workspace,
        taken_names: &mut HashSet<String>,
    ) -> Result<Artifact> {
        let final_name = if taken_names.contains(name) {
            format!("{name}.step{step_index}")
        } else {
            name.to_string()
        };

        let dest = workspace.output_dir().join(&final_name);
        if source != dest {
            // Rename within the workspace, copy+remove across filesystems
            // (the shared drop area is often a different mount)
            if fs::rename(source, &dest).is_err() {
                fs::copy(source, &dest)
                    .map_err(|e| Error::file_system(dest.clone(), "promote artifact", e))?;
                let _ = fs::remove_file(source);
            }
        }

        let metadata = fs::metadata(&dest)
            .map_err(|e| Error::file_system(dest.clone(), "stat artifact", e))?;
        let checksum = checksum_file(&dest)?;
        taken_names.insert(final_name.clone());

        tracing::debug!(artifact = %final_name, size = metadata.len(), "artifact collected");
        Ok(Artifact {
            name: final_name,
            path: dest,
            size_bytes: metadata.len(),
            checksum,
            produced_by: step.name.clone(),
        })
    }
}
