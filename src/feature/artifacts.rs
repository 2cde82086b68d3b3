use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use walkdir::WalkDir;

use crate::config::WorkerConfig;
use crate::feature::{Feature, TaskFeature};
use crate::queue::ArtifactUpload;
use crate::task::definition::{ArtifactKind, ArtifactSpec};
use crate::task::errors::{CommandExecutionError, ExecutionErrors};
use crate::task::run::TaskRun;

/// Publishes the artifacts declared in the task payload once the task's
/// commands have finished.
pub struct ArtifactFeature {
    enabled: bool,
}

impl ArtifactFeature {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            enabled: config.enable_artifacts,
        }
    }
}

impl Feature for ArtifactFeature {
    fn name(&self) -> &'static str {
        "Artifacts"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn is_requested(&self, task: &TaskRun) -> bool {
        !task.payload.artifacts.is_empty()
    }

    fn new_task_feature(&self, _task: &TaskRun) -> Box<dyn TaskFeature> {
        Box::new(ArtifactTask)
    }
}

struct ArtifactTask;

/// Expiry of an artifact must lie between the task deadline and the task
/// expiry, with this much slack for clock rounding.
fn expiry_slack() -> Duration {
    Duration::seconds(1)
}

fn validate(
    artifact: &ArtifactSpec,
    deadline: DateTime<Utc>,
    expires: DateTime<Utc>,
) -> Result<(), CommandExecutionError> {
    let relative = Path::new(&artifact.path);
    if relative.is_absolute()
        || relative
            .components()
            .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(CommandExecutionError::malformed_payload(format!(
            "Artifact {} has path {}, which is not inside the task directory",
            artifact.name, artifact.path
        )));
    }
    if let Some(artifact_expires) = artifact.expires {
        if artifact_expires + expiry_slack() < deadline {
            return Err(CommandExecutionError::malformed_payload(format!(
                "Artifact {} expires at {}, before the task deadline {}",
                artifact.name, artifact_expires, deadline
            )));
        }
        if artifact_expires > expires + expiry_slack() {
            return Err(CommandExecutionError::malformed_payload(format!(
                "Artifact {} expires at {}, after the task itself expires at {}",
                artifact.name, artifact_expires, expires
            )));
        }
    }
    Ok(())
}

/// Regular files under `dir`, as (path relative to `dir`, absolute path)
/// pairs. Symlinks are not followed or uploaded.
fn walk_files(dir: &Path) -> std::io::Result<Vec<(PathBuf, PathBuf)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(dir) {
            files.push((relative.to_path_buf(), entry.path().to_path_buf()));
        }
    }
    files.sort();
    Ok(files)
}

fn uploads_for(
    artifact: &ArtifactSpec,
    task_dir: &Path,
    default_expires: DateTime<Utc>,
) -> Result<Vec<ArtifactUpload>, String> {
    let path = task_dir.join(&artifact.path);
    let expires = Some(artifact.expires.unwrap_or(default_expires));
    match artifact.kind {
        ArtifactKind::File => {
            if !path.is_file() {
                return Err(format!("Could not read file {}", path.display()));
            }
            Ok(vec![ArtifactUpload {
                name: artifact.name.clone(),
                path,
                expires,
            }])
        }
        ArtifactKind::Directory => {
            if !path.is_dir() {
                return Err(format!("Could not read directory {}", path.display()));
            }
            let files = walk_files(&path)
                .map_err(|e| format!("Could not read directory {}: {}", path.display(), e))?;
            Ok(files
                .into_iter()
                .map(|(relative, absolute)| ArtifactUpload {
                    name: format!(
                        "{}/{}",
                        artifact.name.trim_end_matches('/'),
                        relative.to_string_lossy().replace('\\', "/")
                    ),
                    path: absolute,
                    expires,
                })
                .collect())
        }
    }
}

#[async_trait]
impl TaskFeature for ArtifactTask {
    async fn start(&mut self, task: &TaskRun) -> Result<(), CommandExecutionError> {
        for artifact in &task.payload.artifacts {
            validate(artifact, task.definition.deadline, task.definition.expires)?;
        }
        Ok(())
    }

    async fn stop(&mut self, task: &TaskRun, errors: &mut ExecutionErrors) {
        for artifact in &task.payload.artifacts {
            if let Some(owner) = task.artifact_owner(&artifact.name) {
                task.log.warn(format!(
                    "Not uploading artifact {} since feature {} publishes an artifact with that name",
                    artifact.name, owner
                ));
                continue;
            }
            let spec = artifact.clone();
            let task_dir = task.task_dir().to_path_buf();
            let expires = task.definition.expires;
            let collected =
                tokio::task::spawn_blocking(move || uploads_for(&spec, &task_dir, expires))
                    .await
                    .unwrap_or_else(|e| Err(format!("Could not collect files: {}", e)));
            let uploads = match collected {
                Ok(uploads) => uploads,
                Err(reason) if artifact.optional => {
                    task.log
                        .info(format!("Skipping optional artifact {}: {}", artifact.name, reason));
                    continue;
                }
                Err(reason) => {
                    task.log.error(format!("Missing artifact {}: {}", artifact.name, reason));
                    errors.push(CommandExecutionError::failure(format!(
                        "Missing artifact {}: {}",
                        artifact.name, reason
                    )));
                    continue;
                }
            };
            for upload in uploads {
                task.log.info(format!("Uploading artifact {}", upload.name));
                let name = upload.name.clone();
                if let Err(e) = task
                    .queue
                    .create_artifact(&task.task_id, task.run_id, upload)
                    .await
                {
                    errors.push(CommandExecutionError::resource_unavailable(format!(
                        "Could not upload artifact {}: {}",
                        name, e
                    )));
                }
            }
        }
    }
}
