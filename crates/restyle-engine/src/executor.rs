use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::Context as _;
use tokio::process::Command;

use restyle_core::{
    DbError, DocumentStore, JobDocument, JobState, RESULT_IMAGE_ATTACHMENT,
    SOURCE_IMAGE_ATTACHMENT, STYLE_IMAGE_ATTACHMENT,
};

use crate::probe::Capabilities;

const STYLE_BINARY: &str = "th";
const STYLE_SCRIPT: &str = "neural_style.lua";
const RESULT_CONTENT_TYPE: &str = "image/png";

/// Everything the executor needs besides the job document itself.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Where downloaded attachments and the rendered output live.
    pub temp_dir: PathBuf,
    /// Installation directory of the renderer; the external command
    /// must run with this as its working directory.
    pub style_dir: PathBuf,
    /// Host capabilities, probed at startup.
    pub caps: Capabilities,
}

/// Ways a single job can fail. The message ends up verbatim in the
/// document's `error_message`.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// An input attachment could not be downloaded.
    #[error("failed to download attachment {name}: {source}")]
    Download {
        /// Attachment name.
        name: String,
        /// Underlying store error.
        source: DbError,
    },
    /// The renderer ran but failed.
    #[error("style transfer command failed with exit status {status}")]
    External {
        /// The process exit code (-1 when killed by a signal).
        status: i32,
        /// Combined stdout and stderr.
        captured: String,
    },
    /// The renderer claimed success but wrote no output file.
    #[error("style transfer produced no output file at {path}")]
    MissingOutput {
        /// Expected output path.
        path: PathBuf,
        /// Combined stdout and stderr.
        captured: String,
    },
    /// The rendered result could not be attached to the document.
    #[error("failed to upload result attachment: {0}")]
    Upload(DbError),
    /// Local file I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    fn captured(&self) -> &str {
        match self {
            JobError::External { captured, .. } | JobError::MissingOutput { captured, .. } => {
                captured
            }
            _ => "",
        }
    }
}

struct JobWorkspace {
    source_path: PathBuf,
    style_path: PathBuf,
    output_path: PathBuf,
}

impl JobWorkspace {
    fn new(temp_dir: &Path, job_id: &str) -> Self {
        let file = |name: &str| temp_dir.join(format!("{job_id}_{name}.png"));
        Self {
            source_path: file(SOURCE_IMAGE_ATTACHMENT),
            style_path: file(STYLE_IMAGE_ATTACHMENT),
            output_path: file(RESULT_IMAGE_ATTACHMENT),
        }
    }

    async fn cleanup(&self) {
        for path in [&self.source_path, &self.style_path, &self.output_path] {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}

/// Run one job through the full state machine.
///
/// The job is marked `BEING_PROCESSED` up front so the supervisor's
/// stuck-job watchdog covers this worker if it dies mid-render. Any
/// failure after that point is recorded onto the document
/// (`error_message`, captured output, `PROCESSING_FAILED`) and also
/// returned so the caller can log it; the changes feed is never held
/// up by a failed job.
pub async fn execute_style_job(
    db: &dyn DocumentStore,
    config: &ExecutorConfig,
    job: &mut JobDocument,
) -> anyhow::Result<()> {
    job.update_state(db, JobState::BeingProcessed)
        .await
        .with_context(|| format!("marking job {} as being processed", job.id))?;
    tracing::info!(job = %job.id, "processing job");

    let workspace = JobWorkspace::new(&config.temp_dir, &job.id);
    let outcome = run_transfer(db, config, &workspace, job).await;
    let finalized = match &outcome {
        Ok(captured) => finalize_success(db, job, captured).await,
        Err(err) => finalize_failure(db, job, err).await,
    };
    workspace.cleanup().await;
    finalized.with_context(|| format!("recording outcome for job {}", job.id))?;

    match outcome {
        Ok(_) => {
            tracing::info!(job = %job.id, "job processed successfully");
            Ok(())
        }
        Err(err) => Err(anyhow::Error::new(err).context(format!("job {} failed", job.id))),
    }
}

async fn run_transfer(
    db: &dyn DocumentStore,
    config: &ExecutorConfig,
    workspace: &JobWorkspace,
    job: &mut JobDocument,
) -> Result<String, JobError> {
    download_attachment(db, job, SOURCE_IMAGE_ATTACHMENT, &workspace.source_path).await?;
    download_attachment(db, job, STYLE_IMAGE_ATTACHMENT, &workspace.style_path).await?;

    let captured = if config.caps.style_binary {
        render(config, workspace).await?
    } else {
        // Degraded host (no renderer installed): pass the content image
        // through so the rest of the pipeline can be exercised.
        tracing::warn!(job = %job.id, "style binary unavailable, producing passthrough result");
        tokio::fs::copy(&workspace.source_path, &workspace.output_path).await?;
        String::new()
    };

    let result = tokio::fs::read(&workspace.output_path).await?;
    job.add_attachment(db, RESULT_IMAGE_ATTACHMENT, RESULT_CONTENT_TYPE, result)
        .await
        .map_err(JobError::Upload)?;

    Ok(captured)
}

async fn download_attachment(
    db: &dyn DocumentStore,
    job: &JobDocument,
    name: &str,
    dest: &Path,
) -> Result<(), JobError> {
    let bytes = job
        .retrieve_attachment(db, name)
        .await
        .map_err(|source| JobError::Download {
            name: name.to_string(),
            source,
        })?;
    tokio::fs::write(dest, bytes).await?;
    Ok(())
}

async fn render(config: &ExecutorConfig, workspace: &JobWorkspace) -> Result<String, JobError> {
    let gpu_flag = if config.caps.gpu { "0" } else { "-1" };
    let output = Command::new(STYLE_BINARY)
        .arg(STYLE_SCRIPT)
        .arg("-gpu")
        .arg(gpu_flag)
        .arg("-style_image")
        .arg(&workspace.style_path)
        .arg("-content_image")
        .arg(&workspace.source_path)
        .arg("-output_image")
        .arg(&workspace.output_path)
        .current_dir(&config.style_dir)
        .stdin(Stdio::null())
        .output()
        .await?;

    let captured = combine_output(&output.stdout, &output.stderr);
    if !output.status.success() {
        return Err(JobError::External {
            status: output.status.code().unwrap_or(-1),
            captured,
        });
    }
    if !tokio::fs::try_exists(&workspace.output_path)
        .await
        .unwrap_or(false)
    {
        return Err(JobError::MissingOutput {
            path: workspace.output_path.clone(),
            captured,
        });
    }
    Ok(captured)
}

fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    match (stdout.is_empty(), stderr.is_empty()) {
        (true, _) => stderr.into_owned(),
        (_, true) => stdout.into_owned(),
        _ => format!("{stdout}\n{stderr}"),
    }
}

async fn finalize_success(
    db: &dyn DocumentStore,
    job: &mut JobDocument,
    captured: &str,
) -> Result<(), DbError> {
    job.set_std_out_and_err(db, captured).await?;
    job.update_state(db, JobState::ProcessingSuccessful).await?;
    Ok(())
}

async fn finalize_failure(
    db: &dyn DocumentStore,
    job: &mut JobDocument,
    err: &JobError,
) -> Result<(), DbError> {
    job.set_error_message(db, &err.to_string()).await?;
    job.set_std_out_and_err(db, err.captured()).await?;
    job.update_state(db, JobState::ProcessingFailed).await?;
    Ok(())
}
