use std::process::Stdio;

use tokio::process::Command;

/// What the host can actually run, probed once at startup and carried
/// into the executor so degraded hosts still exercise the pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    /// A CUDA-capable GPU is visible (`nvidia-smi` exits 0).
    pub gpu: bool,
    /// The external renderer is installed (`th --help` exits 0).
    pub style_binary: bool,
}

impl Capabilities {
    /// Probe the host by attempting to run the auxiliary binaries.
    pub async fn detect() -> Self {
        Self {
            gpu: has_gpu().await,
            style_binary: has_style_binary().await,
        }
    }
}

/// Whether a CUDA-capable GPU is available.
pub async fn has_gpu() -> bool {
    probe("nvidia-smi", &[]).await
}

/// Whether the external style-transfer binary is installed.
pub async fn has_style_binary() -> bool {
    probe("th", &["--help"]).await
}

async fn probe(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_probes_false() {
        assert!(!probe("restyle-no-such-binary", &[]).await);
    }

    #[tokio::test]
    async fn present_binary_probes_true() {
        assert!(probe("true", &[]).await);
    }
}
