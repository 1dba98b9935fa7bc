use std::path::{Path, PathBuf};

/// Default name of the cursor file, next to the working directory.
pub const DEFAULT_CURSOR_FILE: &str = "lastprocessed.db";

/// Durable storage for the last processed change-feed sequence.
///
/// The file holds a single line of text. Writes go to a temporary
/// sibling and are renamed into place so a crash never leaves a torn
/// cursor behind.
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    /// A cursor store backed by the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the persisted sequence, if any.
    pub async fn load(&self) -> anyhow::Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => {
                let seq = raw.trim();
                if seq.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(seq.to_string()))
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Durably replace the persisted sequence.
    pub async fn persist(&self, seq: &str) -> anyhow::Result<()> {
        let path = self.path.clone();
        let line = format!("{seq}\n");
        tokio::task::spawn_blocking(move || persist_file(&path, &line))
            .await
            .map_err(|err| anyhow::anyhow!("persist cursor: {err:#}"))??;
        Ok(())
    }
}

fn persist_file(path: &Path, contents: &str) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CursorStore::new(dir.path().join(DEFAULT_CURSOR_FILE));
        assert_eq!(store.load().await.expect("load"), None);
    }

    #[tokio::test]
    async fn persisted_sequence_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CursorStore::new(dir.path().join(DEFAULT_CURSOR_FILE));

        store.persist("7").await.expect("persist");
        assert_eq!(store.load().await.expect("load"), Some("7".to_string()));

        store.persist("8:12").await.expect("persist");
        assert_eq!(store.load().await.expect("load"), Some("8:12".to_string()));
    }

    #[tokio::test]
    async fn file_holds_a_single_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(DEFAULT_CURSOR_FILE);
        let store = CursorStore::new(&path);

        store.persist("42").await.expect("persist");
        let raw = tokio::fs::read_to_string(&path).await.expect("read");
        assert_eq!(raw, "42\n");
    }
}
