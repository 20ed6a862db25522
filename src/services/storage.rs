use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Local directories shared by the web server and the workers.
///
/// Uploads are fully written and synced before their location is handed to
/// the queue, so a worker never reads a partially written file.
#[derive(Debug, Clone)]
pub struct UploadStorage {
    upload_dir: PathBuf,
    output_dir: PathBuf,
}

impl UploadStorage {
    pub fn new(upload_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    /// Create both directories if they do not exist yet.
    pub async fn ensure_dirs(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.upload_dir)
            .await
            .map_err(|e| StorageError::Io(self.upload_dir.clone(), e))?;
        fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| StorageError::Io(self.output_dir.clone(), e))?;
        Ok(())
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Persist upload bytes under a collision-free name and return the path.
    pub async fn save_upload(&self, filename: &str, data: &[u8]) -> Result<PathBuf, StorageError> {
        let name = format!("{}-{}", Uuid::new_v4().simple(), sanitize_filename(filename));
        let path = self.upload_dir.join(name);

        let mut file = fs::File::create(&path)
            .await
            .map_err(|e| StorageError::Io(path.clone(), e))?;
        file.write_all(data)
            .await
            .map_err(|e| StorageError::Io(path.clone(), e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::Io(path.clone(), e))?;

        Ok(path)
    }

    /// Read a produced artifact back for download.
    pub async fn read_artifact(&self, location: &str) -> Result<Vec<u8>, StorageError> {
        let path = PathBuf::from(location);
        fs::read(&path).await.map_err(|e| StorageError::Io(path, e))
    }
}

/// Keep only the final path component and a conservative character set.
pub fn sanitize_filename(filename: &str) -> String {
    let base = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    let cleaned: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();

    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Content type for an artifact, from its extension.
pub fn content_type_for(location: &str) -> &'static str {
    let ext = Path::new(location)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
}
