use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

/// A trained adapter on local disk, ready to publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingArtifact {
    pub path: PathBuf,
    /// File name used as the object key.
    pub name: String,
    pub sha256: String,
    pub size_bytes: u64,
}

pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn make_artifact(path: PathBuf) -> TrainingResult<TrainingArtifact> {
    if !path.is_file() {
        return Err(TrainingError::Artifact(format!(
            "artifact path does not exist: {}",
            path.display()
        )));
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| TrainingError::Artifact(format!("artifact has no file name: {}", path.display())))?;
    let size_bytes = std::fs::metadata(&path)?.len();
    let sha256 = sha256_file(&path)?;
    Ok(TrainingArtifact { path, name, sha256, size_bytes })
}
