//! Dataset staging: fetch a zip of images and flatten it into the trainer's image folder.

use crate::error::{TrainingError, TrainingResult};
use crate::fetch::{url_file_name, Fetcher};
use crate::workspace::JobWorkspace;
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// Image extensions copied into the training folder (compared lowercase).
pub const ALLOWED_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Folders created by archiving tools that never hold training data.
pub const METADATA_DIRS: &[&str] = &["__MACOSX"];

/// Result of staging a dataset.
#[derive(Debug, Clone)]
pub struct StagedDataset {
    /// Flat folder the images were copied into.
    pub image_folder: PathBuf,
    /// Copied files, in copy order.
    pub images: Vec<PathBuf>,
}

/// Download `zip_url`, extract it and flatten its images into `img/<folder_name>`.
///
/// Fails if the archive holds no usable images.
pub async fn stage_dataset(
    fetcher: &dyn Fetcher,
    zip_url: &str,
    workspace: &JobWorkspace,
    folder_name: &str,
) -> TrainingResult<StagedDataset> {
    let archive_name = url_file_name(zip_url).unwrap_or_else(|_| "dataset.zip".to_string());
    let archive = workspace.downloads_dir().join(archive_name);

    info!(url = zip_url, "downloading dataset archive");
    fetcher.fetch(zip_url, &archive).await?;

    let extract_dir = workspace.extract_dir();
    let image_folder = workspace.ensure_training_dirs(folder_name)?;

    let target = image_folder.clone();
    let images = tokio::task::spawn_blocking(move || -> TrainingResult<Vec<PathBuf>> {
        extract_archive(&archive, &extract_dir)?;
        flatten_images(&extract_dir, &target)
    })
    .await
    .map_err(anyhow::Error::from)??;

    if images.is_empty() {
        return Err(TrainingError::Dataset(format!(
            "archive {zip_url} contains no {} images",
            ALLOWED_IMAGE_EXTENSIONS.join("/")
        )));
    }

    info!(count = images.len(), folder = %image_folder.display(), "dataset staged");
    Ok(StagedDataset { image_folder, images })
}

/// Extract a zip archive into `dest`.
///
/// Entries whose names would escape `dest` are skipped.
pub fn extract_archive(archive: &Path, dest: &Path) -> TrainingResult<usize> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| TrainingError::Dataset(format!("{} is not a zip archive: {e}", archive.display())))?;

    std::fs::create_dir_all(dest)?;
    let mut extracted = 0;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let Some(relative) = entry.enclosed_name() else {
            warn!(name = entry.name(), "skipping archive entry outside extraction root");
            continue;
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out)?;
        extracted += 1;
    }

    debug!(archive = %archive.display(), files = extracted, "archive extracted");
    Ok(extracted)
}

/// Copy every allowed image under `source_root` into `target`, dropping directory structure.
///
/// Metadata folders are pruned. Walk order is sorted by file name; a name seen twice gets a
/// `-1`, `-2`, ... suffix so no image is overwritten.
pub fn flatten_images(source_root: &Path, target: &Path) -> TrainingResult<Vec<PathBuf>> {
    std::fs::create_dir_all(target)?;

    let mut taken: HashSet<String> = HashSet::new();
    let mut copied = Vec::new();

    let walker = WalkDir::new(source_root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_metadata_dir(entry));

    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() || !is_allowed_image(entry.path()) {
            continue;
        }

        let name = unique_name(entry.path(), &mut taken);
        let dest = target.join(&name);
        std::fs::copy(entry.path(), &dest)?;
        copied.push(dest);
    }

    Ok(copied)
}

fn is_metadata_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry.file_name().to_str().is_some_and(|name| METADATA_DIRS.contains(&name))
}

fn is_allowed_image(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    let ext = ext.to_lowercase();
    ALLOWED_IMAGE_EXTENSIONS.iter().any(|allowed| *allowed == ext)
}

fn unique_name(path: &Path, taken: &mut HashSet<String>) -> String {
    let file_name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    if taken.insert(file_name.clone()) {
        return file_name;
    }

    let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().to_string()).unwrap_or_default();
    let mut counter = 1;
    loop {
        let candidate = format!("{stem}-{counter}.{ext}");
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
pub(crate) fn write_zip(path: &Path, entries: &[(&str, &str)]) {
    use std::io::Write;

    let file = File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    for (name, data) in entries {
        if name.ends_with('/') {
            zip.add_directory(*name, zip::write::SimpleFileOptions::default()).unwrap();
        } else {
            zip.start_file(*name, zip::write::SimpleFileOptions::default()).unwrap();
            zip.write_all(data.as_bytes()).unwrap();
        }
    }
    zip.finish().unwrap();
}
