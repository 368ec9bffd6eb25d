use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use thiserror::Error;

/// Image extensions the enumerator recognises (compared case-insensitively)
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

/// Extension of the caption sidecar written next to each image
pub const CAPTION_EXTENSION: &str = "txt";

/// Errors raised while listing a folder for work
#[derive(Error, Debug)]
pub enum EnumerateError {
    #[error("Folder not found: {0}")]
    FolderNotFound(Utf8PathBuf),

    #[error("No images to caption in {0}")]
    NoWorkFound(Utf8PathBuf),

    #[error("Failed to read folder {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Whether `filename` carries one of the recognised image extensions
pub fn is_image_file(filename: &str) -> bool {
    Utf8Path::new(filename)
        .extension()
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

/// Path of the caption sidecar for `image_path` (same folder, same stem)
pub fn caption_path(image_path: &Utf8Path) -> Utf8PathBuf {
    image_path.with_extension(CAPTION_EXTENSION)
}

/// List the images in `folder` that need a caption.
///
/// Names are returned in byte-wise lexicographic order so batch boundaries are
/// deterministic. Unless `reprocess` is set, images that already have a
/// caption sidecar are skipped.
///
/// # Errors
/// - [`EnumerateError::FolderNotFound`] if `folder` is not a directory
/// - [`EnumerateError::NoWorkFound`] if nothing is left after filtering
pub fn enumerate(folder: &Utf8Path, reprocess: bool) -> Result<Vec<String>, EnumerateError> {
    if !folder.is_dir() {
        return Err(EnumerateError::FolderNotFound(folder.to_path_buf()));
    }

    let io_err = |source| EnumerateError::Io {
        path: folder.to_path_buf(),
        source,
    };

    let mut images = Vec::new();
    let mut already_captioned = 0usize;

    for entry in fs::read_dir(folder).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let Some(name) = utf8_file_name(&entry, folder) else {
            continue;
        };

        if !is_image_file(&name) || !entry.file_type().map_err(io_err)?.is_file() {
            continue;
        }

        if !reprocess && caption_path(&folder.join(&name)).exists() {
            already_captioned += 1;
            continue;
        }

        images.push(name);
    }

    images.sort();

    tracing::debug!(
        "Enumerated {} images in {} ({} already captioned, reprocess={})",
        images.len(),
        folder,
        already_captioned,
        reprocess
    );

    if images.is_empty() {
        return Err(EnumerateError::NoWorkFound(folder.to_path_buf()));
    }

    Ok(images)
}

/// Name of a directory entry, or `None` (logged) if it is not valid UTF-8.
///
/// Such entries can never be recognised images, so listing skips them.
pub(crate) fn utf8_file_name(entry: &fs::DirEntry, folder: &Utf8Path) -> Option<String> {
    match entry.file_name().into_string() {
        Ok(name) => Some(name),
        Err(raw) => {
            tracing::debug!("Skipping entry with a non UTF-8 name in {}: {:?}", folder, raw);
            None
        }
    }
}

/// Read a caption sidecar if one exists.
pub fn read_caption(image_path: &Utf8Path) -> Option<String> {
    fs::read_to_string(caption_path(image_path))
        .ok()
        .map(|caption| caption.trim().to_string())
}
