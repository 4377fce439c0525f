//! Image discovery under an image root.

use anyhow::{Context, Result};
use std::path::{Component, Path};

/// Extensions recognised as diagram images (compared case-insensitively).
pub const IMAGE_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "bmp", "gif", "tif", "tiff"];

/// True if the path has an image extension.
#[must_use]
pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
}

/// Image id for a path relative to the root: components joined with `/`.
#[must_use]
pub fn image_id(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// All image ids under `root`, recursively, sorted.
///
/// # Errors
///
/// Returns an error if `root` or a subdirectory cannot be read.
pub fn discover_images(root: &Path) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("failed to read directory {}", dir.display()))?;
        for entry in entries.filter_map(std::result::Result::ok) {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                pending.push(path);
            } else if is_image(&path) {
                if let Ok(relative) = path.strip_prefix(root) {
                    ids.push(image_id(relative));
                }
            }
        }
    }

    ids.sort();
    Ok(ids)
}
