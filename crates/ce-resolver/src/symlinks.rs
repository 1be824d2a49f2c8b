// SPDX-License-Identifier: MIT OR Apache-2.0
//! Symlink reconciliation: the engine's model subdirs become links into
//! the content cache so downloads and engine lookups share one location.

use std::io;
use std::path::Path;
use tracing::info;

/// The model subdirectories the runtime manages.
pub const MODEL_SUBDIRS: &[&str] = &[
    "checkpoints",
    "diffusion_models",
    "text_encoders",
    "vae",
    "loras",
    "controlnet",
];

/// For each managed subdir, make `<engine_models_root>/<subdir>` a symlink
/// to `<cache_models_root>/<subdir>`. A real directory already present is
/// drained into the cache first so nothing baked into the image is lost.
pub fn ensure_model_roots_on_cache(
    engine_models_root: &Path,
    cache_models_root: &Path,
) -> io::Result<()> {
    for subdir in MODEL_SUBDIRS {
        let cache_dir = cache_models_root.join(subdir);
        std::fs::create_dir_all(&cache_dir)?;

        let engine_dir = engine_models_root.join(subdir);
        if engine_dir.is_symlink() {
            continue;
        }
        if engine_dir.is_dir() {
            move_contents(&engine_dir, &cache_dir)?;
            std::fs::remove_dir_all(&engine_dir)?;
        }
        if let Some(parent) = engine_dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        symlink_dir(&cache_dir, &engine_dir)?;
        info!(
            engine_dir = %engine_dir.display(),
            cache_dir = %cache_dir.display(),
            "model subdir linked onto cache"
        );
    }
    Ok(())
}

fn move_contents(from: &Path, to: &Path) -> io::Result<()> {
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if dest.exists() {
            continue;
        }
        std::fs::rename(entry.path(), dest)?;
    }
    Ok(())
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}
