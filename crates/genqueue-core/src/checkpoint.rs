//! Locating checkpoints in the weights cache.
//!
//! Hub models (`org/repo`) are cached under `<cache>/models--org--repo/`,
//! possibly nested in snapshot directories; the first `.gguf` file found in
//! sorted path order is used.

use std::path::{Path, PathBuf};

use genqueue_common::{GenqueueError, Result};

pub const HUB_BASE_URL: &str = "https://huggingface.co";
const CHECKPOINT_EXT: &str = "gguf";

pub fn hub_cache_dir(cache_dir: &Path, model: &str) -> PathBuf {
    cache_dir.join(format!("models--{}", model.replace('/', "--")))
}

pub fn resolve(model: &str, cache_dir: &Path) -> Result<PathBuf> {
    let direct = Path::new(model);
    if direct.is_file() {
        return Ok(direct.to_path_buf());
    }
    let dir = hub_cache_dir(cache_dir, model);
    if !dir.is_dir() {
        return Err(GenqueueError::Checkpoint(format!(
            "{model} is not cached at {} (run `genqueue pull`)",
            dir.display()
        )));
    }
    let mut found = Vec::new();
    collect_checkpoints(&dir, &mut found)?;
    found.sort();
    found
        .into_iter()
        .next()
        .ok_or_else(|| GenqueueError::Checkpoint(format!("no .{CHECKPOINT_EXT} file under {}", dir.display())))
}

fn collect_checkpoints(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_checkpoints(&path, out)?;
        } else if path.extension().is_some_and(|e| e == CHECKPOINT_EXT) {
            out.push(path);
        }
    }
    Ok(())
}

/// Download URL for `file` of hub model `model` at `revision`.
pub fn hub_url(model: &str, file: &str, revision: &str) -> Result<String> {
    let mut parts = model.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(org), Some(repo), None) if !org.is_empty() && !repo.is_empty() => {
            Ok(format!("{HUB_BASE_URL}/{org}/{repo}/resolve/{revision}/{file}"))
        }
        _ => Err(GenqueueError::Checkpoint(format!("{model:?} is not an org/repo model name"))),
    }
}

/// Where `genqueue pull` stores `file` so that [`resolve`] finds it.
pub fn download_target(cache_dir: &Path, model: &str, file: &str) -> PathBuf {
    let name = Path::new(file).file_name().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(file));
    hub_cache_dir(cache_dir, model).join(name)
}
