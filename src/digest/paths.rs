use crate::digest::config::OutputConfig;
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct DigestPaths {
    pub home: PathBuf,
    pub output_dir: PathBuf,
    pub cache_file: PathBuf,
    pub logs_dir: PathBuf,
}

impl DigestPaths {
    /// Default layout rooted at `home`.
    #[cfg(test)]
    pub fn under(home: &Path) -> Self {
        Self::from_output(home, &OutputConfig::default())
    }

    fn from_output(home: &Path, output: &OutputConfig) -> Self {
        Self {
            home: home.to_path_buf(),
            output_dir: anchor(home, &output.dir),
            cache_file: anchor(home, &output.cache_file),
            logs_dir: anchor(home, &output.logs_dir),
        }
    }
}

fn anchor(home: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        home.join(path)
    }
}

fn resolve_home() -> Result<PathBuf> {
    match env::var("DIGEST_HOME") {
        Ok(v) if !v.trim().is_empty() => Ok(PathBuf::from(v.trim())),
        _ => env::current_dir().context("working directory could not be resolved"),
    }
}

pub fn resolve_paths(output: &OutputConfig) -> Result<DigestPaths> {
    let home = resolve_home()?;
    Ok(DigestPaths::from_output(&home, output))
}
