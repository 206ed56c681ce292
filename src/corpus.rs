//! Corpus directory walking.
//!
//! Lists candidate files under a directory using include/exclude globs
//! matched against paths relative to the corpus root. Listing does not
//! read any file; every returned path still goes through
//! [`SecurityGate::validate_path`](crate::security::SecurityGate::validate_path)
//! before it is opened.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use walkdir::WalkDir;

use crate::config::CorpusConfig;
use crate::error::{RagError, Result};

/// Relative paths (with `/` separators) of matching files under `dir`,
/// sorted for deterministic ingestion order. `dir` must lie under
/// `config.root` and should already be validated.
pub fn scan_corpus(config: &CorpusConfig, dir: &Path) -> Result<Vec<String>> {
    let root = config.root.canonicalize()?;
    if !dir.exists() {
        return Err(RagError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("corpus directory does not exist: {}", dir.display()),
        )));
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut excludes = vec![
        "**/.git/**".to_string(),
        "**/.*".to_string(),
        "**/node_modules/**".to_string(),
    ];
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).follow_links(config.follow_symlinks) {
        let entry = entry.map_err(|e| {
            RagError::Io(std::io::Error::other(format!("corpus walk failed: {}", e)))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(&root) else {
            tracing::warn!(path = %entry.path().display(), "skipping file outside corpus root");
            continue;
        };
        let rel_str = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }
        paths.push(rel_str);
    }

    paths.sort();
    Ok(paths)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).map_err(|e| {
            RagError::InvalidConfiguration(format!("invalid glob '{}': {}", pattern, e))
        })?);
    }
    builder
        .build()
        .map_err(|e| RagError::InvalidConfiguration(format!("glob set: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_scan_applies_globs_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("pojk/2020")).unwrap();
        std::fs::write(root.join("pojk/2020/b.txt"), "b").unwrap();
        std::fs::write(root.join("pojk/a.md"), "a").unwrap();
        std::fs::write(root.join("pojk/data.csv"), "x").unwrap();
        std::fs::write(root.join(".hidden.txt"), "h").unwrap();
        std::fs::write(root.join("draft.txt"), "d").unwrap();

        let mut config = Config::minimal(&root).corpus;
        config.exclude_globs = vec!["draft.txt".into()];

        let paths = scan_corpus(&config, &root).unwrap();
        assert_eq!(paths, vec!["pojk/2020/b.txt", "pojk/a.md"]);

        let sub = scan_corpus(&config, &root.join("pojk/2020")).unwrap();
        assert_eq!(sub, vec!["pojk/2020/b.txt"]);
    }

    #[test]
    fn test_bad_glob_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::minimal(dir.path()).corpus;
        config.include_globs = vec!["[".into()];
        assert!(matches!(
            scan_corpus(&config, dir.path()),
            Err(RagError::InvalidConfiguration(_))
        ));
    }
}
