use crate::config::{Pattern, SyncPairConfig};
use crate::error::ConfigError;
use crate::utils::{ancestors_of, as_posix_path};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

/// Deny-list merged in when `source_code_only` is set: VCS metadata, build
/// outputs, dependency/cache directories and compiled artifacts.
pub const SOURCE_CODE_DENY_LIST: &[&str] = &[
    ".git/",
    ".svn/",
    ".hg/",
    ".bzr/",
    "node_modules/",
    "bower_components/",
    "vendor/bundle/",
    "target/",
    "build/",
    "dist/",
    "out/",
    "__pycache__/",
    ".venv/",
    "venv/",
    ".tox/",
    ".mypy_cache/",
    ".pytest_cache/",
    ".ruff_cache/",
    ".gradle/",
    ".next/",
    ".cache/",
    ".idea/",
    "*.pyc",
    "*.pyo",
    "*.o",
    "*.obj",
    "*.a",
    "*.so",
    "*.dylib",
    "*.dll",
    "*.exe",
    "*.class",
    "*.jar",
    "*.swp",
    "*.swo",
    ".DS_Store",
];

/// Exclude predicate over paths relative to a sync root, compiled once.
///
/// A pattern ending in `/` only matches directories (and so everything
/// beneath them). Any other pattern matches either the whole relative path
/// or its last component. A path below an excluded directory is excluded
/// too, whichever pattern excluded the directory.
#[derive(Debug, Clone)]
pub struct PathMatcher {
    any: GlobSet,
    dir_only: GlobSet,
}

impl PathMatcher {
    /// Build a matcher from user patterns, optionally merged with the
    /// built-in source-code deny-list. The two sets are a plain union.
    pub fn new(patterns: &[Pattern], source_code_only: bool) -> Result<Self, globset::Error> {
        let mut any = GlobSetBuilder::new();
        let mut dir_only = GlobSetBuilder::new();
        let builtins: &[&str] = if source_code_only { SOURCE_CODE_DENY_LIST } else { &[] };
        let all = builtins
            .iter()
            .copied()
            .chain(patterns.iter().map(|p| p.0.as_str()));
        for raw in all {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            match raw.strip_suffix('/') {
                Some(dir) => dir_only.add(Glob::new(dir.trim_start_matches('/'))?),
                None => any.add(Glob::new(raw.trim_start_matches('/'))?),
            };
        }
        Ok(Self {
            any: any.build()?,
            dir_only: dir_only.build()?,
        })
    }

    pub fn from_config(cfg: &SyncPairConfig) -> Result<Self, ConfigError> {
        Self::new(&cfg.exclude_patterns, cfg.source_code_only).map_err(|source| {
            ConfigError::Pattern {
                pair: cfg.name.clone(),
                pattern: source.glob().unwrap_or_default().to_string(),
                source,
            }
        })
    }

    /// Whether `rel` (relative to the sync root) must never be mirrored.
    pub fn excluded(&self, rel: &Path, is_dir: bool) -> bool {
        ancestors_of(rel)
            .iter()
            .any(|ancestor| self.matches(ancestor, true))
            || self.matches(rel, is_dir)
    }

    fn matches(&self, rel: &Path, is_dir: bool) -> bool {
        let full = as_posix_path(rel);
        let base = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.any.is_match(&full) || self.any.is_match(&base) {
            return true;
        }
        is_dir && (self.dir_only.is_match(&full) || self.dir_only.is_match(&base))
    }
}
