//! Workspace-relative path normalization and glob patterns.
//!
//! Patterns are `globset` globs with a literal separator: `**` spans any
//! number of segments, `*` and `?` stay within one segment. A pattern
//! without metacharacters, or one ending in `/`, also matches everything
//! beneath it (`src/core` covers `src/core/mod.rs`), and `dir/**` matches
//! `dir` itself.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path '{0}' is absolute")]
    Absolute(String),
    #[error("path '{0}' escapes the workspace")]
    Traversal(String),
    #[error("path '{0}' contains a NUL byte")]
    Nul(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("invalid pattern '{pattern}': {reason}")]
    Invalid { pattern: String, reason: String },
}

/// Normalize a workspace-relative path to forward slashes with no `.`
/// segments. Absolute paths and `..` segments are rejected, never resolved.
pub fn normalize_path(raw: &str) -> Result<String, PathError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PathError::Empty);
    }
    if trimmed.contains('\0') {
        return Err(PathError::Nul(trimmed.to_string()));
    }
    let unified = trimmed.replace('\\', "/");
    if unified.starts_with('/') || has_drive_prefix(&unified) {
        return Err(PathError::Absolute(trimmed.to_string()));
    }

    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(PathError::Traversal(trimmed.to_string())),
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(segments.join("/"))
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    globs: GlobSet,
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for PathPattern {}

impl PathPattern {
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        let invalid = |reason: &str| PatternError::Invalid {
            pattern: raw.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = raw.trim().replace('\\', "/");
        if trimmed.is_empty() {
            return Err(invalid("empty pattern"));
        }
        if trimmed.starts_with('/') || has_drive_prefix(&trimmed) {
            return Err(invalid("patterns must be workspace-relative"));
        }
        if trimmed.split('/').any(|segment| segment == "..") {
            return Err(invalid("patterns must not contain '..'"));
        }
        let body = trimmed.trim_start_matches("./");
        if body.is_empty() {
            return Err(invalid("empty pattern"));
        }

        let globs = compile_globs(body).map_err(|err| invalid(&err.to_string()))?;
        Ok(Self {
            raw: raw.to_string(),
            globs,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match a path that has already been normalized.
    pub fn matches(&self, normalized_path: &str) -> bool {
        self.globs.is_match(normalized_path)
    }
}

/// The pattern itself plus the directory form it implies.
fn compile_globs(body: &str) -> Result<GlobSet, globset::Error> {
    let dir_prefix = body.ends_with('/');
    let body = body.trim_end_matches('/');
    let has_meta = body.contains(['*', '?', '[', '{']);

    let mut alternatives = vec![body.to_string()];
    if !has_meta || dir_prefix {
        alternatives.push(format!("{body}/**"));
    } else if let Some(base) = body.strip_suffix("/**") {
        alternatives.push(base.to_string());
    }

    let mut builder = GlobSetBuilder::new();
    for glob in &alternatives {
        builder.add(GlobBuilder::new(glob).literal_separator(true).build()?);
    }
    builder.build()
}

/// An ordered set of patterns; matches when any member matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternSet {
    patterns: Vec<PathPattern>,
}

impl PatternSet {
    pub fn parse<S: AsRef<str>>(raw: &[S]) -> Result<Self, PatternError> {
        let patterns = raw
            .iter()
            .map(|p| PathPattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn matches_any(&self, normalized_path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(normalized_path))
    }

    /// Patterns that match, in declaration order.
    pub fn matching(&self, normalized_path: &str) -> Vec<&str> {
        self.patterns
            .iter()
            .filter(|p| p.matches(normalized_path))
            .map(PathPattern::as_str)
            .collect()
    }
}
