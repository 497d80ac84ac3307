//! Workspace context selection for a phase.
//!
//! Read-only and deterministic: for an unchanged workspace the same phase
//! always gets the same files in the same order.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use walkdir::{DirEntry, WalkDir};

use crate::core::path_pattern::{PatternSet, normalize_path};
use crate::core::types::Phase;
use crate::io::config::ContextConfig;

/// Directory names never scanned, at any depth.
const SKIPPED_DIRS: &[&str] = &[".git", ".buildrun", "target", "node_modules"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextTier {
    /// Files matching the phase's explicit scope.
    Scope,
    /// Files matching the phase category's pattern set.
    Category,
    /// Ranked workspace files.
    Heuristic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContext {
    pub tier: ContextTier,
    pub files: Vec<ContextFile>,
    pub total_bytes: usize,
    /// True when the budget dropped candidate files.
    pub truncated: bool,
}

impl FileContext {
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.path.as_str())
    }
}

struct Candidate {
    path: String,
    modified: u64,
}

#[derive(Debug, Clone)]
pub struct ContextLoader {
    max_files: usize,
    max_bytes: usize,
    priority: PatternSet,
    categories: BTreeMap<String, PatternSet>,
}

impl ContextLoader {
    pub fn from_config(config: &ContextConfig) -> Result<Self> {
        let mut categories = BTreeMap::new();
        for (name, patterns) in &config.categories {
            let set = PatternSet::parse(patterns)
                .with_context(|| format!("context category {name}"))?;
            categories.insert(name.clone(), set);
        }
        Ok(Self {
            max_files: config.max_files,
            max_bytes: config.max_bytes,
            priority: PatternSet::parse(&config.priority_globs).context("context priority globs")?,
            categories,
        })
    }

    #[instrument(skip_all, fields(phase_id = %phase.id))]
    pub fn load(&self, phase: &Phase, root: &Path) -> Result<FileContext> {
        let candidates = scan(root)?;

        if phase.has_scope() {
            let scope = PatternSet::parse(&phase.scope).context("phase scope")?;
            let picked = by_path(candidates.iter().filter(|c| scope.matches_any(&c.path)));
            return self.fill(root, ContextTier::Scope, picked);
        }

        if let Some(category) = &phase.category
            && let Some(set) = self.categories.get(category)
        {
            let picked = by_path(candidates.iter().filter(|c| set.matches_any(&c.path)));
            if !picked.is_empty() {
                return self.fill(root, ContextTier::Category, picked);
            }
            debug!(category, "category matched no files, falling back to heuristic");
        }

        let mentioned: BTreeSet<String> = phase
            .deliverables
            .iter()
            .filter_map(|d| normalize_path(d).ok())
            .collect();
        let mut ranked: Vec<&Candidate> = candidates.iter().collect();
        ranked.sort_by_key(|c| {
            let rank = if mentioned.contains(&c.path) || phase.description.contains(&c.path) {
                0u8
            } else if self.priority.matches_any(&c.path) {
                1
            } else {
                2
            };
            (rank, Reverse(c.modified), c.path.clone())
        });
        self.fill(root, ContextTier::Heuristic, ranked)
    }

    /// Read `ordered` in order. Only the heuristic tier is held to the
    /// file and byte budget; scope and category sets load in full.
    fn fill(
        &self,
        root: &Path,
        tier: ContextTier,
        ordered: Vec<&Candidate>,
    ) -> Result<FileContext> {
        let bounded = tier == ContextTier::Heuristic;
        let mut files = Vec::new();
        let mut total_bytes = 0usize;
        let mut truncated = false;
        for candidate in ordered {
            if bounded && files.len() >= self.max_files {
                truncated = true;
                break;
            }
            let full = root.join(&candidate.path);
            let bytes = fs::read(&full).with_context(|| format!("read {}", full.display()))?;
            let Ok(content) = String::from_utf8(bytes) else {
                continue;
            };
            if bounded && total_bytes + content.len() > self.max_bytes {
                truncated = true;
                break;
            }
            total_bytes += content.len();
            files.push(ContextFile {
                path: candidate.path.clone(),
                content,
            });
        }
        debug!(?tier, files = files.len(), total_bytes, truncated, "context loaded");
        Ok(FileContext {
            tier,
            files,
            total_bytes,
            truncated,
        })
    }
}

fn by_path<'a>(candidates: impl Iterator<Item = &'a Candidate>) -> Vec<&'a Candidate> {
    let mut picked: Vec<&Candidate> = candidates.collect();
    picked.sort_by(|a, b| a.path.cmp(&b.path));
    picked
}

fn is_skipped(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
}

fn scan(root: &Path) -> Result<Vec<Candidate>> {
    let mut out = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_skipped(e));
    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let Some(rel) = rel.to_str() else {
            continue;
        };
        let Ok(path) = normalize_path(rel) else {
            continue;
        };
        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .map_or(0, mtime_secs);
        out.push(Candidate { path, modified });
    }
    Ok(out)
}

fn mtime_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}
