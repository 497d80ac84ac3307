//! Unified diff model: parsing, rendering and context-checked application.
//!
//! Parsing is lenient about what proposers commonly get wrong (missing file
//! headers, stale hunk counts, CRLF). Application is strict: every context
//! and removed line must match the original text, otherwise the hunk is
//! rejected instead of being applied at a guessed location.

use std::fmt::Write as _;

pub const DEV_NULL: &str = "/dev/null";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiffError {
    #[error("diff contains no hunks")]
    NoHunks,
    #[error("invalid hunk header: {0}")]
    InvalidHunkHeader(String),
    #[error("diff touches more than one file")]
    MultipleFiles,
    #[error("hunk {hunk} does not match the original near line {line}")]
    ContextMismatch { hunk: usize, line: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

impl DiffLine {
    pub fn content(&self) -> &str {
        match self {
            DiffLine::Context(s) | DiffLine::Add(s) | DiffLine::Remove(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

impl DiffHunk {
    /// Lines the hunk expects in the original, in order.
    pub fn old_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            DiffLine::Context(s) | DiffLine::Remove(s) => Some(s.as_str()),
            DiffLine::Add(_) => None,
        })
    }

    /// Lines the hunk produces, in order.
    pub fn new_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            DiffLine::Context(s) | DiffLine::Add(s) => Some(s.as_str()),
            DiffLine::Remove(_) => None,
        })
    }

    /// `(old_count, new_count)` derived from the body rather than the header.
    pub fn body_counts(&self) -> (usize, usize) {
        (self.old_lines().count(), self.new_lines().count())
    }

    pub fn summary(&self) -> (usize, usize) {
        let adds = self.lines.iter().filter(|l| matches!(l, DiffLine::Add(_))).count();
        let removes = self
            .lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Remove(_)))
            .count();
        (adds, removes)
    }
}

/// A single-file unified diff. Header paths are kept as written; callers
/// strip `a/`/`b/` prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedDiff {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub hunks: Vec<DiffHunk>,
}

impl UnifiedDiff {
    pub fn has_headers(&self) -> bool {
        self.old_path.is_some() && self.new_path.is_some()
    }

    pub fn is_new_file(&self) -> bool {
        self.old_path.as_deref() == Some(DEV_NULL)
    }

    pub fn is_deletion(&self) -> bool {
        self.new_path.as_deref() == Some(DEV_NULL)
    }

    /// True when every line in every hunk is an addition.
    pub fn is_pure_addition(&self) -> bool {
        !self.hunks.is_empty()
            && self
                .hunks
                .iter()
                .all(|h| h.lines.iter().all(|l| matches!(l, DiffLine::Add(_))))
    }

    /// Full text of a pure-addition diff, newline terminated.
    pub fn added_text(&self) -> String {
        let mut out = String::new();
        for hunk in &self.hunks {
            for line in hunk.new_lines() {
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }

    pub fn stats(&self) -> (usize, usize) {
        self.hunks.iter().fold((0, 0), |acc, h| {
            let (a, r) = h.summary();
            (acc.0 + a, acc.1 + r)
        })
    }

    /// Recompute hunk counts and new-side starts from the hunk bodies.
    /// Returns true when any header changed.
    pub fn recount(&mut self) -> bool {
        let mut changed = false;
        let mut delta: isize = 0;
        for hunk in &mut self.hunks {
            let (old_count, new_count) = hunk.body_counts();
            let new_start = if new_count == 0 {
                hunk.old_start.saturating_add_signed(delta).saturating_sub(1)
            } else if old_count == 0 {
                hunk.old_start.saturating_add_signed(delta) + 1
            } else {
                hunk.old_start.saturating_add_signed(delta)
            };
            if (hunk.old_count, hunk.new_count, hunk.new_start) != (old_count, new_count, new_start)
            {
                changed = true;
            }
            hunk.old_count = old_count;
            hunk.new_count = new_count;
            hunk.new_start = new_start;
            delta += new_count as isize - old_count as isize;
        }
        changed
    }

    /// Render as unified diff text, with headers when paths are known.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let (Some(old), Some(new)) = (&self.old_path, &self.new_path) {
            let _ = writeln!(out, "--- {}", header_path(old, "a/"));
            let _ = writeln!(out, "+++ {}", header_path(new, "b/"));
        }
        for hunk in &self.hunks {
            let _ = writeln!(
                out,
                "@@ -{},{} +{},{} @@",
                hunk.old_start, hunk.old_count, hunk.new_start, hunk.new_count
            );
            for line in &hunk.lines {
                let (prefix, text) = match line {
                    DiffLine::Context(s) => (' ', s),
                    DiffLine::Add(s) => ('+', s),
                    DiffLine::Remove(s) => ('-', s),
                };
                let _ = writeln!(out, "{prefix}{text}");
            }
        }
        out
    }
}

fn header_path(path: &str, prefix: &str) -> String {
    if path == DEV_NULL {
        path.to_string()
    } else {
        format!("{prefix}{path}")
    }
}

/// Parse one file's unified diff. `--- `/`+++ ` headers are optional.
pub fn parse_unified_diff(text: &str) -> Result<UnifiedDiff, DiffError> {
    let lines: Vec<&str> = text.lines().collect();
    let mut old_path = None;
    let mut new_path = None;
    let mut hunks = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        if let Some(rest) = line.strip_prefix("--- ")
            && lines.get(i + 1).is_some_and(|next| next.starts_with("+++ "))
        {
            if !hunks.is_empty() {
                return Err(DiffError::MultipleFiles);
            }
            old_path = Some(header_value(rest));
            new_path = Some(header_value(&lines[i + 1][4..]));
            i += 2;
        } else if line.starts_with("@@") {
            hunks.push(parse_hunk(&lines, &mut i)?);
        } else {
            // `diff --git`, `index`, mode lines and stray prose before a hunk.
            if line.starts_with("diff --git ") && !hunks.is_empty() {
                return Err(DiffError::MultipleFiles);
            }
            i += 1;
        }
    }

    if hunks.is_empty() {
        return Err(DiffError::NoHunks);
    }
    Ok(UnifiedDiff {
        old_path,
        new_path,
        hunks,
    })
}

fn header_value(raw: &str) -> String {
    let raw = raw.trim_end_matches('\r');
    let path = match raw.find('\t') {
        Some(tab) => &raw[..tab],
        None => raw,
    };
    path.trim().to_string()
}

fn parse_hunk(lines: &[&str], idx: &mut usize) -> Result<DiffHunk, DiffError> {
    let header = lines[*idx].trim_end_matches('\r');
    let invalid = || DiffError::InvalidHunkHeader(header.to_string());

    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() < 3 || parts[0] != "@@" {
        return Err(invalid());
    }
    let old = parts[1].strip_prefix('-').ok_or_else(invalid)?;
    let new = parts[2].strip_prefix('+').ok_or_else(invalid)?;
    let (old_start, old_count) = parse_range(old).ok_or_else(invalid)?;
    let (new_start, new_count) = parse_range(new).ok_or_else(invalid)?;

    *idx += 1;
    let mut body = Vec::new();
    while *idx < lines.len() {
        let line = lines[*idx].trim_end_matches('\r');
        if line.starts_with("@@") || line.starts_with("diff --git ") {
            break;
        }
        if line.starts_with("--- ")
            && lines.get(*idx + 1).is_some_and(|next| next.starts_with("+++ "))
        {
            break;
        }
        if let Some(rest) = line.strip_prefix('+') {
            body.push(DiffLine::Add(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix('-') {
            body.push(DiffLine::Remove(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix(' ') {
            body.push(DiffLine::Context(rest.to_string()));
        } else if line.starts_with('\\') {
            // "\ No newline at end of file"
        } else {
            // Context line that lost its leading space. Still verified
            // against the original when applied.
            body.push(DiffLine::Context(line.to_string()));
        }
        *idx += 1;
    }

    // Blank lines beyond what the header declares are separators, not context.
    while matches!(body.last(), Some(DiffLine::Context(s)) if s.is_empty()) {
        let counted = DiffHunk {
            old_start,
            old_count,
            new_start,
            new_count,
            lines: body.clone(),
        }
        .body_counts();
        if counted.0 <= old_count || counted.1 <= new_count {
            break;
        }
        body.pop();
    }

    Ok(DiffHunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: body,
    })
}

fn parse_range(s: &str) -> Option<(usize, usize)> {
    match s.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((s.parse().ok()?, 1)),
    }
}

/// Apply `diff` to `original`.
///
/// Each hunk is placed at its declared line when the original matches
/// there, otherwise at the nearest matching position after the previous
/// hunk. The original's line terminator and trailing newline are preserved.
pub fn apply_diff(original: &str, diff: &UnifiedDiff) -> Result<String, DiffError> {
    if diff.hunks.is_empty() {
        return Err(DiffError::NoHunks);
    }
    let source: Vec<&str> = original.lines().collect();
    let mut out: Vec<&str> = Vec::with_capacity(source.len());
    let mut cursor = 0usize;

    for (n, hunk) in diff.hunks.iter().enumerate() {
        let old: Vec<&str> = hunk.old_lines().collect();
        let expected = if old.is_empty() {
            // Pure insertion: `old_start` names the line it follows.
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        let pos = locate(&source, &old, expected, cursor).ok_or(DiffError::ContextMismatch {
            hunk: n + 1,
            line: hunk.old_start,
        })?;

        out.extend_from_slice(&source[cursor..pos]);
        out.extend(hunk.new_lines().map(|l| l.trim_end_matches('\r')));
        cursor = pos + old.len();
    }
    out.extend_from_slice(&source[cursor..]);

    let eol = line_ending(original);
    let mut text = out.join(eol);
    let keep_newline = original.is_empty() || original.ends_with('\n');
    if keep_newline && !text.is_empty() {
        text.push_str(eol);
    }
    Ok(text)
}

/// Terminator of the first line; `\n` when there is none.
fn line_ending(text: &str) -> &'static str {
    match text.find('\n') {
        Some(i) if text[..i].ends_with('\r') => "\r\n",
        _ => "\n",
    }
}

fn locate(source: &[&str], old: &[&str], expected: usize, cursor: usize) -> Option<usize> {
    let last_start = source.len().checked_sub(old.len())?;
    if cursor > last_start {
        return None;
    }
    if old.is_empty() {
        return Some(expected.clamp(cursor, last_start));
    }
    let matches_at = |pos: usize| {
        source[pos..pos + old.len()]
            .iter()
            .zip(old)
            .all(|(have, want)| have.trim_end_matches('\r') == want.trim_end_matches('\r'))
    };
    if expected >= cursor && expected <= last_start && matches_at(expected) {
        return Some(expected);
    }
    (cursor..=last_start)
        .filter(|&pos| matches_at(pos))
        .min_by_key(|&pos| pos.abs_diff(expected))
}
