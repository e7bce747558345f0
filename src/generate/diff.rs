//! Unified diffs between two versions of a file.

use std::collections::BTreeMap;

use serde::Serialize;
use similar::{ChangeTag, TextDiff};

pub const DEFAULT_CONTEXT_LINES: usize = 3;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FileDiff {
    pub unified: String,
    pub additions: usize,
    pub deletions: usize,
    pub unchanged: usize,
    /// 0.0 (nothing shared) to 1.0 (identical)
    pub similarity: f32,
    pub identical: bool,
}

pub fn unified_diff(
    original: &str,
    modified: &str,
    original_name: &str,
    modified_name: &str,
    context_lines: usize,
) -> FileDiff {
    let diff = TextDiff::from_lines(original, modified);
    let (mut additions, mut deletions, mut unchanged) = (0, 0, 0);
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => additions += 1,
            ChangeTag::Delete => deletions += 1,
            ChangeTag::Equal => unchanged += 1,
        }
    }
    let unified = diff
        .unified_diff()
        .context_radius(context_lines)
        .header(original_name, modified_name)
        .to_string();

    FileDiff {
        identical: additions == 0 && deletions == 0,
        similarity: diff.ratio(),
        unified,
        additions,
        deletions,
        unchanged,
    }
}

/// Per-file diffs between two file sets. Files present on one side only diff
/// against an empty file.
pub fn diff_file_sets(
    before: &BTreeMap<String, String>,
    after: &BTreeMap<String, String>,
) -> BTreeMap<String, FileDiff> {
    let mut names: Vec<&String> = before.keys().chain(after.keys()).collect();
    names.sort();
    names.dedup();
    names
        .into_iter()
        .map(|name| {
            let old = before.get(name).map(String::as_str).unwrap_or("");
            let new = after.get(name).map(String::as_str).unwrap_or("");
            let diff = unified_diff(
                old,
                new,
                &format!("a/{}", name),
                &format!("b/{}", name),
                DEFAULT_CONTEXT_LINES,
            );
            (name.clone(), diff)
        })
        .collect()
}
