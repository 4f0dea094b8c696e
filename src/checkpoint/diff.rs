//! Line-oriented diffs for checkpoint chains.
//!
//! A diff is an ordered list of `{op, line, num}` entries over an LCS of the
//! two line sequences. Only changed lines are stored: `del` entries carry
//! the removed line and its 0-based position in the old content, `add`
//! entries carry the inserted line and its 0-based position in the new
//! content. Application removes the deleted positions from the old lines
//! and inserts the added lines at their final positions, so a diff's size
//! is proportional to the edit, not to the file.
//!
//! Lines are split on `\n` (not `str::lines`) so trailing newlines survive
//! the round trip byte-for-byte.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffOp {
    Add,
    Del,
    /// Tolerated on read for older diffs that recorded unchanged lines;
    /// never written, ignored on application.
    Eq,
}

/// One diff entry. `num` is the 0-based line position in the side the entry
/// belongs to: the new content for `add`, the old content for `del`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub op: DiffOp,
    pub line: String,
    pub num: usize,
}

/// Compute a line diff from `old` to `new` using a longest-common-subsequence
/// table. O(n·m) space; checkpoint inputs are single source files, where this
/// is fine.
pub fn line_diff(old: &str, new: &str) -> Vec<DiffEntry> {
    let old_lines: Vec<&str> = old.split('\n').collect();
    let new_lines: Vec<&str> = new.split('\n').collect();
    let n = old_lines.len();
    let m = new_lines.len();

    // lcs[i][j] = LCS length of old[i..] and new[j..].
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if old_lines[i] == new_lines[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut entries = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old_lines[i] == new_lines[j] {
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            entries.push(DiffEntry {
                op: DiffOp::Del,
                line: old_lines[i].to_string(),
                num: i,
            });
            i += 1;
        } else {
            entries.push(DiffEntry {
                op: DiffOp::Add,
                line: new_lines[j].to_string(),
                num: j,
            });
            j += 1;
        }
    }
    while i < n {
        entries.push(DiffEntry {
            op: DiffOp::Del,
            line: old_lines[i].to_string(),
            num: i,
        });
        i += 1;
    }
    while j < m {
        entries.push(DiffEntry {
            op: DiffOp::Add,
            line: new_lines[j].to_string(),
            num: j,
        });
        j += 1;
    }

    entries
}

/// Apply a diff to `old`, producing the new content.
pub fn apply_diff(old: &str, entries: &[DiffEntry]) -> String {
    let deleted: HashSet<usize> = entries
        .iter()
        .filter(|e| e.op == DiffOp::Del)
        .map(|e| e.num)
        .collect();

    let mut lines: Vec<String> = old
        .split('\n')
        .enumerate()
        .filter(|(i, _)| !deleted.contains(i))
        .map(|(_, l)| l.to_string())
        .collect();

    // Insert in ascending position order; each `num` is a final position in
    // the new content, so earlier inserts put later ones in range.
    let mut adds: Vec<&DiffEntry> = entries.iter().filter(|e| e.op == DiffOp::Add).collect();
    adds.sort_by_key(|e| e.num);
    for add in adds {
        let at = add.num.min(lines.len());
        lines.insert(at, add.line.clone());
    }

    lines.join("\n")
}
