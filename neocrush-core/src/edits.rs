//! Line-based minimal edits.
//!
//! The agent streams full-document `didChange` notifications; the editor
//! expects a `workspace/applyEdit` that touches only the changed region so
//! unsaved edits elsewhere in the buffer survive. The diff is line-granular:
//! longest common prefix, longest non-overlapping common suffix, one edit for
//! the region in between.

use std::path::PathBuf;

use crate::protocol::{Position, Range, TextEdit};

/// Computes the minimal line edit turning `old_text` into `new_text`.
/// Returns `None` when the texts are identical.
pub fn compute_line_edits(old_text: &str, new_text: &str) -> Option<TextEdit> {
    let old_lines: Vec<&str> = old_text.split('\n').collect();
    let new_lines: Vec<&str> = new_text.split('\n').collect();

    let mut prefix = 0;
    while prefix < old_lines.len()
        && prefix < new_lines.len()
        && old_lines[prefix] == new_lines[prefix]
    {
        prefix += 1;
    }

    let mut suffix = 0;
    while suffix < old_lines.len() - prefix
        && suffix < new_lines.len() - prefix
        && old_lines[old_lines.len() - 1 - suffix] == new_lines[new_lines.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let old_start = prefix;
    let old_end = old_lines.len() - suffix;
    let new_start = prefix;
    let new_end = new_lines.len() - suffix;

    if old_start >= old_end && new_start >= new_end {
        return None;
    }

    let replacement_lines = &new_lines[new_start..new_end];
    let mut new_text = replacement_lines.join("\n");
    // Keep the boundary to the untouched suffix intact.
    if !replacement_lines.is_empty() && (new_end < new_lines.len() || old_end < old_lines.len()) {
        new_text.push('\n');
    }

    Some(TextEdit {
        range: Range {
            start: Position { line: old_start as u32, character: 0 },
            end: Position { line: old_end as u32, character: 0 },
        },
        new_text,
    })
}

/// Replacement text for a no-op highlight edit: the lines of `new_text`
/// covering `range`. Applied to a buffer already holding `new_text` (the
/// editor reads the file from disk after the agent saved it), the edit
/// changes nothing but still triggers the editor's open-and-highlight path.
pub fn noop_replacement(new_text: &str, range: &Range) -> String {
    let new_lines: Vec<&str> = new_text.split('\n').collect();
    let start = range.start.line as usize;
    let end = (range.end.line as usize).min(new_lines.len());

    if start >= end {
        return String::new();
    }

    let mut replacement = new_lines[start..end].join("\n");
    if range.end.line as usize <= new_lines.len() {
        replacement.push('\n');
    }
    replacement
}

/// Local filesystem path of a `file://` URI.
pub fn uri_to_path(uri: &str) -> Option<PathBuf> {
    uri.strip_prefix("file://").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Applies a line-range edit the way the editor would.
    fn apply(old_text: &str, edit: &TextEdit) -> String {
        let lines: Vec<&str> = old_text.split('\n').collect();
        let start = (edit.range.start.line as usize).min(lines.len());
        let end = (edit.range.end.line as usize).min(lines.len());

        let mut head = lines[..start].join("\n");
        if start > 0 {
            head.push('\n');
        }
        let tail = lines[end..].join("\n");

        format!("{head}{}{tail}", edit.new_text)
    }

    #[track_caller]
    fn assert_edit_reproduces_target(old: &str, new: &str) {
        match compute_line_edits(old, new) {
            Some(edit) => assert_eq!(apply(old, &edit), new, "edit {edit:?}"),
            None => assert_eq!(old, new, "identical inputs must diff to nothing"),
        }
    }

    #[test]
    fn single_line_change_produces_single_line_edit() {
        let edit = compute_line_edits("hello\nworld\n", "hello\nWORLD\n").unwrap();

        assert_eq!(edit.range.start, Position { line: 1, character: 0 });
        assert_eq!(edit.range.end, Position { line: 2, character: 0 });
        assert_eq!(edit.new_text, "WORLD\n");
    }

    #[test]
    fn identical_texts_produce_no_edit() {
        assert!(compute_line_edits("a\nb\n", "a\nb\n").is_none());
        assert!(compute_line_edits("", "").is_none());
    }

    #[test]
    fn applying_the_edit_yields_the_target() {
        let cases = [
            ("hello\nworld\n", "hello\nWORLD\n"),
            ("", "new content\n"),
            ("a\nb\nc", "a\nX\nc"),
            ("a\nb\nc\n", "a\nc\n"),
            ("a\n", "a\nb\n"),
            ("a\nb", ""),
            ("one", "two"),
            ("x\ny\nz\n", "x\nmid1\nmid2\ny\nz\n"),
            ("keep\ndrop1\ndrop2\nkeep2\n", "keep\nkeep2\n"),
            ("no trailing", "no trailing newline either"),
        ];

        for (old, new) in cases {
            assert_edit_reproduces_target(old, new);
        }
    }

    #[test]
    fn change_that_deletes_all_lines() {
        let edit = compute_line_edits("a\nb", "").unwrap();
        assert_eq!(edit.range.start.line, 0);
        assert_eq!(edit.range.end.line, 2);
        assert_eq!(edit.new_text, "");
        assert_eq!(apply("a\nb", &edit), "");
    }

    #[test]
    fn insert_at_end_of_file() {
        let edit = compute_line_edits("a\n", "a\nb\n").unwrap();
        assert_eq!(edit.range.start.line, 1);
        assert_eq!(edit.range.end.line, 1);
        assert_eq!(edit.new_text, "b\n");
    }

    #[test]
    fn document_without_trailing_newline() {
        let edit = compute_line_edits("alpha\nbeta", "alpha\ngamma").unwrap();
        assert_eq!(edit.range.start.line, 1);
        assert_eq!(edit.range.end.line, 2);
        assert_eq!(edit.new_text, "gamma");
    }

    #[test]
    fn noop_replacement_matches_new_lines_for_the_range() {
        let new_text = "hello\nWORLD\n";
        let edit = compute_line_edits("hello\nworld\n", new_text).unwrap();

        let replacement = noop_replacement(new_text, &edit.range);
        assert_eq!(replacement, "WORLD\n");
        // The buffer already holds new_text, so the edit is a no-op.
        assert_eq!(apply(new_text, &TextEdit { range: edit.range, new_text: replacement }), new_text);
    }

    #[test]
    fn uri_to_path_strips_the_file_scheme() {
        assert_eq!(uri_to_path("file:///tmp/a.txt"), Some(PathBuf::from("/tmp/a.txt")));
        assert_eq!(uri_to_path("https://example.com"), None);
    }
}
