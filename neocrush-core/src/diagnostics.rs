//! Placeholder diagnostics.
//!
//! A pure function of document text that exercises the publish-diagnostics
//! path. A real language analyzer (or a downstream LSP server) would slot in
//! here.

use crate::protocol::{Diagnostic, Position, Range};

pub fn diagnostics_for_text(text: &str) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    for (row, line) in text.split('\n').enumerate() {
        if let Some(idx) = line.find("VS Code") {
            diagnostics.push(Diagnostic {
                range: line_range(row as u32, idx as u32, (idx + "VS Code".len()) as u32),
                severity: 1,
                source: "Common Sense".to_string(),
                message: "Please make sure we use good language in this video".to_string(),
            });
        }

        if let Some(idx) = line.find("Neovim") {
            diagnostics.push(Diagnostic {
                range: line_range(row as u32, idx as u32, (idx + "Neovim".len()) as u32),
                severity: 2,
                source: "Common Sense".to_string(),
                message: "Great choice :)".to_string(),
            });
        }
    }

    diagnostics
}

fn line_range(line: u32, start: u32, end: u32) -> Range {
    Range {
        start: Position { line, character: start },
        end: Position { line, character: end },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_text_produces_no_diagnostics() {
        assert!(diagnostics_for_text("fn main() {}\n").is_empty());
    }

    #[test]
    fn flags_are_positioned_on_the_matching_line() {
        let text = "first line\nI use VS Code daily\n";
        let diags = diagnostics_for_text(text);

        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].severity, 1);
        assert_eq!(diags[0].range.start.line, 1);
        assert_eq!(diags[0].range.start.character, 6);
        assert_eq!(diags[0].range.end.character, 6 + "VS Code".len() as u32);
    }

    #[test]
    fn both_rules_can_fire_on_one_line() {
        let diags = diagnostics_for_text("VS Code vs Neovim");
        assert_eq!(diags.len(), 2);
        assert_eq!(diags[0].severity, 1);
        assert_eq!(diags[1].severity, 2);
    }
}
