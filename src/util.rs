//! Small helpers shared by tools and the sandbox.

use std::path::{Path, PathBuf};

/// Locate `cmd` on `PATH` (or check it directly when it contains a slash).
pub fn find_on_path(cmd: &str) -> Option<PathBuf> {
    if cmd.contains('/') {
        let path = Path::new(cmd);
        return path.is_file().then(|| path.to_path_buf());
    }
    let path_var = std::env::var("PATH").ok()?;
    path_var
        .split(':')
        .filter(|dir| !dir.trim().is_empty())
        .map(|dir| PathBuf::from(dir).join(cmd))
        .find(|candidate| candidate.is_file())
}

pub fn command_on_path(cmd: &str) -> bool {
    find_on_path(cmd).is_some()
}

/// Cut `text` to at most `max_chars` characters on a char boundary.
///
/// Returns the possibly shortened text and whether anything was cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => (text[..byte_idx].to_string(), true),
        None => (text.to_string(), false),
    }
}

/// Strip ANSI escape sequences and control characters from process output.
pub fn sanitize_output(output: &str) -> String {
    let mut result = String::with_capacity(output.len());
    let mut chars = output.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // ESC [ ... final byte in @..~
            if chars.peek() == Some(&'[') {
                chars.next();
                for next in chars.by_ref() {
                    if ('@'..='~').contains(&next) {
                        break;
                    }
                }
            }
            continue;
        }
        if c.is_control() && c != '\n' && c != '\t' {
            continue;
        }
        result.push(c);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), ("hé".to_string(), true));
        assert_eq!(truncate_chars("abc", 3), ("abc".to_string(), false));
        assert_eq!(truncate_chars("", 0), (String::new(), false));
    }

    #[test]
    fn test_sanitize_output() {
        assert_eq!(sanitize_output("\x1b[31mred\x1b[0m\r\n"), "red\n");
        assert_eq!(sanitize_output("a\tb\x07c"), "a\tbc");
    }

    #[test]
    fn test_command_on_path() {
        assert!(command_on_path("sh"));
        assert!(!command_on_path("definitely-not-a-real-binary-4821"));
    }
}
