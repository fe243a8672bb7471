use crate::api::Change;
use similar::{capture_diff_slices_deadline, Algorithm, DiffTag};
use std::time::{Duration, Instant};

/// Separator placed between changed fields in the combined content.
pub const FIELD_SEPARATOR: &str = "\n\n";

/// Combine every changed field into the single text the strategies test.
///
/// Fields with previous content contribute only their added lines.
pub fn combine_changes(changes: &[Change]) -> String {
    changes
        .iter()
        .map(|change| match change.old.as_deref() {
            Some(old) if !old.is_empty() => added_lines(old, &change.new),
            _ => change.new.clone(),
        })
        .collect::<Vec<_>>()
        .join(FIELD_SEPARATOR)
}

/// Upper bound on the time spent diffing one field. Past it the diff
/// degrades to a coarser, still valid, set of added lines.
const DIFF_DEADLINE: Duration = Duration::from_millis(500);

/// Lines of `new` that were inserted or replaced relative to `old`, in order.
pub fn added_lines(old: &str, new: &str) -> String {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let ops = capture_diff_slices_deadline(
        Algorithm::Myers,
        &old_lines,
        &new_lines,
        Some(Instant::now() + DIFF_DEADLINE),
    );
    ops.iter()
        .filter_map(|op| match op.as_tag_tuple() {
            (DiffTag::Insert | DiffTag::Replace, _, added) => Some(&new_lines[added]),
            _ => None,
        })
        .flatten()
        .copied()
        .collect::<Vec<_>>()
        .join("\n")
}

/// Substitute `%s`/`%d` placeholders with `args` in order; `%%` is a literal `%`.
///
/// Placeholders without a matching argument are left untouched.
pub fn render_template(template: &str, args: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut args = args.iter();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('%') => {
                chars.next();
                out.push('%');
            }
            Some(&spec @ ('s' | 'd')) => {
                chars.next();
                match args.next() {
                    Some(arg) => out.push_str(arg),
                    None => {
                        out.push('%');
                        out.push(spec);
                    }
                }
            }
            _ => out.push('%'),
        }
    }
    out
}

/// First line of `text`, cut to `limit` characters, for log output.
pub fn abbreviate(text: &str, limit: usize) -> String {
    let first = text.lines().next().unwrap_or("");
    if first.chars().count() <= limit && first.len() == text.len() {
        return first.to_string();
    }
    let cut: String = first.chars().take(limit.saturating_sub(3)).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_without_old_content() {
        assert_eq!(combine_changes(&[Change::new("Test")]), "Test");
    }

    #[test]
    fn test_with_old_content() {
        assert_eq!(
            combine_changes(&[Change::edit("Test", "Test 1 2 3")]),
            "Test 1 2 3"
        );
    }

    #[test]
    fn test_with_old_content_multiline() {
        assert_eq!(
            combine_changes(&[Change::edit("Text\n1 2 3\n7 8 9", "Test\n1 2 3\n4 5 6")]),
            "Test\n4 5 6"
        );
    }

    #[test]
    fn test_unchanged_content_adds_nothing() {
        let page = "= Heading =\nSome text\n\nMore text";
        assert_eq!(combine_changes(&[Change::edit(page, page)]), "");
    }

    #[test]
    fn test_insertion_keeps_order() {
        let old = "a\nb\nc";
        let new = "x\na\nb\ny\nc\nz";
        assert_eq!(added_lines(old, new), "x\ny\nz");
    }

    #[test]
    fn test_large_rewrite_adds_every_line() {
        let page = |prefix: &str| {
            (0..8000)
                .map(|i| format!("{prefix} line {i}"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let (old, new) = (page("old"), page("new"));
        assert_eq!(added_lines(&old, &new), new);
    }

    #[test]
    fn test_large_page_single_edit() {
        let old: Vec<String> = (0..10000).map(|i| format!("line {i}")).collect();
        let mut new = old.clone();
        new[5000] = "casino bonus".to_string();
        new.insert(9000, "cheap pills".to_string());
        assert_eq!(
            added_lines(&old.join("\n"), &new.join("\n")),
            "casino bonus\ncheap pills"
        );
    }

    #[test]
    fn test_empty_old_content_uses_new_verbatim() {
        assert_eq!(combine_changes(&[Change::edit("", "a\nb")]), "a\nb");
    }

    #[test]
    fn test_fields_joined_by_blank_line() {
        let changes = vec![
            Change::new("Summary"),
            Change::edit("line one", "line one\nline two"),
        ];
        assert_eq!(combine_changes(&changes), "Summary\n\nline two");
    }

    #[test]
    fn test_render_template() {
        let args = vec!["spam.example".to_string(), "3".to_string()];
        assert_eq!(
            render_template("Host %s listed %d times (100%%)", &args),
            "Host spam.example listed 3 times (100%)"
        );
        assert_eq!(render_template("Missing %s", &[]), "Missing %s");
        assert_eq!(render_template("Plain", &args), "Plain");
    }

    #[test]
    fn test_abbreviate() {
        assert_eq!(abbreviate("short", 75), "short");
        assert_eq!(abbreviate("first\nsecond", 75), "first...");
        assert_eq!(abbreviate("abcdefghij", 6), "abc...");
    }
}
