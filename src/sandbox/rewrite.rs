//! Rewriting interactive plot calls into file-producing calls.
//!
//! `plt.show()` has nowhere to display inside a headless sandbox, so each
//! statement that is exactly a show call is replaced, on the same line, by a
//! `savefig` into the workspace. Figures are numbered by occurrence, starting
//! at 1, and the line count of the program never changes, so interpreter
//! tracebacks still point at the caller's original line numbers.
//!
//! Known limitations: only the receivers in [`SHOW_RECEIVERS`] are recognized
//! (an alias such as `import matplotlib.pyplot as p` is not), a show call that
//! shares a line with a compound statement header (`if x: plt.show()`) is left
//! alone, and backslash line continuations are not followed. Lines inside
//! triple-quoted strings and comments are never rewritten.

/// Module paths whose `.show()` is rewritten, longest first.
pub const SHOW_RECEIVERS: [&str; 3] = ["matplotlib.pyplot", "pyplot", "plt"];

const FIGURE_PREFIX: &str = "figure_";
const FIGURE_SUFFIX: &str = ".png";

/// Source produced by [`rewrite_show_calls`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenSource {
    pub code: String,
    /// Number of show calls replaced; figures `1..=figure_count` may appear.
    pub figure_count: usize,
}

/// File name of the `index`-th figure (1-based).
pub fn figure_file_name(index: usize) -> String {
    format!("{FIGURE_PREFIX}{index}{FIGURE_SUFFIX}")
}

/// Inverse of [`figure_file_name`].
pub fn parse_figure_index(file_name: &str) -> Option<usize> {
    let digits = file_name
        .strip_prefix(FIGURE_PREFIX)?
        .strip_suffix(FIGURE_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Replace show calls with numbered `savefig` calls writing into `output_dir`
/// (a path as seen by the code inside the sandbox).
///
/// Pure and re-entrant: all counting state lives in this call.
pub fn rewrite_show_calls(code: &str, output_dir: &str) -> RewrittenSource {
    let output_dir = output_dir.trim_end_matches('/');
    let mut figure_count = 0;
    let mut open_string = None;
    let mut lines = Vec::new();

    for line in code.split('\n') {
        let rewritten = match open_string {
            Some(_) => None,
            None => match_show_statement(line).map(|(indent, receiver, rest)| {
                figure_count += 1;
                format!(
                    "{indent}{receiver}.savefig('{output_dir}/{}'){rest}",
                    figure_file_name(figure_count)
                )
            }),
        };
        open_string = advance_string_state(line, open_string);
        lines.push(rewritten.unwrap_or_else(|| line.to_string()));
    }

    RewrittenSource {
        code: lines.join("\n"),
        figure_count,
    }
}

/// Split a line into `(indent, receiver, rest)` when it starts with a bare
/// show call followed by nothing, a comment, or a `;`.
fn match_show_statement(line: &str) -> Option<(&str, &'static str, &str)> {
    let trimmed = line.trim_start();
    let indent = &line[..line.len() - trimmed.len()];

    SHOW_RECEIVERS.iter().find_map(|receiver| {
        let rest = trimmed.strip_prefix(receiver)?.strip_prefix(".show()")?;
        let tail = rest.trim_start();
        if tail.is_empty() || tail.starts_with('#') || tail.starts_with(';') {
            Some((indent, *receiver, rest))
        } else {
            None
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TripleQuote {
    Double,
    Single,
}

impl TripleQuote {
    fn delimiter(self) -> &'static [u8] {
        match self {
            TripleQuote::Double => b"\"\"\"",
            TripleQuote::Single => b"'''",
        }
    }
}

/// Track whether a triple-quoted string is still open after `line`.
fn advance_string_state(line: &str, mut open: Option<TripleQuote>) -> Option<TripleQuote> {
    let bytes = line.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let rest = &bytes[i..];
        if let Some(quote) = open {
            if rest[0] == b'\\' {
                i += 2;
            } else if rest.starts_with(quote.delimiter()) {
                open = None;
                i += 3;
            } else {
                i += 1;
            }
            continue;
        }

        match rest[0] {
            b'#' => break,
            b'\\' => i += 2,
            _ if rest.starts_with(b"\"\"\"") => {
                open = Some(TripleQuote::Double);
                i += 3;
            }
            _ if rest.starts_with(b"'''") => {
                open = Some(TripleQuote::Single);
                i += 3;
            }
            quote @ (b'"' | b'\'') => {
                // Single-line string literal: skip to its closing quote.
                let mut j = i + 1;
                while j < bytes.len() && bytes[j] != quote {
                    if bytes[j] == b'\\' {
                        j += 1;
                    }
                    j += 1;
                }
                i = j + 1;
            }
            _ => i += 1,
        }
    }

    open
}
