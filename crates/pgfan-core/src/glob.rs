//! Component-wise glob matching for `schema.table` references.
//!
//! `*` matches any run of characters within one naming component, `?`
//! matches exactly one, and `[abc]` matches a character class. There is no
//! `**`; a wildcard never crosses the `.` separator.

use regex::Regex;

use crate::error::{Error, Result};

/// A compiled table glob. Patterns without a `.` are interpreted as
/// `public.<pattern>`.
#[derive(Debug, Clone)]
pub struct Glob {
    raw: String,
    re: Regex,
}

impl Glob {
    /// Compile a glob pattern. Fails on an unterminated character class or
    /// a pattern that produces an invalid regex.
    pub fn compile(pattern: &str) -> Result<Self> {
        let qualified = if pattern.contains('.') {
            pattern.to_string()
        } else {
            format!("public.{}", pattern)
        };

        let re = Regex::new(&glob_to_regex(&qualified)?)?;
        Ok(Self {
            raw: pattern.to_string(),
            re,
        })
    }

    /// Match a `schema.table` reference against this glob.
    pub fn matches(&self, table_ref: &str) -> bool {
        self.re.is_match(table_ref)
    }

    /// The pattern as written in the configuration.
    pub fn pattern(&self) -> &str {
        &self.raw
    }
}

/// Translate a glob into an anchored regex. Wildcards stop at the `.`
/// component separator.
fn glob_to_regex(pattern: &str) -> Result<String> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str("[^.]*"),
            '?' => out.push_str("[^.]"),
            '[' => {
                out.push('[');
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    if regex_syntax_char(inner) && inner != '-' {
                        out.push('\\');
                    }
                    out.push(inner);
                }
                if !closed {
                    return Err(Error::InvalidPattern {
                        pattern: pattern.to_string(),
                        message: "unterminated character class".to_string(),
                    });
                }
                out.push(']');
            }
            c if regex_syntax_char(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }

    out.push('$');
    Ok(out)
}

fn regex_syntax_char(c: char) -> bool {
    matches!(
        c,
        '\\' | '.' | '+' | '*' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$' | '-'
    )
}
