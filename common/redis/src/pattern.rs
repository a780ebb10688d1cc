//! Redis-style glob matching, as used by `KEYS` and pattern invalidation.
//!
//! Supported syntax: `*` (any run of characters), `?` (exactly one character),
//! `[abc]` / `[^abc]` / `[a-z]` character classes and `\` to escape the next
//! character. Braces are literal, as they are in Redis.

use globset::{GlobBuilder, GlobMatcher};

/// Rewrite Redis glob syntax into the dialect `globset` parses.
fn to_globset(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 4);
    let mut chars = pattern.chars();
    let mut in_class = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                out.push('\\');
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            '[' if !in_class => {
                let rest = chars.as_str();
                if rest.starts_with("^]") {
                    // Redis reads `[^]` as a negated empty class: any one character.
                    chars.nth(1);
                    out.push('?');
                } else if rest.starts_with('^') {
                    chars.next();
                    out.push_str("[!");
                    in_class = true;
                } else {
                    out.push('[');
                    in_class = true;
                }
            }
            ']' if in_class => {
                out.push(']');
                in_class = false;
            }
            '{' | '}' | ',' if !in_class => {
                out.push('\\');
                out.push(c);
            }
            other => out.push(other),
        }
    }

    out
}

/// Compile a glob pattern into a matcher over whole keys.
pub fn compile(pattern: &str) -> Result<GlobMatcher, globset::Error> {
    let glob = GlobBuilder::new(&to_globset(pattern))
        .literal_separator(false)
        .backslash_escape(true)
        .build()?;
    Ok(glob.compile_matcher())
}

/// Match a single key against a glob pattern. Invalid patterns match nothing.
pub fn glob_matches(pattern: &str, key: &str) -> bool {
    compile(pattern)
        .map(|matcher| matcher.is_match(key))
        .unwrap_or(false)
}
