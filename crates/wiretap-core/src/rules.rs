/// A literal search/replace rule applied to every relayed chunk.
///
/// Rules are applied in order, non-overlapping, over the whole chunk. They
/// are static for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteRule {
    pub find: String,
    pub replace: String,
}

impl RewriteRule {
    pub fn new(find: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            find: find.into(),
            replace: replace.into(),
        }
    }
}

/// Apply all rules in order to `text`.
pub fn apply_rules(rules: &[RewriteRule], text: &str) -> String {
    let mut out = text.to_string();
    for rule in rules {
        if rule.find.is_empty() {
            continue;
        }
        out = out.replace(&rule.find, &rule.replace);
    }
    out
}

/// Unescape a CLI search/replace token: `\n`, `\r`, `\t` and `\\` become the
/// control character they name; any other backslash sequence is kept as-is.
pub fn unescape(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
