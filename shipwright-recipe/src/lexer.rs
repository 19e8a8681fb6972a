//! Minimal Dockerfile-grammar tokenizer.
//!
//! This plays the role spec.md assumes is provided by an external, generic
//! Dockerfile parser: it has no knowledge of [`crate::Instruction`] and
//! produces only directive name + argument tokens + the verbatim source
//! line. [`crate::reader`] is the component that maps these raw nodes onto
//! typed instructions.

/// A single parsed directive, before it is mapped to an [`crate::Instruction`].
#[derive(Debug, Clone)]
pub struct RawNode {
    /// Upper-cased directive name (`FROM`, `RUN`, ...).
    pub directive: String,
    /// Whitespace/quote-aware tokens following the directive name.
    pub args: Vec<String>,
    /// The verbatim source line (directive + args), including original casing.
    pub original: String,
    /// 1-based line number in the recipe source.
    pub line: u32,
}

/// Tokenizes recipe text into raw directive nodes.
///
/// Handles line continuations (trailing `\`), `#`-comments (but not the
/// optional `# syntax=` / `# escape=` parser directives, which are skipped
/// like any other comment), and single/double-quoted argument tokens.
pub fn lex(text: &str) -> Vec<RawNode> {
    let mut nodes = Vec::new();
    let mut pending: Option<(String, u32)> = None;

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = (idx + 1) as u32;
        let trimmed = raw_line.trim_end();

        let (mut acc, start_line) = pending.take().unwrap_or_else(|| (String::new(), line_no));
        if !acc.is_empty() {
            acc.push(' ');
        }

        if let Some(body) = trimmed.strip_suffix('\\') {
            acc.push_str(body.trim_end());
            pending = Some((acc, start_line));
            continue;
        }
        acc.push_str(trimmed);

        let logical = acc.trim();
        if logical.is_empty() || logical.starts_with('#') {
            continue;
        }

        if let Some(node) = parse_logical_line(logical, start_line) {
            nodes.push(node);
        }
    }

    // A trailing continuation with no following line is still parsed.
    if let Some((acc, start_line)) = pending {
        let logical = acc.trim();
        if !logical.is_empty() && !logical.starts_with('#')
            && let Some(node) = parse_logical_line(logical, start_line)
        {
            nodes.push(node);
        }
    }

    nodes
}

/// Splits one logical (continuation-joined) line into a directive + tokens.
fn parse_logical_line(logical: &str, line: u32) -> Option<RawNode> {
    let mut parts = logical.splitn(2, char::is_whitespace);
    let directive = parts.next()?.to_ascii_uppercase();
    let rest = parts.next().unwrap_or("").trim();
    let args = tokenize_args(rest);
    Some(RawNode {
        directive,
        args,
        original: logical.to_owned(),
        line,
    })
}

/// Tokenizes the argument portion of a line, respecting single/double quotes.
fn tokenize_args(s: &str) -> Vec<String> {
    // A JSON-array-form argument list (`["a", "b"]`) is kept as a single token
    // so downstream variant constructors can detect and parse it distinctly.
    let trimmed = s.trim();
    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        return vec![trimmed.to_owned()];
    }

    let mut tokens = Vec::new();
    let mut cur = String::new();
    let mut quote: Option<char> = None;

    for c in s.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => cur.push(c),
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c.is_whitespace() => {
                if !cur.is_empty() {
                    tokens.push(std::mem::take(&mut cur));
                }
            }
            None => cur.push(c),
        }
    }
    if !cur.is_empty() {
        tokens.push(cur);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_continuations() {
        let nodes = lex("RUN echo a \\\n    && echo b\n");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].directive, "RUN");
        assert!(nodes[0].original.contains("echo a"));
        assert!(nodes[0].original.contains("echo b"));
    }

    #[test]
    fn drops_comments_and_blank_lines() {
        let nodes = lex("# comment\n\nFROM alpine\n");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].directive, "FROM");
    }

    #[test]
    fn quoted_tokens() {
        let nodes = lex(r#"LABEL maintainer="a b""#);
        assert_eq!(nodes[0].args, vec!["maintainer=a b"]);
    }

    #[test]
    fn json_array_form_kept_whole() {
        let nodes = lex(r#"CMD ["/bin/sh", "-c", "echo hi"]"#);
        assert_eq!(nodes[0].args, vec![r#"["/bin/sh", "-c", "echo hi"]"#]);
    }
}
