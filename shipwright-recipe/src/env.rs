//! Build environment (C3): ARG/ENV variable scoping and `${k}`/`$k` expansion.

use std::collections::BTreeMap;

/// A flat variable map in effect while walking one stage's instructions.
///
/// `ARG` only sets a value if the key is absent (so an externally supplied
/// `--build-arg` or an earlier `ENV` wins); `ENV` always overwrites.
#[derive(Debug, Clone, Default)]
pub struct BuildEnv {
    vars: BTreeMap<String, String>,
    overrides: BTreeMap<String, String>,
}

impl BuildEnv {
    /// Creates an environment seeded with externally supplied `--build-arg`
    /// overrides. These take precedence over any `ARG ...=default` in the
    /// recipe, but not over a later `ENV` of the same name.
    #[must_use]
    pub fn with_overrides(overrides: BTreeMap<String, String>) -> Self {
        Self {
            vars: BTreeMap::new(),
            overrides,
        }
    }

    /// Handles an `ARG <key>[=<default>]` instruction.
    ///
    /// Sets `key` only if it is not already present: an override or a
    /// previous `ENV`/`ARG` always wins over a later `ARG`'s default.
    pub fn put_arg(&mut self, key: &str, default_value: Option<&str>) {
        if self.vars.contains_key(key) {
            return;
        }
        if let Some(value) = self.overrides.get(key) {
            self.vars.insert(key.to_owned(), value.clone());
            return;
        }
        if let Some(default_value) = default_value {
            self.vars.insert(key.to_owned(), default_value.to_owned());
        }
    }

    /// Handles an `ENV <name>=<value>` instruction. Always overwrites.
    pub fn put_env(&mut self, name: &str, value: &str) {
        let expanded = self.expand(value);
        self.vars.insert(name.to_owned(), expanded);
    }

    /// Expands `${k}` and `$k` references in `text` against the current
    /// variable map.
    ///
    /// A literal `$` is written as `$$` and is never treated as a reference.
    /// `$(...)` subshell syntax is left untouched: this is string
    /// substitution only, not a shell.
    #[must_use]
    pub fn expand(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }

            match chars.peek() {
                Some('$') => {
                    out.push('$');
                    chars.next();
                }
                Some('{') => {
                    chars.next();
                    let mut name = String::new();
                    for nc in chars.by_ref() {
                        if nc == '}' {
                            break;
                        }
                        name.push(nc);
                    }
                    match self.vars.get(&name) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push_str("${");
                            out.push_str(&name);
                            out.push('}');
                        }
                    }
                }
                Some('(') => {
                    // `$(...)` is left untouched, including the `$`.
                    out.push('$');
                }
                Some(nc) if is_name_start(*nc) => {
                    let mut name = String::new();
                    while let Some(nc) = chars.peek() {
                        if is_name_char(*nc) {
                            name.push(*nc);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    match self.vars.get(&name) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push('$');
                            out.push_str(&name);
                        }
                    }
                }
                _ => out.push('$'),
            }
        }

        out
    }

    /// Returns a point-in-time snapshot as `KEY=VALUE` pairs, sorted by key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.vars
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect()
    }

    /// Looks up a single variable.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

/// Whether `c` may start a bare (unbraced) variable name.
fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

/// Whether `c` may continue a bare (unbraced) variable name.
fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_always_overwrites_arg_default() {
        let mut env = BuildEnv::default();
        env.put_arg("PARAM1", Some("default"));
        env.put_env("PARAM1", "overridden");
        assert_eq!(env.get("PARAM1"), Some("overridden"));
    }

    #[test]
    fn build_arg_override_wins_over_recipe_default() {
        let mut overrides = BTreeMap::new();
        overrides.insert("PARAM1".to_owned(), "from-cli".to_owned());
        let mut env = BuildEnv::with_overrides(overrides);
        env.put_arg("PARAM1", Some("default"));
        assert_eq!(env.get("PARAM1"), Some("from-cli"));
    }

    #[test]
    fn later_arg_does_not_clobber_earlier_env() {
        let mut env = BuildEnv::default();
        env.put_env("PARAM1", "from-env");
        env.put_arg("PARAM1", Some("default"));
        assert_eq!(env.get("PARAM1"), Some("from-env"));
    }

    #[test]
    fn expands_braced_and_bare_references() {
        let mut env = BuildEnv::default();
        env.put_env("NAME", "world");
        assert_eq!(env.expand("hello ${NAME}"), "hello world");
        assert_eq!(env.expand("hello $NAME!"), "hello world!");
    }

    #[test]
    fn escaped_dollar_is_literal() {
        let env = BuildEnv::default();
        assert_eq!(env.expand("cost: $$5"), "cost: $5");
    }

    #[test]
    fn subshell_syntax_is_untouched() {
        let env = BuildEnv::default();
        assert_eq!(env.expand("echo $(date)"), "echo $(date)");
    }

    #[test]
    fn unknown_reference_is_preserved_literally() {
        let env = BuildEnv::default();
        assert_eq!(env.expand("${MISSING}x"), "${MISSING}x");
        assert_eq!(env.expand("$MISSING!"), "$MISSING!");
    }
}
