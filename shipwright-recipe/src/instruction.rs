//! The [`Instruction`] tagged union and its mapping from raw lexer nodes.

use crate::error::{Error, Result};
use crate::lexer::RawNode;

/// A single parsed recipe directive.
///
/// Closed tagged union (spec.md §9's redesign note): no runtime type-switch
/// over an open interface. Every variant carries the verbatim source line so
/// identity is preserved across stage splitting and dependency-stage
/// deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Instruction {
    /// `FROM <image> [AS <name>]`.
    From {
        /// Base image reference.
        base_image: String,
        /// Optional stage alias (`AS <name>`).
        stage_name: Option<String>,
        /// Verbatim source text.
        original: String,
    },
    /// `ARG <key>[=<default>]`.
    Arg {
        /// Argument name.
        key: String,
        /// Default value, if given.
        default_value: Option<String>,
        /// Verbatim source text.
        original: String,
    },
    /// `ENV <name>=<value>` (or `ENV <name> <value>`).
    Env {
        /// Variable name.
        name: String,
        /// Variable value (unexpanded).
        value: String,
        /// Verbatim source text.
        original: String,
    },
    /// `LABEL <key>=<value>`.
    Label {
        /// Label key.
        key: String,
        /// Label value.
        value: String,
        /// Verbatim source text.
        original: String,
    },
    /// `WORKDIR <value>`.
    Workdir {
        /// New working directory (relative or absolute).
        value: String,
        /// Verbatim source text.
        original: String,
    },
    /// `USER <value>`.
    User {
        /// User[:group] specifier.
        value: String,
        /// Verbatim source text.
        original: String,
    },
    /// `SHELL ["exe", "arg", ...]`.
    Shell {
        /// Shell invocation tokens.
        tokens: Vec<String>,
        /// Verbatim source text.
        original: String,
    },
    /// `ADD <source> <target>`.
    Add {
        /// Source token, as written.
        source: String,
        /// Target path.
        target: String,
        /// Effective user at this point in the stage.
        user: String,
        /// Effective workdir at this point in the stage.
        workdir: String,
        /// Optional `--chown=user:group`.
        chown: Option<String>,
        /// Verbatim source text.
        original: String,
    },
    /// `COPY [--from=<stage>] <source> <target>`.
    Copy {
        /// Source token, as written.
        source: String,
        /// Target path.
        target: String,
        /// Cross-stage source, if `--from=` was given.
        from_stage: Option<String>,
        /// Effective user at this point in the stage.
        user: String,
        /// Effective workdir at this point in the stage.
        workdir: String,
        /// Optional `--chown=user:group`.
        chown: Option<String>,
        /// Verbatim source text.
        original: String,
    },
    /// `RUN <command>`.
    Run {
        /// The command text (shell form) or argv (exec form), joined.
        command: String,
        /// Environment snapshot in effect (`KEY=VALUE`).
        env: Vec<String>,
        /// Extra `--arg`-style build args visible to this command (unused by
        /// default; reserved for recipe dialects that pass per-RUN args).
        args: Vec<String>,
        /// Shell tokens in effect (`/bin/sh -c` by default).
        shell: Vec<String>,
        /// Effective user at this point in the stage.
        user: String,
        /// Effective workdir at this point in the stage.
        workdir: String,
        /// Verbatim source text.
        original: String,
    },
    /// `EXPOSE <port>[/proto]`.
    Expose {
        /// Raw port/protocol token as written.
        raw_value: String,
        /// Verbatim source text.
        original: String,
    },
    /// `VOLUME <path> [<path> ...]`.
    Volume {
        /// Declared volume paths.
        values: Vec<String>,
        /// Effective user at this point in the stage.
        user: String,
        /// Effective workdir at this point in the stage.
        workdir: String,
        /// Verbatim source text.
        original: String,
    },
    /// `CMD ["exe", "arg", ...]`.
    Cmd {
        /// Command tokens.
        values: Vec<String>,
        /// Verbatim source text.
        original: String,
    },
    /// `ENTRYPOINT ["exe", "arg", ...]`.
    Entrypoint {
        /// Entrypoint tokens.
        values: Vec<String>,
        /// Verbatim source text.
        original: String,
    },
}

impl Instruction {
    /// Returns the verbatim source text this instruction was parsed from.
    ///
    /// Stable identity used to deduplicate a dependency stage's reconstructed
    /// recipe (spec.md §4.5).
    #[must_use]
    pub fn original(&self) -> &str {
        match self {
            Self::From { original, .. }
            | Self::Arg { original, .. }
            | Self::Env { original, .. }
            | Self::Label { original, .. }
            | Self::Workdir { original, .. }
            | Self::User { original, .. }
            | Self::Shell { original, .. }
            | Self::Add { original, .. }
            | Self::Copy { original, .. }
            | Self::Run { original, .. }
            | Self::Expose { original, .. }
            | Self::Volume { original, .. }
            | Self::Cmd { original, .. }
            | Self::Entrypoint { original, .. } => original,
        }
    }

    /// Maps one raw lexer node to a typed instruction.
    ///
    /// Unknown directives (`HEALTHCHECK`, `ONBUILD`, `STOPSIGNAL`,
    /// `MAINTAINER`) return `Ok(None)`; the caller logs a debug entry and
    /// drops them (spec.md §4.1).
    pub fn from_raw(node: &RawNode, user: &str, workdir: &str, shell: &[String]) -> Result<Option<Self>> {
        let original = node.original.clone();
        Ok(match node.directive.as_str() {
            "FROM" => {
                let image = node
                    .args
                    .first()
                    .ok_or_else(|| Error::Parse {
                        line: node.line,
                        message: "FROM requires a base image".into(),
                    })?
                    .clone();
                let stage_name = node
                    .args
                    .iter()
                    .position(|a| a.eq_ignore_ascii_case("as"))
                    .and_then(|i| node.args.get(i + 1))
                    .cloned();
                Some(Self::From {
                    base_image: image,
                    stage_name,
                    original,
                })
            }
            "ARG" => {
                let tok = node.args.first().ok_or(Error::ArgMissing(node.line))?;
                let (key, default_value) = match tok.split_once('=') {
                    Some((k, v)) => (k.to_owned(), Some(v.to_owned())),
                    None => (tok.clone(), None),
                };
                Some(Self::Arg {
                    key,
                    default_value,
                    original,
                })
            }
            "ENV" => {
                let (name, value) = parse_key_value(&node.args, node.line)?;
                Some(Self::Env {
                    name,
                    value,
                    original,
                })
            }
            "LABEL" => {
                let (key, value) = parse_key_value(&node.args, node.line)?;
                Some(Self::Label {
                    key,
                    value,
                    original,
                })
            }
            "WORKDIR" => {
                let value = node
                    .args
                    .first()
                    .ok_or_else(|| Error::Parse {
                        line: node.line,
                        message: "WORKDIR requires a path".into(),
                    })?
                    .clone();
                Some(Self::Workdir { value, original })
            }
            "USER" => {
                let value = node
                    .args
                    .first()
                    .ok_or_else(|| Error::Parse {
                        line: node.line,
                        message: "USER requires a value".into(),
                    })?
                    .clone();
                Some(Self::User { value, original })
            }
            "SHELL" => {
                let tokens = parse_json_array(&node.args, node.line)?;
                Some(Self::Shell { tokens, original })
            }
            "ADD" => {
                let (chown, rest) = split_chown(&node.args);
                let (source, target) = parse_source_target(&rest, node.line)?;
                Some(Self::Add {
                    source,
                    target,
                    user: user.to_owned(),
                    workdir: workdir.to_owned(),
                    chown,
                    original,
                })
            }
            "COPY" => {
                let (from_stage, rest) = split_from(&node.args);
                let (chown, rest) = split_chown(&rest);
                let (source, target) = parse_source_target(&rest, node.line)?;
                Some(Self::Copy {
                    source,
                    target,
                    from_stage,
                    user: user.to_owned(),
                    workdir: workdir.to_owned(),
                    chown,
                    original,
                })
            }
            "RUN" => {
                let command = if node.args.len() == 1 && node.args[0].starts_with('[') {
                    parse_json_array(&node.args, node.line)?.join(" ")
                } else {
                    node.args.join(" ")
                };
                Some(Self::Run {
                    command,
                    env: Vec::new(),
                    args: Vec::new(),
                    shell: shell.to_vec(),
                    user: user.to_owned(),
                    workdir: workdir.to_owned(),
                    original,
                })
            }
            "EXPOSE" => {
                let raw_value = node
                    .args
                    .first()
                    .ok_or_else(|| Error::Parse {
                        line: node.line,
                        message: "EXPOSE requires a port".into(),
                    })?
                    .clone();
                Some(Self::Expose {
                    raw_value,
                    original,
                })
            }
            "VOLUME" => {
                let values = if node.args.len() == 1 && node.args[0].starts_with('[') {
                    parse_json_array(&node.args, node.line)?
                } else {
                    node.args.clone()
                };
                if values.is_empty() {
                    return Err(Error::Parse {
                        line: node.line,
                        message: "VOLUME requires at least one path".into(),
                    });
                }
                Some(Self::Volume {
                    values,
                    user: user.to_owned(),
                    workdir: workdir.to_owned(),
                    original,
                })
            }
            "CMD" => {
                let values = parse_exec_or_shell(&node.args, node.line, shell)?;
                Some(Self::Cmd { values, original })
            }
            "ENTRYPOINT" => {
                let values = parse_exec_or_shell(&node.args, node.line, shell)?;
                Some(Self::Entrypoint { values, original })
            }
            "HEALTHCHECK" | "ONBUILD" | "STOPSIGNAL" | "MAINTAINER" => {
                tracing::debug!(directive = %node.directive, line = node.line, "dropping unsupported directive");
                None
            }
            other => {
                return Err(Error::Parse {
                    line: node.line,
                    message: format!("unknown directive: {other}"),
                });
            }
        })
    }
}

/// Splits a `KEY=VALUE` or `KEY VALUE` pair (ENV/LABEL grammar).
fn parse_key_value(args: &[String], line: u32) -> Result<(String, String)> {
    if args.is_empty() {
        return Err(Error::Parse {
            line,
            message: "expected KEY=VALUE".into(),
        });
    }
    if let Some((k, v)) = args[0].split_once('=') {
        return Ok((k.to_owned(), v.to_owned()));
    }
    let value = args.get(1).cloned().unwrap_or_default();
    Ok((args[0].clone(), value))
}

/// Parses a `["a", "b"]` JSON-array-form argument into plain tokens.
fn parse_json_array(args: &[String], line: u32) -> Result<Vec<String>> {
    let joined = args.join(" ");
    let trimmed = joined.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| Error::Parse {
            line,
            message: "expected JSON array form".into(),
        })?;
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(inner
        .split(',')
        .map(|s| s.trim().trim_matches('"').to_owned())
        .collect())
}

/// CMD/ENTRYPOINT accept either exec (JSON array) or shell form.
fn parse_exec_or_shell(args: &[String], line: u32, shell: &[String]) -> Result<Vec<String>> {
    if args.len() == 1 && args[0].trim_start().starts_with('[') {
        return parse_json_array(args, line);
    }
    let mut values = shell.to_vec();
    values.push(args.join(" "));
    Ok(values)
}

/// Extracts a `--from=<stage>` flag, returning the remaining args.
fn split_from(args: &[String]) -> (Option<String>, Vec<String>) {
    let mut from_stage = None;
    let mut rest = Vec::with_capacity(args.len());
    for a in args {
        if let Some(v) = a.strip_prefix("--from=") {
            from_stage = Some(v.to_owned());
        } else {
            rest.push(a.clone());
        }
    }
    (from_stage, rest)
}

/// Extracts a `--chown=<user>:<group>` flag, returning the remaining args.
fn split_chown(args: &[String]) -> (Option<String>, Vec<String>) {
    let mut chown = None;
    let mut rest = Vec::with_capacity(args.len());
    for a in args {
        if let Some(v) = a.strip_prefix("--chown=") {
            chown = Some(v.to_owned());
        } else {
            rest.push(a.clone());
        }
    }
    (chown, rest)
}

/// ADD/COPY grammar: last token is the target, everything before is source(s).
///
/// Only the single-source form is supported; multi-source COPY collapses
/// onto the first source token (sufficient for the planner's single-resource
/// model per source instruction).
fn parse_source_target(args: &[String], line: u32) -> Result<(String, String)> {
    if args.len() < 2 {
        return Err(Error::Parse {
            line,
            message: "expected <source> <target>".into(),
        });
    }
    let target = args.last().cloned().unwrap_or_default();
    let source = args[0].clone();
    Ok((source, target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;

    fn one(src: &str) -> Instruction {
        let nodes = lex(src);
        Instruction::from_raw(&nodes[0], "0:0", "/", &["/bin/sh".into(), "-c".into()])
            .unwrap()
            .unwrap()
    }

    #[test]
    fn from_with_alias() {
        let i = one("FROM golang:alpine AS builder");
        assert_eq!(
            i,
            Instruction::From {
                base_image: "golang:alpine".into(),
                stage_name: Some("builder".into()),
                original: "FROM golang:alpine AS builder".into(),
            }
        );
    }

    #[test]
    fn arg_default() {
        let i = one("ARG PARAM1=value");
        assert_eq!(
            i,
            Instruction::Arg {
                key: "PARAM1".into(),
                default_value: Some("value".into()),
                original: "ARG PARAM1=value".into(),
            }
        );
    }

    #[test]
    fn arg_missing_is_error() {
        let nodes = lex("ARG");
        let err = Instruction::from_raw(&nodes[0], "0:0", "/", &[]).unwrap_err();
        assert!(matches!(err, Error::ArgMissing(1)));
    }

    #[test]
    fn copy_from_stage_and_chown() {
        let i = one("COPY --from=builder --chown=1000:1000 /out/app /usr/local/bin/app");
        match i {
            Instruction::Copy {
                source,
                target,
                from_stage,
                chown,
                ..
            } => {
                assert_eq!(source, "/out/app");
                assert_eq!(target, "/usr/local/bin/app");
                assert_eq!(from_stage.as_deref(), Some("builder"));
                assert_eq!(chown.as_deref(), Some("1000:1000"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_directive_is_dropped() {
        let nodes = lex("HEALTHCHECK CMD curl -f http://localhost/");
        let out = Instruction::from_raw(&nodes[0], "0:0", "/", &[]).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn cmd_exec_form() {
        let i = one(r#"CMD ["/bin/sh", "-c", "echo hi"]"#);
        match i {
            Instruction::Cmd { values, .. } => {
                assert_eq!(values, vec!["/bin/sh", "-c", "echo hi"]);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
