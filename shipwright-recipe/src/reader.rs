//! Recipe source acquisition and instruction-level parsing (C1).
//!
//! A recipe source is one of:
//!   - a local filesystem path,
//!   - an `http://` or `https://` URL,
//!   - a `git+<url>[:<subpath>]` reference, cloned into a scratch directory.
//!
//! [`read`] fetches the source text and maps it onto a flat, ordered
//! [`Instruction`] list; splitting that list into stages is [`crate::stage`]'s
//! job.

use std::path::Path;

use crate::error::{Error, Result};
use crate::instruction::Instruction;
use crate::lexer::lex;

const DEFAULT_USER: &str = "0:0";
const DEFAULT_WORKDIR: &str = "/";

/// Reads a recipe from `source` and parses it into an ordered instruction list.
///
/// `source` is interpreted in the order above: `git+` prefix first, then
/// `http://`/`https://`, then local path.
pub async fn read(source: &str) -> Result<Vec<Instruction>> {
    let text = fetch(source).await?;
    parse(&text)
}

/// Fetches the raw recipe text without parsing it.
async fn fetch(source: &str) -> Result<String> {
    if let Some(spec) = source.strip_prefix("git+") {
        return fetch_git(spec).await;
    }
    if source.starts_with("http://") || source.starts_with("https://") {
        return fetch_http(source).await;
    }
    fetch_local(source.as_ref())
}

/// Reads a recipe from the local filesystem.
fn fetch_local(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        Error::InvalidSource(format!("cannot read {}: {e}", path.display()))
    })
}

/// Fetches a recipe over HTTP(S).
async fn fetch_http(url: &str) -> Result<String> {
    let resp = reqwest::get(url)
        .await
        .map_err(|e| Error::InvalidSource(format!("fetching {url}: {e}")))?;
    if !resp.status().is_success() {
        return Err(Error::InvalidSource(format!(
            "fetching {url}: status {}",
            resp.status()
        )));
    }
    resp.text()
        .await
        .map_err(|e| Error::InvalidSource(format!("reading body of {url}: {e}")))
}

/// Clones a git repository into a scratch directory and reads the recipe.
///
/// `spec` is `<url>` or `<url>:<subpath>`, where `<subpath>` names the
/// recipe file within the repository (defaults to `Dockerfile`).
async fn fetch_git(spec: &str) -> Result<String> {
    let scheme_end = spec.find("://").map_or(0, |i| i + 3);
    let (url, subpath) = match spec[scheme_end..].rfind(':') {
        Some(rel) => {
            let split_at = scheme_end + rel;
            (spec[..split_at].to_owned(), spec[split_at + 1..].to_owned())
        }
        None => (spec.to_owned(), "Dockerfile".to_owned()),
    };

    let dir = tempfile::tempdir().map_err(Error::Io)?;
    let status = tokio::process::Command::new("git")
        .arg("clone")
        .arg("--depth=1")
        .arg(&url)
        .arg(dir.path())
        .status()
        .await
        .map_err(|e| Error::InvalidSource(format!("spawning git clone of {url}: {e}")))?;
    if !status.success() {
        return Err(Error::InvalidSource(format!(
            "git clone of {url} exited with {status}"
        )));
    }

    let recipe_path = dir.path().join(&subpath);
    fetch_local(&recipe_path)
}

/// Parses recipe text into an ordered instruction list.
///
/// Tracks `USER`/`WORKDIR`/`SHELL` state as it walks the directive stream so
/// each `ADD`/`COPY`/`RUN`/`VOLUME` instruction carries the state in effect at
/// that point (spec.md §3's per-instruction `user`/`workdir` fields).
pub fn parse(text: &str) -> Result<Vec<Instruction>> {
    let mut user = DEFAULT_USER.to_owned();
    let mut workdir = DEFAULT_WORKDIR.to_owned();
    let mut shell: Vec<String> = vec!["/bin/sh".to_owned(), "-c".to_owned()];
    let mut out = Vec::new();

    for node in lex(text) {
        let Some(instruction) = Instruction::from_raw(&node, &user, &workdir, &shell)? else {
            continue;
        };

        match &instruction {
            Instruction::User { value, .. } => user = value.clone(),
            Instruction::Workdir { value, .. } => {
                workdir = join_workdir(&workdir, value);
            }
            Instruction::Shell { tokens, .. } => shell = tokens.clone(),
            Instruction::From { .. } => {
                // A new stage resets USER/WORKDIR/SHELL to their defaults;
                // stage.rs owns grouping, but the reset must happen here so
                // later instructions in the new stage see fresh defaults.
                user = DEFAULT_USER.to_owned();
                workdir = DEFAULT_WORKDIR.to_owned();
                shell = vec!["/bin/sh".to_owned(), "-c".to_owned()];
            }
            _ => {}
        }

        out.push(instruction);
    }

    Ok(out)
}

/// Joins a `WORKDIR` value onto the current workdir.
///
/// An absolute value replaces the current workdir; a relative value is
/// joined onto it. Mirrors the POSIX `cd` semantics recipes rely on.
fn join_workdir(current: &str, value: &str) -> String {
    if value.starts_with('/') {
        return value.to_owned();
    }
    let mut base = current.trim_end_matches('/').to_owned();
    base.push('/');
    base.push_str(value);
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_workdir_and_user_across_instructions() {
        let text = "FROM alpine\nWORKDIR /app\nUSER 1000:1000\nCOPY a b\nWORKDIR sub\nRUN echo hi\n";
        let instructions = parse(text).unwrap();
        let copy = instructions
            .iter()
            .find(|i| matches!(i, Instruction::Copy { .. }))
            .unwrap();
        match copy {
            Instruction::Copy { user, workdir, .. } => {
                assert_eq!(user, "1000:1000");
                assert_eq!(workdir, "/app");
            }
            _ => unreachable!(),
        }
        let run = instructions
            .iter()
            .find(|i| matches!(i, Instruction::Run { .. }))
            .unwrap();
        match run {
            Instruction::Run { workdir, .. } => assert_eq!(workdir, "/app/sub"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn resets_state_on_new_stage() {
        let text =
            "FROM alpine AS a\nUSER 1000:1000\nWORKDIR /x\nFROM alpine AS b\nRUN echo hi\n";
        let instructions = parse(text).unwrap();
        let run = instructions
            .iter()
            .find(|i| matches!(i, Instruction::Run { .. }))
            .unwrap();
        match run {
            Instruction::Run { user, workdir, .. } => {
                assert_eq!(user, DEFAULT_USER);
                assert_eq!(workdir, DEFAULT_WORKDIR);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn absolute_workdir_replaces() {
        assert_eq!(join_workdir("/app", "/other"), "/other");
        assert_eq!(join_workdir("/app", "sub"), "/app/sub");
    }
}
