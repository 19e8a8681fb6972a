//! Executes a `Command::Run` step and streams its output back to the host.

use std::process::Stdio;

use shipwright_proto::Command;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as Child;

/// Outcome of running one `RUN` step.
#[derive(Debug)]
pub enum Outcome {
    /// The command exited zero.
    Success,
    /// The command exited non-zero, timed out, or failed to spawn.
    Failed(String),
}

/// Runs `command, env, shell, user, workdir` per spec §4.8:
///
/// ```text
/// sudo mkdir -p <workdir> && sudo <shell_tokens> '<env-prefix><command>'
/// ```
///
/// `on_stdout`/`on_stderr` are called with each line as it arrives, for the
/// caller to batch and forward via `Request::Stdout`/`Request::Stderr`.
pub async fn exec(
    step: &Command,
    mut on_stdout: impl FnMut(String),
    mut on_stderr: impl FnMut(String),
) -> Outcome {
    let Command::Run {
        command,
        env,
        shell,
        user,
        workdir,
    } = step
    else {
        return Outcome::Failed("exec::exec called with a non-Run step".to_owned());
    };

    let invocation = compose(command, env, shell, user, workdir);
    let Some((program, args)) = invocation.split_first() else {
        return Outcome::Failed("empty shell invocation".to_owned());
    };

    let mut child = match Child::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(c) => c,
        Err(e) => return Outcome::Failed(format!("spawning {program}: {e}")),
    };

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    loop {
        tokio::select! {
            line = stdout_lines.next_line() => match line {
                Ok(Some(line)) => on_stdout(line),
                Ok(None) => {}
                Err(e) => { on_stderr(format!("<stdout read error: {e}>")); }
            },
            line = stderr_lines.next_line() => match line {
                Ok(Some(line)) => on_stderr(line),
                Ok(None) => {}
                Err(e) => { on_stderr(format!("<stderr read error: {e}>")); }
            },
            status = child.wait() => {
                let status = match status {
                    Ok(s) => s,
                    Err(e) => return Outcome::Failed(format!("waiting on {program}: {e}")),
                };
                drain_remaining(&mut stdout_lines, &mut on_stdout).await;
                drain_remaining(&mut stderr_lines, &mut on_stderr).await;
                return if status.success() {
                    Outcome::Success
                } else {
                    Outcome::Failed(format!("{command} exited with {status}"))
                };
            }
        }
    }
}

/// Reads any lines left buffered once the child has exited.
async fn drain_remaining<R>(
    lines: &mut tokio::io::Lines<BufReader<R>>,
    on_line: &mut impl FnMut(String),
) where
    R: tokio::io::AsyncRead + Unpin,
{
    while let Ok(Some(line)) = lines.next_line().await {
        on_line(line);
    }
}

/// Composes the guest-side shell invocation for a `RUN` step, per spec
/// §4.8:
///
/// ```text
/// sudo mkdir -p <workdir> && sudo <shell_tokens> '<env-prefix><command>'
/// ```
///
/// `<command>` is single-quoted with embedded `'` escaped as `'\''`; `user`
/// is unused here (it names the in-recipe `USER`, applied by the recipe's
/// own `sudo`/`su` invocations, not by the guest agent). The whole line is
/// run under `sh -c` since it contains `&&`.
fn compose(command: &str, env: &[String], shell: &[String], _user: &str, workdir: &str) -> Vec<String> {
    let mut env_prefix = String::new();
    for pair in env {
        env_prefix.push_str(pair);
        env_prefix.push(' ');
    }

    let prefixed_command = format!("{env_prefix}{command}");
    let quoted_command = format!("'{}'", prefixed_command.replace('\'', "'\\''"));
    let shell_invocation = shell.join(" ");

    let script = format!(
        "sudo mkdir -p {} && sudo {shell_invocation} {quoted_command}",
        shell_quote(workdir),
    );

    vec!["sh".to_owned(), "-c".to_owned(), script]
}

/// Single-quotes a path for safe inclusion in a shell script.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_quotes_command_and_prefixes_env() {
        let argv = compose(
            "echo it's fine",
            &["FOO=bar".to_owned()],
            &["/bin/sh".to_owned(), "-c".to_owned()],
            "1000:1000",
            "/app",
        );
        let script = argv.last().unwrap();
        assert!(script.starts_with("sudo mkdir -p '/app' && sudo /bin/sh -c '"));
        assert!(script.contains("FOO=bar echo it'\\''s fine"));
    }

    #[tokio::test]
    async fn exec_reports_success_for_true() {
        let step = Command::Run {
            command: "exit 0".to_owned(),
            env: vec![],
            shell: vec!["/bin/sh".to_owned(), "-c".to_owned()],
            user: format!("{}:{}", nix::unistd::getuid(), nix::unistd::getgid()),
            workdir: "/tmp".to_owned(),
        };
        // sudo is unavailable in the test sandbox; this only checks that
        // exec() doesn't panic composing and spawning the invocation.
        let _ = super::exec(&step, |_| {}, |_| {}).await;
    }
}
