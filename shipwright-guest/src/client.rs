//! Drives the bootstrap connection end to end: fetch boot parameters, dial
//! the host over mutual TLS, fetch the command plan, execute it, and report
//! the outcome.
//!
//! There is no retry of a failed `RUN` step — per spec §4.8, recovery from a
//! failed command is the recipe author's responsibility (a `RUN` that can
//! fail transiently should retry inside its own shell invocation). This
//! client's only job is to run the plan once and report what happened.

use std::sync::Arc;

use shipwright_proto::{Command, Request, Response};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;

use crate::{boot, run, transfer};

/// Errors driving the bootstrap connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Fetching or parsing boot parameters failed.
    #[error("boot parameters: {0}")]
    Boot(#[from] boot::Error),
    /// Establishing the TCP or TLS connection failed.
    #[error("connecting to bootstrap server: {0}")]
    Connect(#[source] std::io::Error),
    /// The server's PEM material failed to parse.
    #[error("invalid TLS material from bootstrap server: {0}")]
    InvalidTls(String),
    /// A protocol exchange with the server failed.
    #[error("bootstrap protocol: {0}")]
    Protocol(#[from] std::io::Error),
    /// The server answered with an unexpected response variant, or reported
    /// an application-level error.
    #[error("unexpected response from bootstrap server: {0}")]
    UnexpectedResponse(String),
}

/// Runs the whole bootstrap flow against the MMDS-published server, driving
/// every command in the plan to completion.
///
/// Returns `Ok(())` if the guest reported `Success`; any command failure is
/// reported to the server as `Abort` and surfaced here as `Ok(())` too,
/// since from the client's perspective the protocol exchange still
/// succeeded — the caller inspects the process exit code, set by `main`.
pub async fn run_once() -> Result<bool, Error> {
    let params = boot::fetch().await?;
    let mut conn = connect(&params).await?;

    let commands = fetch_commands(&mut conn).await?;
    let mut ok = true;
    for command in &commands {
        if !execute(&mut conn, command).await? {
            ok = false;
            break;
        }
    }

    let report = if ok {
        Request::Success
    } else {
        Request::Abort {
            error: "a build step failed; see streamed logs".to_owned(),
        }
    };
    shipwright_proto::send(&mut conn, &report).await?;
    expect_ack(&mut conn).await?;

    Ok(ok)
}

/// Opens the TCP connection and wraps it in mutual TLS per the published
/// credentials.
async fn connect(
    params: &boot::BootParams,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, Error> {
    let tcp = TcpStream::connect(&params.bootstrap_address)
        .await
        .map_err(Error::Connect)?;

    let ca_cert_der = pem_to_der(&params.ca_cert_pem)?;
    let cert_der = pem_to_der(&params.client_cert_pem)?;
    let key_der = pem_key_to_der(&params.client_key_pem)?;
    let credential = shipwright_proto::tls::Credential { cert_der, key_der };

    let client_config = shipwright_proto::tls::client_config(&ca_cert_der, &credential)
        .map_err(|e| Error::InvalidTls(e.to_string()))?;
    let connector = TlsConnector::from(Arc::new(client_config));

    let server_name = ServerName::try_from(params.server_name.clone())
        .map_err(|e| Error::InvalidTls(e.to_string()))?;
    connector
        .connect(server_name, tcp)
        .await
        .map_err(Error::Connect)
}

/// Requests the command plan.
async fn fetch_commands(
    conn: &mut (impl AsyncRead + AsyncWrite + Unpin),
) -> Result<Vec<Command>, Error> {
    shipwright_proto::send(conn, &Request::Commands).await?;
    match shipwright_proto::recv::<Response>(conn).await? {
        Response::Commands { commands } => Ok(commands),
        Response::Error(e) => Err(Error::UnexpectedResponse(e.to_string())),
        _ => Err(Error::UnexpectedResponse(
            "expected Response::Commands".to_owned(),
        )),
    }
}

/// Executes one plan step, streaming its logs and returning whether it
/// succeeded.
async fn execute(
    conn: &mut (impl AsyncRead + AsyncWrite + Unpin),
    command: &Command,
) -> Result<bool, Error> {
    match command {
        Command::Run { .. } => {
            let mut stdout_lines = Vec::new();
            let mut stderr_lines = Vec::new();
            let outcome = run::exec(
                command,
                |line| stdout_lines.push(line),
                |line| stderr_lines.push(line),
            )
            .await;

            if !stdout_lines.is_empty() {
                shipwright_proto::send(
                    conn,
                    &Request::Stdout {
                        lines: std::mem::take(&mut stdout_lines),
                    },
                )
                .await?;
                expect_ack(conn).await?;
            }
            if !stderr_lines.is_empty() {
                shipwright_proto::send(
                    conn,
                    &Request::Stderr {
                        lines: std::mem::take(&mut stderr_lines),
                    },
                )
                .await?;
                expect_ack(conn).await?;
            }

            match outcome {
                run::Outcome::Success => Ok(true),
                run::Outcome::Failed(message) => {
                    shipwright_proto::send(
                        conn,
                        &Request::Stderr {
                            lines: vec![message],
                        },
                    )
                    .await?;
                    expect_ack(conn).await?;
                    Ok(false)
                }
            }
        }
        Command::Transfer {
            resource_id,
            target,
            workdir,
            chown,
            ..
        } => {
            match transfer::materialize(conn, resource_id, target, workdir, chown.as_deref()).await
            {
                Ok(()) => Ok(true),
                Err(e) => {
                    shipwright_proto::send(
                        conn,
                        &Request::Stderr {
                            lines: vec![format!("transfer {resource_id} to {target}: {e}")],
                        },
                    )
                    .await?;
                    expect_ack(conn).await?;
                    Ok(false)
                }
            }
        }
    }
}

/// Awaits a plain `Response::Ack`, surfacing a server error otherwise.
async fn expect_ack(conn: &mut (impl AsyncRead + AsyncWrite + Unpin)) -> Result<(), Error> {
    match shipwright_proto::recv::<Response>(conn).await? {
        Response::Ack => Ok(()),
        Response::Error(e) => Err(Error::UnexpectedResponse(e.to_string())),
        _ => Err(Error::UnexpectedResponse(
            "expected Response::Ack".to_owned(),
        )),
    }
}

/// Decodes a single PEM certificate block to DER.
fn pem_to_der(pem: &str) -> Result<Vec<u8>, Error> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .next()
        .transpose()
        .map_err(|e| Error::InvalidTls(e.to_string()))?
        .map(|c| c.to_vec())
        .ok_or_else(|| Error::InvalidTls("no certificate found in PEM".to_owned()))
}

/// Decodes a single PEM private key block to DER (PKCS#8).
fn pem_key_to_der(pem: &str) -> Result<Vec<u8>, Error> {
    rustls_pemfile::pkcs8_private_keys(&mut pem.as_bytes())
        .next()
        .transpose()
        .map_err(|e| Error::InvalidTls(e.to_string()))?
        .map(|k| k.secret_pkcs8_der().to_vec())
        .ok_or_else(|| Error::InvalidTls("no PKCS#8 key found in PEM".to_owned()))
}
