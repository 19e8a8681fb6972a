//! Bootstrap Server (C7): the host side of the mutually-authenticated RPC
//! that streams a [`shipwright_recipe::Plan`] and its resources into the
//! builder guest and collects its stdout/stderr/outcome.
//!
//! One TLS connection drives the whole build: the guest asks for commands
//! once, requests resources on demand, streams log lines, then reports
//! `success` or `abort`. There is no host-initiated message, so the server
//! is a single read-dispatch-respond loop per connection.

use std::collections::HashMap;
use std::io::Read as _;
use std::net::SocketAddr;
use std::sync::Arc;

use sha2::Digest as _;
use shipwright_recipe::{Plan, PlanStep, Resource};
use shipwright_proto::{Command, ErrorInfo, Request, Response, ResourceFrame};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{server::TlsStream, TlsAcceptor};

use crate::{Error, Result};

/// Where a resolved resource's bytes ultimately land, carried alongside the
/// `Command::Transfer` that referenced it (the wire `Request::Resource` only
/// carries the id, so this context has to be looked up server-side).
#[derive(Debug, Clone)]
pub struct TransferContext {
    user: String,
    workdir: String,
    target: String,
}

/// Converts a [`Plan`] into the wire command list plus the transfer-context
/// table needed to answer resource requests.
pub fn prepare(plan: &Plan) -> (Vec<Command>, HashMap<String, Vec<Resource>>, HashMap<String, TransferContext>) {
    let mut commands = Vec::with_capacity(plan.steps.len());
    let mut contexts = HashMap::new();

    for step in &plan.steps {
        match step {
            PlanStep::Run {
                command,
                env,
                shell,
                user,
                workdir,
            } => commands.push(Command::Run {
                command: command.clone(),
                env: env.clone(),
                shell: shell.clone(),
                user: user.clone(),
                workdir: workdir.clone(),
            }),
            PlanStep::Transfer {
                source_id,
                target,
                user,
                workdir,
                chown,
                is_add,
            } => {
                contexts.insert(
                    source_id.clone(),
                    TransferContext {
                        user: user.clone(),
                        workdir: workdir.clone(),
                        target: target.clone(),
                    },
                );
                commands.push(Command::Transfer {
                    resource_id: source_id.clone(),
                    target: target.clone(),
                    user: user.clone(),
                    workdir: workdir.clone(),
                    chown: chown.clone(),
                    is_add: *is_add,
                });
            }
        }
    }

    let resources = plan.resources.clone().into_iter().collect();
    (commands, resources, contexts)
}

/// Serves one build over an already-established TLS connection, dispatching
/// requests until `success` or `abort` arrives.
///
/// Returns `Ok(())` on `success`; an `abort` is surfaced as
/// [`Error::Aborted`], matching spec §7's "treated identically to a Process
/// failure" policy.
pub async fn handle_connection(
    mut stream: TlsStream<TcpStream>,
    commands: &[Command],
    resources: &HashMap<String, Vec<Resource>>,
    contexts: &HashMap<String, TransferContext>,
) -> Result<()> {
    loop {
        let request: Request = shipwright_proto::recv(&mut stream)
            .await
            .map_err(|e| Error::Rpc(e.to_string()))?;

        match request {
            Request::Commands => {
                let response = Response::Commands {
                    commands: commands.to_vec(),
                };
                shipwright_proto::send(&mut stream, &response)
                    .await
                    .map_err(|e| Error::Rpc(e.to_string()))?;
            }
            Request::Resource { id } => {
                stream_resource(&mut stream, &id, resources, contexts).await?;
            }
            Request::Stdout { lines } => {
                for line in &lines {
                    tracing::info!(target: "shipwright::guest::stdout", "{line}");
                }
                ack(&mut stream).await?;
            }
            Request::Stderr { lines } => {
                for line in &lines {
                    tracing::warn!(target: "shipwright::guest::stderr", "{line}");
                }
                ack(&mut stream).await?;
            }
            Request::Success => {
                ack(&mut stream).await?;
                return Ok(());
            }
            Request::Abort { error } => {
                ack(&mut stream).await?;
                return Err(Error::Aborted(error));
            }
        }
    }
}

async fn ack(stream: &mut TlsStream<TcpStream>) -> Result<()> {
    shipwright_proto::send(stream, &Response::Ack)
        .await
        .map_err(|e| Error::Rpc(e.to_string()))
}

async fn stream_resource(
    stream: &mut TlsStream<TcpStream>,
    id: &str,
    resources: &HashMap<String, Vec<Resource>>,
    contexts: &HashMap<String, TransferContext>,
) -> Result<()> {
    let Some(entries) = resources.get(id) else {
        shipwright_proto::send(
            stream,
            &Response::Error(ErrorInfo::not_found(format!("unknown resource id {id:?}"))),
        )
        .await
        .map_err(|e| Error::Rpc(e.to_string()))?;
        return Ok(());
    };
    let context = contexts
        .get(id)
        .cloned()
        .unwrap_or_else(|| TransferContext {
            user: "0:0".to_owned(),
            workdir: "/".to_owned(),
            target: id.to_owned(),
        });

    let last = entries.len().saturating_sub(1);
    for (index, resource) in entries.iter().enumerate() {
        let target = if resource.relative_target.as_os_str().is_empty() {
            context.target.clone()
        } else {
            format!(
                "{}/{}",
                context.target.trim_end_matches('/'),
                resource.relative_target.display()
            )
        };

        let header = ResourceFrame::Header {
            id: id.to_owned(),
            source: id.to_owned(),
            target,
            mode: resource.mode,
            is_dir: false,
            user: context.user.clone(),
            workdir: context.workdir.clone(),
        };
        shipwright_proto::send(stream, &Response::Resource(header))
            .await
            .map_err(|e| Error::Rpc(e.to_string()))?;

        stream_entry_chunks(stream, id, resource).await?;

        shipwright_proto::send(
            stream,
            &Response::Resource(ResourceFrame::Eof {
                id: id.to_owned(),
                more: index != last,
            }),
        )
        .await
        .map_err(|e| Error::Rpc(e.to_string()))?;
    }
    Ok(())
}

/// Reads `resource`'s bytes on a blocking task (its `open()` is a plain
/// `std::io::Read`) and forwards them as chunks, sha-256'd one at a time.
async fn stream_entry_chunks(
    stream: &mut TlsStream<TcpStream>,
    id: &str,
    resource: &Resource,
) -> Result<()> {
    let resource = resource.clone();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<std::io::Result<Vec<u8>>>(4);

    tokio::task::spawn_blocking(move || {
        let mut reader = match resource.open() {
            Ok(r) => r,
            Err(e) => {
                let _ = tx.blocking_send(Err(std::io::Error::other(e.to_string())));
                return;
            }
        };
        let mut buf = vec![0u8; shipwright_proto::RESOURCE_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    break;
                }
            }
        }
    });

    while let Some(chunk) = rx.recv().await {
        let bytes = chunk.map_err(|e| Error::Rpc(e.to_string()))?;
        let sha256 = sha2::Sha256::digest(&bytes).into();
        shipwright_proto::send(
            stream,
            &Response::Resource(ResourceFrame::Chunk {
                id: id.to_owned(),
                bytes,
                sha256,
            }),
        )
        .await
        .map_err(|e| Error::Rpc(e.to_string()))?;
    }
    Ok(())
}

/// Accepts one TCP connection and upgrades it to TLS, ready for
/// [`handle_connection`].
pub async fn accept_one(
    listener: &TcpListener,
    acceptor: &TlsAcceptor,
) -> Result<(TlsStream<TcpStream>, SocketAddr)> {
    let (tcp, peer) = listener.accept().await.map_err(Error::Io)?;
    let tls = acceptor.accept(tcp).await.map_err(Error::Io)?;
    Ok((tls, peer))
}

/// Builds a [`TlsAcceptor`] from ephemeral PKI generated for `server_name`
/// and `client_name`, returning it alongside the material to publish to the
/// guest via MMDS.
pub fn build_acceptor(
    server_name: &str,
    client_name: &str,
) -> Result<(TlsAcceptor, shipwright_proto::tls::EphemeralPki)> {
    let pki = shipwright_proto::tls::generate(server_name, client_name)
        .map_err(|e| Error::Rpc(e.to_string()))?;
    let config = shipwright_proto::tls::server_config(&pki.ca_cert_der, &pki.server)?;
    Ok((TlsAcceptor::from(Arc::new(config)), pki))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn sample_plan() -> Plan {
        Plan {
            steps: vec![
                PlanStep::Run {
                    command: "echo hi".to_owned(),
                    env: vec![],
                    shell: vec!["/bin/sh".into(), "-c".into()],
                    user: "0:0".into(),
                    workdir: "/".into(),
                },
                PlanStep::Transfer {
                    source_id: "app.bin".into(),
                    target: "/usr/bin/app".into(),
                    user: "0:0".into(),
                    workdir: "/".into(),
                    chown: None,
                    is_add: false,
                },
            ],
            resources: BTreeMap::from([(
                "app.bin".to_owned(),
                vec![Resource {
                    origin: shipwright_recipe::Origin::LocalFile(PathBuf::from("/tmp/app.bin")),
                    relative_target: PathBuf::new(),
                    mode: Some(0o755),
                }],
            )]),
            metadata: Default::default(),
        }
    }

    #[test]
    fn prepare_converts_steps_to_wire_commands() {
        let plan = sample_plan();
        let (commands, resources, contexts) = prepare(&plan);
        assert_eq!(commands.len(), 2);
        assert!(matches!(commands[0], Command::Run { .. }));
        assert!(matches!(commands[1], Command::Transfer { .. }));
        assert!(resources.contains_key("app.bin"));
        assert_eq!(contexts["app.bin"].target, "/usr/bin/app");
    }
}
