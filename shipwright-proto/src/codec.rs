//! Async length-prefixed frame codec over any [`AsyncRead`]/[`AsyncWrite`] stream.
//!
//! Each frame is: `[u32 big-endian length][postcard payload]`.

use std::io;

use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed frame payload (16 MiB).
const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Sends a postcard-serialized message with a 4-byte BE length prefix.
pub async fn send(w: &mut (impl AsyncWrite + Unpin), msg: &impl Serialize) -> io::Result<()> {
    let payload =
        postcard::to_allocvec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame exceeds u32::MAX"))?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    w.write_all(&frame).await?;
    w.flush().await
}

/// Receives and deserializes a length-prefixed postcard message.
pub async fn recv<T: for<'de> Deserialize<'de>>(r: &mut (impl AsyncRead + Unpin)) -> io::Result<T> {
    let mut hdr = [0u8; 4];
    r.read_exact(&mut hdr).await?;
    let len = u32::from_be_bytes(hdr);
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 16 MiB limit",
        ));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    postcard::from_bytes(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Streams one entry's bytes as a [`crate::ResourceFrame::Header`], the
/// chunks read from `src`, then [`crate::ResourceFrame::Eof`], each wrapped
/// in [`crate::Response::Resource`].
///
/// Used by the bootstrap server to answer `resource` requests; a directory
/// source calls this once per child file, setting `more` on every call but
/// the last.
pub async fn send_resource_from_reader(
    w: &mut (impl AsyncWrite + Unpin),
    src: &mut (impl AsyncRead + Unpin),
    id: &str,
    header: crate::ResourceFrame,
    chunk_size: usize,
    more: bool,
) -> io::Result<u64> {
    use crate::{Response, ResourceFrame};

    debug_assert!(matches!(header, ResourceFrame::Header { .. }));
    send(w, &Response::Resource(header)).await?;

    let mut buf = vec![0u8; chunk_size];
    let mut total: u64 = 0;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        total += n as u64;
        let sha256 = sha2::Sha256::digest(&buf[..n]).into();
        send(
            w,
            &Response::Resource(ResourceFrame::Chunk {
                id: id.to_owned(),
                bytes: buf[..n].to_vec(),
                sha256,
            }),
        )
        .await?;
    }
    send(
        w,
        &Response::Resource(ResourceFrame::Eof {
            id: id.to_owned(),
            more,
        }),
    )
    .await?;
    Ok(total)
}

/// Receives one resource entry (header, chunks, eof) and writes its bytes
/// to `dst`, verifying each chunk's SHA-256 as it arrives.
///
/// Returns the header that opened the entry, the byte count written, and
/// whether the response has further entries still to come (`Eof.more`).
/// Used by the bootstrap client to materialize a requested resource.
pub async fn recv_resource_to_writer(
    r: &mut (impl AsyncRead + Unpin),
    dst: &mut (impl AsyncWrite + Unpin),
) -> io::Result<(crate::ResourceFrame, u64, bool)> {
    use crate::ResourceFrame;

    let header = expect_resource_frame(r).await?;
    let ResourceFrame::Header { ref id, .. } = header else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "expected ResourceFrame::Header",
        ));
    };
    let header_id = id.clone();

    let mut total: u64 = 0;
    loop {
        match expect_resource_frame(r).await? {
            ResourceFrame::Chunk { id, bytes, sha256 } => {
                if id != header_id {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "resource chunk id mismatch",
                    ));
                }
                let actual: [u8; 32] = sha2::Sha256::digest(&bytes).into();
                if actual != sha256 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "resource chunk failed sha256 verification",
                    ));
                }
                total += bytes.len() as u64;
                dst.write_all(&bytes).await?;
            }
            ResourceFrame::Eof { id, more } if id == header_id => {
                dst.flush().await?;
                return Ok((header, total, more));
            }
            ResourceFrame::Eof { .. } => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "resource eof id mismatch",
                ));
            }
            ResourceFrame::Header { .. } => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unexpected ResourceFrame::Header mid-stream",
                ));
            }
        }
    }
}

/// Receives one `Response`, unwrapping the `Resource` variant or surfacing
/// a server-reported [`crate::ErrorInfo`] as an I/O error.
async fn expect_resource_frame(r: &mut (impl AsyncRead + Unpin)) -> io::Result<crate::ResourceFrame> {
    match recv::<crate::Response>(r).await? {
        crate::Response::Resource(frame) => Ok(frame),
        crate::Response::Error(e) => Err(io::Error::other(e.to_string())),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "expected Response::Resource",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Command, ErrorCode, ErrorInfo, Request, Response, ResourceFrame};

    #[tokio::test]
    async fn roundtrip_commands_request() {
        let (mut c, mut s) = tokio::io::duplex(1024);
        send(&mut c, &Request::Commands).await.unwrap();
        let msg: Request = recv(&mut s).await.unwrap();
        assert!(matches!(msg, Request::Commands));
    }

    #[tokio::test]
    async fn roundtrip_commands_response() {
        let commands = vec![
            Command::Run {
                command: "echo hi".into(),
                env: vec!["FOO=bar".into()],
                shell: vec!["/bin/sh".into(), "-c".into()],
                user: "0:0".into(),
                workdir: "/".into(),
            },
            Command::Transfer {
                resource_id: "res-1".into(),
                target: "/app/bin".into(),
                user: "0:0".into(),
                workdir: "/app".into(),
                chown: Some("1000:1000".into()),
                is_add: false,
            },
        ];
        let (mut c, mut s) = tokio::io::duplex(4096);
        send(
            &mut c,
            &Response::Commands {
                commands: commands.clone(),
            },
        )
        .await
        .unwrap();
        let msg: Response = recv(&mut s).await.unwrap();
        match msg {
            Response::Commands { commands: got } => assert_eq!(got.len(), commands.len()),
            _ => panic!("expected Response::Commands"),
        }
    }

    #[tokio::test]
    async fn roundtrip_error_response() {
        let (mut c, mut s) = tokio::io::duplex(1024);
        send(
            &mut c,
            &Response::Error(ErrorInfo::new(ErrorCode::NotFound, "no such id")),
        )
        .await
        .unwrap();
        let msg: Response = recv(&mut s).await.unwrap();
        assert!(matches!(msg, Response::Error(e) if e.code == ErrorCode::NotFound));
    }

    #[tokio::test]
    async fn send_and_recv_resource_file_roundtrip() {
        let (mut c, mut s) = tokio::io::duplex(8192);
        let data = vec![9u8; 2500];
        let mut src = io::Cursor::new(data.clone());

        let header = ResourceFrame::Header {
            id: "res-1".into(),
            source: "./app/bin".into(),
            target: "bin".into(),
            mode: Some(0o755),
            is_dir: false,
            user: "0:0".into(),
            workdir: "/app".into(),
        };

        let sent = send_resource_from_reader(&mut c, &mut src, "res-1", header, 256, false)
            .await
            .unwrap();
        assert_eq!(sent, 2500);

        let mut dst = Vec::new();
        let (got_header, received, more) = recv_resource_to_writer(&mut s, &mut dst).await.unwrap();
        assert_eq!(received, 2500);
        assert_eq!(dst, data);
        assert!(!more);
        assert!(matches!(got_header, ResourceFrame::Header { mode: Some(0o755), .. }));
    }

    #[tokio::test]
    async fn recv_resource_rejects_corrupted_chunk() {
        let (mut c, mut s) = tokio::io::duplex(4096);
        send(
            &mut c,
            &Response::Resource(ResourceFrame::Header {
                id: "res-1".into(),
                source: "f".into(),
                target: "f".into(),
                mode: None,
                is_dir: false,
                user: "0:0".into(),
                workdir: "/".into(),
            }),
        )
        .await
        .unwrap();
        send(
            &mut c,
            &Response::Resource(ResourceFrame::Chunk {
                id: "res-1".into(),
                bytes: b"hello".to_vec(),
                sha256: [0u8; 32],
            }),
        )
        .await
        .unwrap();

        let mut dst = Vec::new();
        let result = recv_resource_to_writer(&mut s, &mut dst).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(32u32 * 1024 * 1024).to_be_bytes());
        buf.extend_from_slice(&[0u8; 16]);
        let mut cursor = io::Cursor::new(buf);
        let result: io::Result<Request> = recv(&mut cursor).await;
        assert!(result.is_err());
    }
}
