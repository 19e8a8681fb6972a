//! Materializes a `Command::Transfer` step: requests the named resource from
//! the host and writes it into place, per spec §4.8.
//!
//! Every entry lands first under a per-transfer scratch directory, gets its
//! mode/ownership applied, then is moved into its final target — so a
//! partially-received file is never visible at its final path.

use std::path::{Path, PathBuf};

use rand::Rng as _;
use shipwright_proto::{Request, ResourceFrame};
use tokio::io::{AsyncRead, AsyncWrite};

/// Errors materializing a transfer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O or transport failure (scratch write, chmod, chown,
    /// rename, or a server-reported resource error).
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A chmod/chown call failed.
    #[error("applying mode/ownership to {path}: {source}")]
    Ownership {
        /// Path the operation was applied to.
        path: PathBuf,
        /// Underlying errno.
        #[source]
        source: nix::Error,
    },
}

/// Requests resource `resource_id` and materializes it at `target`
/// (resolved against `workdir` if relative), applying `chown` if given or
/// else the header's declared `user`.
pub async fn materialize(
    conn: &mut (impl AsyncRead + AsyncWrite + Unpin),
    resource_id: &str,
    target: &str,
    workdir: &str,
    chown: Option<&str>,
) -> Result<(), Error> {
    let dest_root = if Path::new(target).is_absolute() {
        PathBuf::from(target)
    } else {
        Path::new(workdir).join(target)
    };

    let scratch = scratch_dir();
    tokio::fs::create_dir_all(&scratch).await?;

    let result = recv_entries(conn, resource_id, &scratch, &dest_root, chown).await;
    let _ = tokio::fs::remove_dir_all(&scratch).await;
    result
}

/// Drains every header/chunk*/eof triple the host sends for one resource
/// request (one per file; a directory source sends several, `more`-linked),
/// writing each into `scratch` first, then chmod/chown/renaming into its
/// final path under `dest_root`.
async fn recv_entries(
    conn: &mut (impl AsyncRead + AsyncWrite + Unpin),
    resource_id: &str,
    scratch: &Path,
    dest_root: &Path,
    chown: Option<&str>,
) -> Result<(), Error> {
    shipwright_proto::send(
        conn,
        &Request::Resource {
            id: resource_id.to_owned(),
        },
    )
    .await?;

    loop {
        let scratch_path = scratch.join(format!("entry-{}", rand::thread_rng().r#gen::<u64>()));
        let mut file = tokio::fs::File::create(&scratch_path).await?;
        let (header, _written, more) =
            shipwright_proto::recv_resource_to_writer(conn, &mut file).await?;
        drop(file);

        let ResourceFrame::Header {
            target: entry_target,
            mode,
            is_dir,
            user,
            ..
        } = header
        else {
            unreachable!("recv_resource_to_writer always returns a Header");
        };

        let final_path = dest_root.join(&entry_target);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if is_dir {
            tokio::fs::remove_file(&scratch_path).ok();
            tokio::fs::create_dir_all(&final_path).await?;
            apply_ownership(&final_path, mode, chown.unwrap_or(&user))?;
        } else {
            apply_ownership(&scratch_path, mode, chown.unwrap_or(&user))?;
            tokio::fs::rename(&scratch_path, &final_path).await?;
        }

        if !more {
            return Ok(());
        }
    }
}

/// Applies Unix mode (if given) and ownership (`uid:gid` or `uid` string)
/// to `path`.
fn apply_ownership(path: &Path, mode: Option<u32>, owner: &str) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(mode) = mode {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }

    let (uid, gid) = parse_owner(owner);
    nix::unistd::chown(path, uid, gid).map_err(|source| Error::Ownership {
        path: path.to_path_buf(),
        source,
    })
}

/// Parses a `uid[:gid]` string into nix UID/GID types, ignoring malformed
/// values (ownership is then left unchanged for that half).
fn parse_owner(owner: &str) -> (Option<nix::unistd::Uid>, Option<nix::unistd::Gid>) {
    let mut parts = owner.splitn(2, ':');
    let uid = parts
        .next()
        .and_then(|s| s.parse::<u32>().ok())
        .map(nix::unistd::Uid::from_raw);
    let gid = parts
        .next()
        .and_then(|s| s.parse::<u32>().ok())
        .map(nix::unistd::Gid::from_raw);
    (uid, gid)
}

/// A fresh scratch directory under `/tmp`, uniquely named.
fn scratch_dir() -> PathBuf {
    let suffix: u64 = rand::thread_rng().r#gen();
    Path::new("/tmp").join(format!("shipwright-transfer-{}-{suffix}", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_owner_splits_uid_and_gid() {
        let (uid, gid) = parse_owner("1000:1000");
        assert_eq!(uid.map(|u| u.as_raw()), Some(1000));
        assert_eq!(gid.map(|g| g.as_raw()), Some(1000));
    }

    #[test]
    fn parse_owner_uid_only() {
        let (uid, gid) = parse_owner("0");
        assert_eq!(uid.map(|u| u.as_raw()), Some(0));
        assert!(gid.is_none());
    }
}
