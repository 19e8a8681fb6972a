//! VMM Lifecycle Manager (C11): drives a single VM through
//! `Uninitialized -> Provisioning -> Booting -> Running -> Stopping -> Stopped`,
//! unwinding to `Cleaned` on any failure before `Running`.
//!
//! Generalizes the graceful-IPC/bounded-wait/SIGKILL-fallback shutdown
//! sequence and a PID liveness probe to the jailer+CNI architecture: rather
//! than forking directly into a VM entry point, `start` composes C9 (jail)
//! and C10 (CNI) and waits for the hypervisor's own readiness socket to
//! appear.

use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Child;
use tokio::time::{interval, timeout};

use crate::registry::{CniConfig, CommandConfig, JailerConfig, MachineConfig, NetworkConfig};
use crate::{cni, jail, Error, Result};

/// Where VM lifecycle state currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Provisioning,
    Booting,
    Running,
    Stopping,
    Stopped,
    /// Reached only via a failed unwind: CNI and jail have both been torn
    /// down, but the VM never reached `Running`.
    Cleaned,
}

/// Inputs to [`start`].
#[derive(Debug, Clone)]
pub struct StartConfig {
    pub vm_id: String,
    pub jailer: JailerConfig,
    pub machine: MachineConfig,
    pub cni: CniConfig,
    pub command: CommandConfig,
    pub netns_path: PathBuf,
    pub readiness_timeout: Duration,
}

/// A running (or mid-lifecycle) VM.
pub struct Handle {
    pub vm_id: String,
    pub pid: u32,
    pub chroot_path: PathBuf,
    pub network: NetworkConfig,
    jail: jail::Jail,
    cni: CniConfig,
    netns_path: PathBuf,
    child: Child,
    state: State,
}

impl Handle {
    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Fills in PID/IP/chroot fields on a caller-owned metadata builder.
    pub fn decorate_metadata(&self, md: &mut crate::registry::RunMetadata) {
        md.pid = self.pid;
        md.network = self.network.clone();
        md.command.kernel_path = self.jail.kernel_in_jail.clone();
        md.command.rootfs_path = self.jail.rootfs_in_jail.clone();
    }

    /// Blocks until the hypervisor process exits.
    pub async fn wait(&mut self) -> Result<()> {
        self.child
            .wait()
            .await
            .map_err(Error::Io)?;
        Ok(())
    }

    /// Issues the hypervisor's graceful-shutdown IPC, waits up to
    /// `graceful_timeout`, force-stops on expiry, then always runs CNI
    /// delete and jail teardown.
    pub async fn stop(mut self, graceful_timeout: Duration) -> Result<()> {
        self.state = State::Stopping;
        let _ = self.request_graceful_shutdown();

        let exited = timeout(graceful_timeout, self.child.wait()).await;
        match exited {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(vm_id = %self.vm_id, %e, "error waiting on hypervisor exit"),
            Err(_timed_out) => {
                tracing::warn!(vm_id = %self.vm_id, "graceful shutdown timed out, force-stopping");
                force_kill(self.pid);
                let _ = timeout(Duration::from_secs(5), self.child.wait()).await;
            }
        }

        cni::delete(&self.cni, &self.vm_id, &self.netns_path, &self.network.ifname).await?;
        if let Err(e) = jail::teardown(&self.jail) {
            tracing::warn!(vm_id = %self.vm_id, %e, "jail teardown failed");
        }
        self.state = State::Stopped;
        Ok(())
    }

    /// Writes a minimal HTTP PUT to the hypervisor's API socket requesting a
    /// graceful shutdown. Best-effort: a failure here just means `stop` falls
    /// through to the timeout-then-SIGKILL path.
    fn request_graceful_shutdown(&self) -> std::io::Result<()> {
        use std::os::unix::net::UnixStream;

        let socket_path = self.jail.chroot_path.join("api.sock");
        let mut stream = UnixStream::connect(&socket_path)?;
        let body = br#"{"action_type":"SendCtrlAltDel"}"#;
        let request = format!(
            "PUT /actions HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        stream.write_all(request.as_bytes())?;
        stream.write_all(body)?;
        Ok(())
    }
}

#[cfg(unix)]
fn force_kill(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

/// Provisions the jail, brings up the network, spawns the jailer, and waits
/// for the hypervisor's readiness socket. On any failure the partially
/// constructed state is unwound (CNI delete, jail teardown) before returning
/// the error.
pub async fn start(config: StartConfig) -> Result<Handle> {
    let jail = jail::provision(
        &config.jailer,
        &config.machine,
        &config.vm_id,
        &config.command.kernel_path,
        &config.command.rootfs_path,
        "eth0",
    )?;

    let network = match cni::add(&config.cni, &config.vm_id, &config.netns_path, "eth0").await {
        Ok(network) => network,
        Err(e) => {
            if let Err(teardown_err) = jail::teardown(&jail) {
                tracing::warn!(%teardown_err, "jail teardown after failed cni add");
            }
            return Err(e);
        }
    };

    let netns_str = config
        .netns_path
        .to_str()
        .ok_or_else(|| Error::Config("netns path is not valid UTF-8".to_owned()))?;

    let child = match jail::spawn(&config.jailer, &jail, &config.vm_id, netns_str) {
        Ok(child) => child,
        Err(e) => {
            unwind(&config, &jail, &network.ifname).await;
            return Err(Error::Vmm(format!("spawning jailer: {e}")));
        }
    };
    let pid = child.id().unwrap_or_default();

    if let Err(e) = wait_for_readiness(&jail.chroot_path, config.readiness_timeout).await {
        unwind(&config, &jail, &network.ifname).await;
        return Err(e);
    }

    Ok(Handle {
        vm_id: config.vm_id,
        pid,
        chroot_path: jail.chroot_path.clone(),
        network,
        jail,
        cni: config.cni,
        netns_path: config.netns_path,
        child,
        state: State::Running,
    })
}

async fn unwind(config: &StartConfig, jail: &jail::Jail, ifname: &str) {
    if let Err(e) = cni::delete(&config.cni, &config.vm_id, &config.netns_path, ifname).await {
        tracing::warn!(%e, "cni delete during unwind");
    }
    if let Err(e) = jail::teardown(jail) {
        tracing::warn!(%e, "jail teardown during unwind");
    }
}

/// Publishes the guest boot-parameter blob (spec §6 MMDS) to the
/// hypervisor's API socket once it is up, as flat `KEY=VALUE` text — the
/// same dotenv-shaped wire format the guest parses with `dotenvy` on its
/// side (see `shipwright-guest::boot`). Uses the same hand-framed HTTP
/// convention as [`Handle::request_graceful_shutdown`], on the async side
/// since this runs from the orchestrator before a [`Handle`] exists.
pub async fn publish_mmds(chroot_path: &std::path::Path, data: &[(String, String)]) -> Result<()> {
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::UnixStream;

    let socket_path = chroot_path.join("api.sock");
    let mut stream = UnixStream::connect(&socket_path).await.map_err(Error::Io)?;
    let mut body = String::new();
    for (key, value) in data {
        body.push_str(key);
        body.push('=');
        body.push_str(value);
        body.push('\n');
    }
    let request = format!(
        "PUT /mmds HTTP/1.1\r\nHost: localhost\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(Error::Io)?;
    stream.write_all(body.as_bytes()).await.map_err(Error::Io)?;
    Ok(())
}

/// Polls for the hypervisor's API socket to appear under the chroot.
async fn wait_for_readiness(chroot_path: &std::path::Path, bound: Duration) -> Result<()> {
    let socket_path = chroot_path.join("api.sock");
    let mut ticker = interval(Duration::from_millis(100));
    timeout(bound, async {
        loop {
            if socket_path.exists() {
                return;
            }
            ticker.tick().await;
        }
    })
    .await
    .map_err(|_| Error::Timeout("hypervisor readiness socket".to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_for_readiness_times_out_when_socket_never_appears() {
        let dir = tempfile::tempdir().unwrap();
        let err = wait_for_readiness(dir.path(), Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn wait_for_readiness_succeeds_once_socket_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("api.sock"), b"").unwrap();
        wait_for_readiness(dir.path(), Duration::from_millis(500))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn publish_mmds_sends_dotenv_body_over_api_socket() {
        use tokio::io::AsyncReadExt as _;
        use tokio::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(dir.path().join("api.sock")).unwrap();

        let data = vec![("hostname".to_owned(), "builder".to_owned())];
        let accept = listener.accept();
        let send = publish_mmds(dir.path(), &data);
        let ((mut conn, _), ()) = tokio::try_join!(
            async { Ok::<_, std::io::Error>(accept.await?) },
            async {
                send.await.unwrap();
                Ok::<_, std::io::Error>(())
            }
        )
        .unwrap();

        let mut buf = Vec::new();
        conn.read_to_end(&mut buf).await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("PUT /mmds HTTP/1.1"));
        assert!(text.ends_with("hostname=builder\n"));
    }
}
