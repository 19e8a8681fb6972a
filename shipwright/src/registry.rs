//! Run Registry (C12): persists per-VM metadata under the run cache and
//! answers enumeration/liveness queries.
//!
//! One directory per VM ID under `<run-cache>/runs/`, each holding a single
//! `metadata.json` file — the same load/save-via-`serde_json` pattern the
//! teacher used for its VM state snapshots, but written straight to the
//! per-VM directory rather than a shared SQLite index: per spec §4.12
//! writing is not atomic across processes and the design assumes one writer
//! per VM directory, which a plain JSON file already satisfies.

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use std::{fs, io};

use serde::{Deserialize, Serialize};

/// `(org, image, version)` identity of a built rootfs, matching
/// `[a-z0-9]{1,60}/[a-z0-9]{1,60}:[a-z0-9.]{1,15}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootfsIdentity {
    /// Organization segment.
    pub org: String,
    /// Image name segment.
    pub image: String,
    /// Version segment.
    pub version: String,
}

impl RootfsIdentity {
    /// Parses `org/image:version`, validating the character classes and
    /// length limits from spec §6.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (org_image, version) = s
            .split_once(':')
            .ok_or_else(|| format!("missing ':version' in rootfs identity {s:?}"))?;
        let (org, image) = org_image
            .split_once('/')
            .ok_or_else(|| format!("missing 'org/' in rootfs identity {s:?}"))?;

        let valid_segment = |segment: &str, max_len: usize, extra: fn(char) -> bool| {
            !segment.is_empty()
                && segment.len() <= max_len
                && segment
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || extra(c))
        };
        if !valid_segment(org, 60, |_| false) {
            return Err(format!("invalid org segment {org:?}"));
        }
        if !valid_segment(image, 60, |_| false) {
            return Err(format!("invalid image segment {image:?}"));
        }
        if !valid_segment(version, 15, |c| c == '.') {
            return Err(format!("invalid version segment {version:?}"));
        }

        Ok(Self {
            org: org.to_owned(),
            image: image.to_owned(),
            version: version.to_owned(),
        })
    }
}

impl std::fmt::Display for RootfsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.org, self.image, self.version)
    }
}

/// Static network configuration handed to a booted guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Host-side veth interface name.
    pub ifname: String,
    /// Guest IPv4 address, CIDR notation.
    pub ip: String,
    /// Gateway IPv4 address.
    pub gateway: String,
    /// Nameservers handed to the guest.
    pub nameservers: Vec<String>,
}

/// Machine resource configuration (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Virtual CPU count.
    pub vcpus: u8,
    /// RAM size in MiB.
    pub mem_mib: u32,
    /// CPU template identifier, if the hypervisor supports one.
    pub cpu_template: Option<String>,
    /// Whether hyperthreading is enabled for the vCPUs.
    pub hyperthreading: bool,
    /// Extra kernel command-line arguments.
    pub kernel_args: Vec<String>,
    /// PARTUUID stamped on the root drive's kernel arg.
    pub root_drive_part_uuid: String,
}

/// Hypervisor/jailer binary paths and chroot policy (spec §6, §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JailerConfig {
    /// Path to the hypervisor binary.
    pub hypervisor_binary: PathBuf,
    /// Path to the jailer binary.
    pub jailer_binary: PathBuf,
    /// Chroot base directory (non-empty, not `/`).
    pub chroot_base: PathBuf,
    /// UID the jailer drops privileges to.
    pub uid: u32,
    /// GID the jailer drops privileges to.
    pub gid: u32,
    /// NUMA node to pin the hypervisor to, if any.
    pub numa_node: Option<u32>,
}

/// CNI plugin invocation configuration (spec §6, §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CniConfig {
    /// Directory containing CNI plugin binaries.
    pub bin_dir: PathBuf,
    /// Directory containing CNI network list configs.
    pub conf_dir: PathBuf,
    /// CNI's own state cache directory.
    pub cache_dir: PathBuf,
    /// Name of the network list to invoke.
    pub network_name: String,
}

/// Paths to the kernel and per-run rootfs linked into the jail (spec §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Kernel image path.
    pub kernel_path: PathBuf,
    /// Per-run rootfs ext4 image path.
    pub rootfs_path: PathBuf,
}

/// A record persisted as JSON in the run cache, per spec §3 "Run Metadata".
///
/// Written exactly once, after boot succeeds; deleted with the cache
/// directory on teardown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// This run's VM identity.
    pub vm_id: String,
    /// CNI invocation configuration.
    pub cni: CniConfig,
    /// Jailer invocation configuration.
    pub jailer: JailerConfig,
    /// Machine resource configuration.
    pub machine: MachineConfig,
    /// Kernel/rootfs paths linked into the jail.
    pub command: CommandConfig,
    /// Identity of the rootfs this VM was booted from.
    pub rootfs: RootfsIdentity,
    /// Host PID of the jailer (and, transitively, the hypervisor).
    pub pid: u32,
    /// Wall-clock time the VM was observed running.
    pub started_at: SystemTime,
    /// The network interface's static configuration.
    pub network: NetworkConfig,
}

impl RunMetadata {
    /// Loads a metadata record from `path`.
    pub fn load(path: &Path) -> io::Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Persists this record to `path` as pretty JSON.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }
}

/// Whether a registered VM's process is observed alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// `kill(pid, 0)` succeeded, or failed with `EPERM` (owned by another
    /// user — treated as running per spec §4.12).
    Running,
    /// `kill(pid, 0)` failed with `ESRCH`.
    Exited,
}

/// The per-VM-directory metadata store under `<run-cache>/runs/`.
#[derive(Debug, Clone)]
pub struct RunRegistry {
    runs_dir: PathBuf,
}

impl RunRegistry {
    /// Opens (creating if absent) the run registry rooted at `run_cache`.
    pub fn open(run_cache: impl AsRef<Path>) -> io::Result<Self> {
        let runs_dir = run_cache.as_ref().join("runs");
        fs::create_dir_all(&runs_dir)?;
        Ok(Self { runs_dir })
    }

    /// The per-VM cache directory (may not exist yet).
    pub fn vm_dir(&self, vm_id: &str) -> PathBuf {
        self.runs_dir.join(vm_id)
    }

    /// The metadata file path for a VM (may not exist yet).
    pub fn metadata_path(&self, vm_id: &str) -> PathBuf {
        self.vm_dir(vm_id).join("metadata.json")
    }

    /// The per-run rootfs image path for a VM (may not exist yet).
    pub fn rootfs_path(&self, vm_id: &str) -> PathBuf {
        self.vm_dir(vm_id).join("rootfs.ext4")
    }

    /// Persists `metadata` under its own VM directory, creating the
    /// directory if needed.
    pub fn write(&self, metadata: &RunMetadata) -> io::Result<()> {
        fs::create_dir_all(self.vm_dir(&metadata.vm_id))?;
        metadata.save(&self.metadata_path(&metadata.vm_id))
    }

    /// Returns the metadata for `vm_id` and whether the file was present.
    ///
    /// A present-but-unparseable file is logged and reported as `(None, true)`
    /// rather than failing the caller.
    pub fn fetch_metadata_if_exists(&self, vm_id: &str) -> (Option<RunMetadata>, bool) {
        let path = self.metadata_path(vm_id);
        if !path.exists() {
            return (None, false);
        }
        match RunMetadata::load(&path) {
            Ok(metadata) => (Some(metadata), true),
            Err(e) => {
                tracing::warn!(vm_id, %e, "run metadata present but unreadable");
                (None, true)
            }
        }
    }

    /// Lists every VM ID with a directory under the registry.
    pub fn list(&self) -> io::Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.runs_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                ids.push(name.to_owned());
            }
        }
        Ok(ids)
    }

    /// Removes the VM's cache directory entirely (metadata + rootfs image).
    pub fn remove(&self, vm_id: &str) -> io::Result<()> {
        let dir = self.vm_dir(vm_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Probes whether `pid` is alive via a signal-0 send, per spec §4.12.
#[cfg(unix)]
pub fn probe(pid: u32) -> Liveness {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => Liveness::Running,
        Err(nix::errno::Errno::EPERM) => Liveness::Running,
        Err(_) => Liveness::Exited,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_rootfs_identity() {
        let id = RootfsIdentity::parse("acme/builder:1.2").unwrap();
        assert_eq!(id.org, "acme");
        assert_eq!(id.image, "builder");
        assert_eq!(id.version, "1.2");
        assert_eq!(id.to_string(), "acme/builder:1.2");
    }

    #[test]
    fn rejects_missing_version() {
        assert!(RootfsIdentity::parse("acme/builder").is_err());
    }

    #[test]
    fn rejects_uppercase_segment() {
        assert!(RootfsIdentity::parse("Acme/builder:1").is_err());
    }

    #[test]
    fn write_then_fetch_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RunRegistry::open(dir.path()).unwrap();
        let metadata = sample_metadata("vm1");
        registry.write(&metadata).unwrap();

        let (fetched, present) = registry.fetch_metadata_if_exists("vm1");
        assert!(present);
        assert_eq!(fetched.unwrap().vm_id, "vm1");
        assert_eq!(registry.list().unwrap(), vec!["vm1".to_owned()]);
    }

    #[test]
    fn fetch_missing_reports_absent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RunRegistry::open(dir.path()).unwrap();
        let (fetched, present) = registry.fetch_metadata_if_exists("nope");
        assert!(fetched.is_none());
        assert!(!present);
    }

    #[test]
    fn remove_deletes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RunRegistry::open(dir.path()).unwrap();
        registry.write(&sample_metadata("vm1")).unwrap();
        registry.remove("vm1").unwrap();
        assert!(!registry.vm_dir("vm1").exists());
    }

    #[test]
    fn current_process_probes_running() {
        assert_eq!(probe(std::process::id()), Liveness::Running);
    }

    fn sample_metadata(vm_id: &str) -> RunMetadata {
        RunMetadata {
            vm_id: vm_id.to_owned(),
            cni: CniConfig {
                bin_dir: "/opt/cni/bin".into(),
                conf_dir: "/etc/cni/conf.d".into(),
                cache_dir: "/var/lib/cni".into(),
                network_name: "shipwright".into(),
            },
            jailer: JailerConfig {
                hypervisor_binary: "/usr/bin/hypervisor".into(),
                jailer_binary: "/usr/bin/jailer".into(),
                chroot_base: "/srv/jail".into(),
                uid: 1000,
                gid: 1000,
                numa_node: None,
            },
            machine: MachineConfig {
                vcpus: 1,
                mem_mib: 512,
                cpu_template: None,
                hyperthreading: false,
                kernel_args: vec![],
                root_drive_part_uuid: "00000000-0000-0000-0000-000000000000".into(),
            },
            command: CommandConfig {
                kernel_path: "/srv/kernel".into(),
                rootfs_path: "/srv/rootfs.ext4".into(),
            },
            rootfs: RootfsIdentity::parse("acme/builder:1").unwrap(),
            pid: std::process::id(),
            started_at: SystemTime::now(),
            network: NetworkConfig {
                ifname: "veth0".into(),
                ip: "172.16.0.2/30".into(),
                gateway: "172.16.0.1".into(),
                nameservers: vec!["1.1.1.1".into()],
            },
        }
    }
}
