//! Jail Provisioner (C9): lays out a per-VM chroot, links kernel and rootfs
//! into it, and composes the jailer's and hypervisor's invocation.
//!
//! Generalizes the sandbox-wrap pattern (spawn a child, detach stdin, apply
//! pre-exec hardening) to wrapping the jailer binary itself rather than
//! bubblewrap/seatbelt: here the jailer chroot *is* the sandbox, so
//! platform-specific namespace wrapping is dropped.

mod pre_exec;

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::{fs, io};

use serde::Serialize;
use tokio::process::Child;

use crate::registry::{JailerConfig, MachineConfig};
use crate::{Error, Result};

/// In-memory hypervisor configuration, written to `config.json` inside the
/// chroot before the jailer is spawned.
#[derive(Debug, Serialize)]
struct HypervisorConfig<'a> {
    #[serde(rename = "boot-source")]
    boot_source: BootSource<'a>,
    drives: Vec<Drive<'a>>,
    #[serde(rename = "network-interfaces")]
    network_interfaces: Vec<NetworkInterface<'a>>,
    #[serde(rename = "machine-config")]
    machine_config: MachineConfigWire<'a>,
    #[serde(rename = "mmds-config")]
    mmds_config: MmdsConfig,
}

#[derive(Debug, Serialize)]
struct BootSource<'a> {
    kernel_image_path: &'a str,
    boot_args: String,
}

#[derive(Debug, Serialize)]
struct Drive<'a> {
    drive_id: &'static str,
    path_on_host: &'a str,
    is_root_device: bool,
    is_read_only: bool,
}

#[derive(Debug, Serialize)]
struct NetworkInterface<'a> {
    iface_id: &'static str,
    host_dev_name: &'a str,
}

#[derive(Debug, Serialize)]
struct MachineConfigWire<'a> {
    vcpu_count: u8,
    mem_size_mib: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    cpu_template: Option<&'a str>,
    ht_enabled: bool,
}

#[derive(Debug, Serialize)]
struct MmdsConfig {
    version: &'static str,
    #[serde(rename = "ipv4_address")]
    ipv4_address: &'static str,
    #[serde(rename = "network_interfaces")]
    network_interfaces: Vec<&'static str>,
}

/// The link-local address the guest reads MMDS data from (spec §6).
const MMDS_ADDRESS: &str = "169.254.169.254";

/// A provisioned per-VM chroot, ready for the jailer to be spawned against.
#[derive(Debug, Clone)]
pub struct Jail {
    /// `<chroot-base>/<basename(hypervisor-binary)>/<vm-id>/`.
    pub chroot_path: PathBuf,
    /// Kernel path as seen *inside* the chroot.
    pub kernel_in_jail: PathBuf,
    /// Rootfs path as seen *inside* the chroot.
    pub rootfs_in_jail: PathBuf,
    /// Hypervisor config path as seen *inside* the chroot.
    pub config_in_jail: PathBuf,
}

/// Lays out the chroot for `vm_id`: creates the directory, links the kernel
/// and rootfs in (hard link, falling back to copy across filesystems), and
/// writes the hypervisor configuration.
pub fn provision(
    jailer: &JailerConfig,
    machine: &MachineConfig,
    vm_id: &str,
    kernel_path: &Path,
    rootfs_path: &Path,
    ifname: &str,
) -> Result<Jail> {
    let exec_name = jailer
        .hypervisor_binary
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Config("hypervisor binary path has no file name".to_owned()))?;
    let chroot_path = jailer.chroot_base.join(exec_name).join(vm_id);
    fs::create_dir_all(&chroot_path).map_err(Error::Io)?;

    let kernel_in_jail = chroot_path.join("kernel");
    let rootfs_in_jail = chroot_path.join("rootfs.ext4");
    link_or_copy(kernel_path, &kernel_in_jail)?;
    link_or_copy(rootfs_path, &rootfs_in_jail)?;

    let boot_args = machine.kernel_args.join(" ");
    let config = HypervisorConfig {
        boot_source: BootSource {
            kernel_image_path: "kernel",
            boot_args: format!(
                "root=PARTUUID={} {boot_args}",
                machine.root_drive_part_uuid
            ),
        },
        drives: vec![Drive {
            drive_id: "rootfs",
            path_on_host: "rootfs.ext4",
            is_root_device: true,
            is_read_only: false,
        }],
        network_interfaces: vec![NetworkInterface {
            iface_id: "eth0",
            host_dev_name: ifname,
        }],
        machine_config: MachineConfigWire {
            vcpu_count: machine.vcpus,
            mem_size_mib: machine.mem_mib,
            cpu_template: machine.cpu_template.as_deref(),
            ht_enabled: machine.hyperthreading,
        },
        mmds_config: MmdsConfig {
            version: "V2",
            ipv4_address: MMDS_ADDRESS,
            network_interfaces: vec!["eth0"],
        },
    };

    let config_in_jail = chroot_path.join("config.json");
    let file = fs::File::create(&config_in_jail).map_err(Error::Io)?;
    serde_json::to_writer_pretty(file, &config).map_err(io::Error::other)?;

    Ok(Jail {
        chroot_path,
        kernel_in_jail,
        rootfs_in_jail,
        config_in_jail,
    })
}

/// Hard-links `src` to `dst`, falling back to a full copy if they are on
/// different filesystems.
fn link_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if dst.exists() {
        fs::remove_file(dst).map_err(Error::Io)?;
    }
    match fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            fs::copy(src, dst).map_err(Error::Io)?;
            Ok(())
        }
        Err(e) => Err(Error::Io(e)),
    }
}

/// Spawns the jailer against a provisioned chroot, detaching stdin and
/// letting stdout/stderr forward to this process (spec §4.9: "Standard
/// input is detached; stdout/stderr forward to the process owner").
pub fn spawn(jailer: &JailerConfig, jail: &Jail, vm_id: &str, netns: &str) -> io::Result<Child> {
    let mut cmd = Command::new(&jailer.jailer_binary);
    cmd.args(["--id", vm_id]);
    cmd.arg("--exec-file");
    cmd.arg(&jailer.hypervisor_binary);
    cmd.args(["--uid", &jailer.uid.to_string()]);
    cmd.args(["--gid", &jailer.gid.to_string()]);
    cmd.arg("--chroot-base-dir");
    cmd.arg(&jailer.chroot_base);
    cmd.args(["--netns", netns]);
    if let Some(node) = jailer.numa_node {
        cmd.args(["--node", &node.to_string()]);
    }
    cmd.arg("--daemonize");
    cmd.arg("--");
    cmd.arg("--config-file");
    cmd.arg(&jail.config_in_jail);

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());
    pre_exec::apply(&mut cmd);
    tokio::process::Command::from(cmd).spawn()
}

/// Removes the per-VM chroot directory. Safe to call on a partially
/// provisioned or already-removed jail.
pub fn teardown(jail: &Jail) -> io::Result<()> {
    if jail.chroot_path.exists() {
        fs::remove_dir_all(&jail.chroot_path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::JailerConfig;

    fn machine() -> MachineConfig {
        MachineConfig {
            vcpus: 1,
            mem_mib: 256,
            cpu_template: None,
            hyperthreading: false,
            kernel_args: vec!["console=ttyS0".to_owned()],
            root_drive_part_uuid: "00000000-0000-0000-0000-000000000000".to_owned(),
        }
    }

    #[test]
    fn provision_links_kernel_and_rootfs_into_chroot() {
        let base = tempfile::tempdir().unwrap();
        let kernel = base.path().join("vmlinux");
        let rootfs = base.path().join("rootfs.ext4");
        fs::write(&kernel, b"kernel").unwrap();
        fs::write(&rootfs, b"rootfs").unwrap();

        let jailer = JailerConfig {
            hypervisor_binary: PathBuf::from("/usr/bin/hypervisor"),
            jailer_binary: PathBuf::from("/usr/bin/jailer"),
            chroot_base: base.path().join("jail-base"),
            uid: 1000,
            gid: 1000,
            numa_node: None,
        };

        let jail = provision(&jailer, &machine(), "vm12345", &kernel, &rootfs, "veth0").unwrap();

        assert!(jail.chroot_path.ends_with("hypervisor/vm12345"));
        assert!(jail.kernel_in_jail.exists());
        assert!(jail.rootfs_in_jail.exists());
        assert!(jail.config_in_jail.exists());

        let written = fs::read_to_string(&jail.config_in_jail).unwrap();
        assert!(written.contains("\"is_root_device\": true"));
        assert!(written.contains("169.254.169.254"));

        teardown(&jail).unwrap();
        assert!(!jail.chroot_path.exists());
    }
}
