//! Command-line configuration surface (spec §6 "Configuration surface").
//!
//! One flat [`clap::Parser`] tree: `build` and `run` share the
//! machine/jail/CNI/runtime option groups since both ultimately call
//! [`shipwright::vmm::start`].

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use shipwright::registry::{CniConfig, JailerConfig, MachineConfig};

#[derive(Parser, Debug)]
#[command(name = "shipwright", version, about = "Builds and runs microVM rootfs images from Dockerfile-grammar recipes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build a rootfs image from a recipe in a throwaway builder VM.
    Build(BuildArgs),
    /// Boot an already-built rootfs image as a microVM.
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct MachineArgs {
    /// Virtual CPU count.
    #[arg(long, default_value_t = 1)]
    pub vcpus: u8,
    /// RAM size in MiB.
    #[arg(long, default_value_t = 512)]
    pub mem_mib: u32,
    /// CPU template identifier, if the hypervisor supports one.
    #[arg(long)]
    pub cpu_template: Option<String>,
    /// Enable hyperthreading for the vCPUs.
    #[arg(long)]
    pub hyperthreading: bool,
    /// Extra kernel command-line argument (repeatable).
    #[arg(long = "kernel-arg")]
    pub kernel_args: Vec<String>,
    /// PARTUUID stamped on the root drive's kernel arg.
    #[arg(long, default_value = "00000000-0000-0000-0000-000000000000")]
    pub root_drive_part_uuid: String,
}

impl From<MachineArgs> for MachineConfig {
    fn from(a: MachineArgs) -> Self {
        MachineConfig {
            vcpus: a.vcpus,
            mem_mib: a.mem_mib,
            cpu_template: a.cpu_template,
            hyperthreading: a.hyperthreading,
            kernel_args: a.kernel_args,
            root_drive_part_uuid: a.root_drive_part_uuid,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct JailArgs {
    /// Path to the hypervisor binary.
    #[arg(long, env = "SHIPWRIGHT_HYPERVISOR_BINARY")]
    pub hypervisor_binary: PathBuf,
    /// Path to the jailer binary.
    #[arg(long, env = "SHIPWRIGHT_JAILER_BINARY")]
    pub jailer_binary: PathBuf,
    /// Chroot base directory (non-empty, not `/`).
    #[arg(long, env = "SHIPWRIGHT_CHROOT_BASE")]
    pub chroot_base: PathBuf,
    /// UID the jailer drops privileges to.
    #[arg(long, default_value_t = 0)]
    pub jailer_uid: u32,
    /// GID the jailer drops privileges to.
    #[arg(long, default_value_t = 0)]
    pub jailer_gid: u32,
    /// NUMA node to pin the hypervisor to, if any.
    #[arg(long)]
    pub numa_node: Option<u32>,
}

impl From<JailArgs> for JailerConfig {
    fn from(a: JailArgs) -> Self {
        JailerConfig {
            hypervisor_binary: a.hypervisor_binary,
            jailer_binary: a.jailer_binary,
            chroot_base: a.chroot_base,
            uid: a.jailer_uid,
            gid: a.jailer_gid,
            numa_node: a.numa_node,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct CniArgs {
    /// Directory containing CNI plugin binaries.
    #[arg(long, default_value = "/opt/cni/bin")]
    pub cni_bin_dir: PathBuf,
    /// Directory containing CNI network list configs.
    #[arg(long, default_value = "/etc/cni/conf.d")]
    pub cni_conf_dir: PathBuf,
    /// CNI's own state cache directory.
    #[arg(long, default_value = "/var/lib/cni")]
    pub cni_cache_dir: PathBuf,
    /// Name of the network list to invoke.
    #[arg(long, default_value = "shipwright")]
    pub network_name: String,
    /// Path to the network namespace to attach the VM to.
    #[arg(long, default_value = "/var/run/netns/shipwright")]
    pub netns_path: PathBuf,
}

impl From<CniArgs> for CniConfig {
    fn from(a: CniArgs) -> Self {
        CniConfig {
            bin_dir: a.cni_bin_dir,
            conf_dir: a.cni_conf_dir,
            cache_dir: a.cni_cache_dir,
            network_name: a.network_name,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct RuntimeArgs {
    /// Root directory for per-VM metadata and rootfs copies.
    #[arg(long, env = "SHIPWRIGHT_RUN_CACHE")]
    pub run_cache: PathBuf,
    /// Kernel image linked into every jail.
    #[arg(long, env = "SHIPWRIGHT_KERNEL")]
    pub kernel_path: PathBuf,
    /// Hostname published to the guest.
    #[arg(long)]
    pub hostname: Option<String>,
    /// SSH public key file published to the guest.
    #[arg(long)]
    pub identity_file: Option<PathBuf>,
    /// Dotenv-syntax file of environment overrides (repeatable, applied in
    /// order before `--env`).
    #[arg(long = "env-file")]
    pub env_files: Vec<PathBuf>,
    /// A single `KEY=VALUE` environment override (repeatable, applied after
    /// `--env-file`).
    #[arg(long = "env")]
    pub env_overrides: Vec<String>,
    /// `host_port:guest_port[/proto]` port forward (repeatable).
    #[arg(long = "publish", short = 'p')]
    pub ports: Vec<String>,
    /// Seconds to wait for graceful shutdown before SIGKILL.
    #[arg(long, default_value_t = 5)]
    pub shutdown_timeout_secs: u64,
    /// Seconds to wait for the hypervisor readiness socket at boot.
    #[arg(long, default_value_t = 10)]
    pub readiness_timeout_secs: u64,
    /// Detach after a successful boot instead of waiting for the guest.
    #[arg(long)]
    pub daemonize: bool,
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Recipe source: a local path, `http(s)://…`, or `git+<url>[:<subpath>]`.
    pub recipe: String,

    /// Already-extracted base rootfs directory (the `FROM` image; no
    /// registry integration is in scope).
    #[arg(long)]
    pub base_rootfs: PathBuf,

    /// Where to write the built ext4 image. Defaults to `<tag>.ext4` in the
    /// current directory, or `rootfs.ext4` if no tag is given.
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// `org/image:version` identity to stamp on the run metadata.
    #[arg(long, default_value = "local/build:dev")]
    pub tag: String,

    /// `ARG` override, `key=value` (repeatable).
    #[arg(long = "build-arg")]
    pub build_args: Vec<String>,

    /// Host-side command run before the build starts (repeatable, in order).
    #[arg(long = "pre-build")]
    pub pre_build: Vec<String>,

    /// Host-side command run after the build succeeds (repeatable, in order).
    #[arg(long = "post-build")]
    pub post_build: Vec<String>,

    /// `.dockerignore`-style exclude pattern (repeatable; `!` negates).
    #[arg(long = "exclude")]
    pub excludes: Vec<String>,

    /// Target size of the produced ext4 image, in MiB.
    #[arg(long, default_value_t = 1024)]
    pub rootfs_size_mb: u64,

    /// Container engine used to build/export cross-stage dependencies.
    #[arg(long, default_value = "docker")]
    pub container_engine: String,

    #[command(flatten)]
    pub machine: MachineArgs,
    #[command(flatten)]
    pub jail: JailArgs,
    #[command(flatten)]
    pub cni: CniArgs,
    #[command(flatten)]
    pub runtime: RuntimeArgs,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to a previously built ext4 rootfs image.
    pub rootfs: PathBuf,

    /// `org/image:version` identity to stamp on the run metadata.
    #[arg(long, default_value = "local/build:dev")]
    pub tag: String,

    #[command(flatten)]
    pub machine: MachineArgs,
    #[command(flatten)]
    pub jail: JailArgs,
    #[command(flatten)]
    pub cni: CniArgs,
    #[command(flatten)]
    pub runtime: RuntimeArgs,
}

/// Validation failures surfaced before any side effect (spec §7 `Config`).
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("chroot base must be non-empty and not '/'")]
    ChrootBase,
    #[error("run cache must be non-empty and not '/'")]
    RunCache,
}

pub fn validate_jail(jail: &JailArgs) -> Result<(), ValidationError> {
    let chroot = jail.chroot_base.as_os_str();
    if chroot.is_empty() || jail.chroot_base == PathBuf::from("/") {
        return Err(ValidationError::ChrootBase);
    }
    Ok(())
}

pub fn validate_runtime(runtime: &RuntimeArgs) -> Result<(), ValidationError> {
    let cache = runtime.run_cache.as_os_str();
    if cache.is_empty() || runtime.run_cache == PathBuf::from("/") {
        return Err(ValidationError::RunCache);
    }
    Ok(())
}

/// Loads env files in order, then applies `--env` overrides last, per
/// spec §6's stated precedence.
pub fn resolve_env(runtime: &RuntimeArgs) -> anyhow::Result<Vec<(String, String)>> {
    let mut merged = std::collections::BTreeMap::new();
    for path in &runtime.env_files {
        for item in dotenvy::from_path_iter(path)? {
            let (k, v) = item?;
            merged.insert(k, v);
        }
    }
    for entry in &runtime.env_overrides {
        let (k, v) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("invalid --env entry {entry:?}, expected KEY=VALUE"))?;
        merged.insert(k.to_owned(), v.to_owned());
    }
    Ok(merged.into_iter().collect())
}
