//! Builds bootable ext4 root filesystems for microVMs from Dockerfile-grammar
//! recipes and runs them under a jailed hypervisor.
//!
//! `shipwright` is the host-side orchestrator: [`shipwright_recipe`] turns a
//! recipe into a [`shipwright_recipe::Plan`], [`server`] streams that plan
//! and its resources into a throwaway builder guest over the bootstrap RPC
//! ([`shipwright_proto`]), and [`jail`]/[`cni`]/[`vmm`] provision, boot, and
//! tear down the microVM that runs it. [`registry`] persists per-VM metadata
//! and [`firewall`] publishes declared guest ports to the host.
//!
//! # Quick start — running a built image
//!
//! ```no_run
//! use shipwright::vmm::{self, StartConfig};
//! use std::time::Duration;
//!
//! # async fn run(config: StartConfig) -> shipwright::Result<()> {
//! let handle = vmm::start(config).await?;
//! println!("vm {} running at {}", handle.vm_id, handle.network.ip);
//! handle.stop(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

#[cfg(unix)]
pub mod cni;
mod error;
#[cfg(unix)]
pub mod firewall;
pub mod id;
#[cfg(unix)]
pub mod jail;
pub mod registry;
#[cfg(unix)]
pub mod rootfs;
#[cfg(unix)]
pub mod server;
#[cfg(unix)]
pub mod vmm;

pub use error::{Error, Result};
pub use registry::{
    CniConfig, CommandConfig, JailerConfig, Liveness, MachineConfig, NetworkConfig, RootfsIdentity,
    RunMetadata, RunRegistry,
};
#[cfg(unix)]
pub use registry::probe;
