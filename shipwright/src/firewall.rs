//! Port Publisher (C13): installs/removes host firewall DNAT rules that
//! forward declared guest ports to the host, tagged per-VM for teardown.
//!
//! Shells out to `iptables`, in the same spirit as `rootfs.rs`'s `dd`/
//! `mkfs.ext4` invocations: the firewall backend is a host collaborator, not
//! something this crate reimplements.

use tokio::process::Command;

use crate::Result;

/// A single `host_port:guest_port[/proto]` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub guest_port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl PortMapping {
    /// Parses `host_port:guest_port[/proto]`; `proto` defaults to `tcp`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (ports, proto) = match s.split_once('/') {
            Some((ports, proto)) => (ports, proto),
            None => (s, "tcp"),
        };
        let (host, guest) = ports
            .split_once(':')
            .ok_or_else(|| format!("missing ':' in port declaration {s:?}"))?;
        let host_port: u16 = host
            .parse()
            .map_err(|_| format!("invalid host port in {s:?}"))?;
        let guest_port: u16 = guest
            .parse()
            .map_err(|_| format!("invalid guest port in {s:?}"))?;
        let protocol = match proto {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            other => return Err(format!("unsupported protocol {other:?} in {s:?}")),
        };
        Ok(Self {
            host_port,
            guest_port,
            protocol,
        })
    }
}

/// The comment tag every installed rule carries, per spec §6
/// (`firebuild-<vm-id>` in the original; renamed to this project's own
/// prefix — see the grounding ledger).
fn tag(vm_id: &str) -> String {
    format!("shipwright-{vm_id}")
}

/// Installs a DNAT + forward rule pair for each mapping. Best-effort: a
/// failed install is logged as a warning and does not fail the run (spec
/// §4.13).
pub async fn publish(vm_id: &str, guest_ip: &str, mappings: &[PortMapping]) {
    for mapping in mappings {
        if let Err(e) = install_one(vm_id, guest_ip, mapping).await {
            tracing::warn!(
                vm_id,
                host_port = mapping.host_port,
                guest_port = mapping.guest_port,
                %e,
                "failed to install port forwarding rule"
            );
        }
    }
}

/// Removes every rule tagged with this VM's comment. Idempotent: rules
/// already absent are not an error.
pub async fn unpublish(vm_id: &str, guest_ip: &str, mappings: &[PortMapping]) {
    for mapping in mappings {
        let _ = remove_one(vm_id, guest_ip, mapping).await;
    }
}

async fn install_one(vm_id: &str, guest_ip: &str, mapping: &PortMapping) -> Result<(), String> {
    run_iptables(&dnat_args("-A", vm_id, guest_ip, mapping)).await?;
    run_iptables(&forward_args("-A", guest_ip, mapping)).await
}

async fn remove_one(vm_id: &str, guest_ip: &str, mapping: &PortMapping) -> Result<(), String> {
    run_iptables(&dnat_args("-D", vm_id, guest_ip, mapping)).await?;
    run_iptables(&forward_args("-D", guest_ip, mapping)).await
}

fn dnat_args(action: &str, vm_id: &str, guest_ip: &str, mapping: &PortMapping) -> Vec<String> {
    vec![
        "-t".to_owned(),
        "nat".to_owned(),
        action.to_owned(),
        "PREROUTING".to_owned(),
        "-p".to_owned(),
        mapping.protocol.as_str().to_owned(),
        "--dport".to_owned(),
        mapping.host_port.to_string(),
        "-j".to_owned(),
        "DNAT".to_owned(),
        "--to-destination".to_owned(),
        format!("{guest_ip}:{}", mapping.guest_port),
        "-m".to_owned(),
        "comment".to_owned(),
        "--comment".to_owned(),
        tag(vm_id),
    ]
}

fn forward_args(action: &str, guest_ip: &str, mapping: &PortMapping) -> Vec<String> {
    vec![
        action.to_owned(),
        "FORWARD".to_owned(),
        "-p".to_owned(),
        mapping.protocol.as_str().to_owned(),
        "-d".to_owned(),
        guest_ip.to_owned(),
        "--dport".to_owned(),
        mapping.guest_port.to_string(),
        "-j".to_owned(),
        "ACCEPT".to_owned(),
    ]
}

async fn run_iptables(args: &[String]) -> Result<(), String> {
    let output = Command::new("iptables")
        .args(args)
        .output()
        .await
        .map_err(|e| e.to_string())?;
    if output.status.success() {
        return Ok(());
    }
    Err(String::from_utf8_lossy(&output.stderr).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mapping_with_default_protocol() {
        let m = PortMapping::parse("8080:80").unwrap();
        assert_eq!(m.host_port, 8080);
        assert_eq!(m.guest_port, 80);
        assert_eq!(m.protocol, Protocol::Tcp);
    }

    #[test]
    fn parses_mapping_with_explicit_udp() {
        let m = PortMapping::parse("53:53/udp").unwrap();
        assert_eq!(m.protocol, Protocol::Udp);
    }

    #[test]
    fn rejects_missing_colon() {
        assert!(PortMapping::parse("8080").is_err());
    }

    #[test]
    fn rejects_unsupported_protocol() {
        assert!(PortMapping::parse("80:80/sctp").is_err());
    }

    #[test]
    fn tag_includes_vm_id() {
        assert_eq!(tag("vm123"), "shipwright-vm123");
    }
}
