//! CNI Network Manager (C10): invokes the CNI plugin chain for setup and
//! idempotent teardown of a VM's veth + namespace.
//!
//! CNI plugins are themselves executables invoked with a JSON network config
//! on stdin and `CNI_*` environment variables; the plugin's result comes back
//! as JSON on stdout. This shells out and parses structured stdout (see
//! `rootfs.rs`'s `run_checked`) rather than linking a CNI client library,
//! since no such crate is in the dependency tree.

use std::collections::HashMap;
use std::path::Path;

use rand::Rng as _;
use serde::Deserialize;
use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;

use crate::registry::{CniConfig, NetworkConfig};
use crate::{Error, Result};

const VETH_SUFFIX_LEN: usize = 6;
const VETH_SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Network list loaded from `<conf-dir>/<name>.conflist`.
#[derive(Debug, Deserialize)]
struct NetworkList {
    #[serde(rename = "cniVersion")]
    cni_version: String,
    plugins: Vec<serde_json::Value>,
}

/// The subset of a plugin's ADD result this component needs.
#[derive(Debug, Deserialize)]
struct CniResult {
    ips: Vec<CniIp>,
    #[serde(default)]
    dns: CniDns,
}

#[derive(Debug, Deserialize)]
struct CniIp {
    address: String,
    gateway: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CniDns {
    #[serde(default)]
    nameservers: Vec<String>,
}

/// Generates a short random veth name, e.g. `veth3f9a2c`.
pub fn random_ifname() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..VETH_SUFFIX_LEN)
        .map(|_| {
            let idx = rng.r#gen::<usize>() % VETH_SUFFIX_ALPHABET.len();
            VETH_SUFFIX_ALPHABET[idx] as char
        })
        .collect();
    format!("veth{suffix}")
}

/// Invokes the configured network list's plugin chain with `ADD`, returning
/// the allocated network configuration.
pub async fn add(cni: &CniConfig, vm_id: &str, netns_path: &Path, ifname: &str) -> Result<NetworkConfig> {
    let list = load_network_list(cni).await?;
    let mut prev_result: Option<serde_json::Value> = None;

    for plugin in &list.plugins {
        let config = merge_runtime_config(plugin, &list.cni_version, prev_result.as_ref());
        let stdout = invoke_plugin(cni, vm_id, netns_path, ifname, "ADD", &config).await?;
        prev_result = Some(serde_json::from_str(&stdout).map_err(|e| {
            Error::Cni(format!("plugin returned invalid result JSON: {e}"))
        })?);
    }

    let result: CniResult = prev_result
        .ok_or_else(|| Error::Cni(format!("network list {:?} has no plugins", cni.network_name)))
        .and_then(|v| {
            serde_json::from_value(v).map_err(|e| Error::Cni(format!("unexpected ADD result shape: {e}")))
        })?;

    let ip = result
        .ips
        .first()
        .ok_or_else(|| Error::Cni("ADD result carried no IP assignment".to_owned()))?;

    Ok(NetworkConfig {
        ifname: ifname.to_owned(),
        ip: ip.address.clone(),
        gateway: ip.gateway.clone().unwrap_or_default(),
        nameservers: result.dns.nameservers,
    })
}

/// Invokes the configured network list's plugin chain with `DEL`. Idempotent:
/// a plugin reporting the interface already gone is treated as success (spec
/// §4.10/§8 "CNI delete is idempotent").
pub async fn delete(cni: &CniConfig, vm_id: &str, netns_path: &Path, ifname: &str) -> Result<()> {
    let list = match load_network_list(cni).await {
        Ok(list) => list,
        Err(e) => {
            tracing::warn!(vm_id, %e, "cni delete: network list unreadable, treating as already torn down");
            return Ok(());
        }
    };

    for plugin in &list.plugins {
        let config = merge_runtime_config(plugin, &list.cni_version, None);
        if let Err(e) = invoke_plugin(cni, vm_id, netns_path, ifname, "DEL", &config).await {
            tracing::warn!(vm_id, ifname, %e, "cni delete failed, treating as already torn down");
        }
    }
    Ok(())
}

async fn load_network_list(cni: &CniConfig) -> Result<NetworkList> {
    let path = cni
        .conf_dir
        .join(format!("{}.conflist", cni.network_name));
    let data = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| Error::Cni(format!("reading {}: {e}", path.display())))?;
    serde_json::from_str(&data).map_err(|e| Error::Cni(format!("parsing {}: {e}", path.display())))
}

/// Folds the previous plugin's result into the next plugin's config, per the
/// CNI chaining convention (`prevResult` field).
fn merge_runtime_config(
    plugin: &serde_json::Value,
    cni_version: &str,
    prev_result: Option<&serde_json::Value>,
) -> serde_json::Value {
    let mut config = plugin.clone();
    if let serde_json::Value::Object(map) = &mut config {
        map.entry("cniVersion")
            .or_insert_with(|| serde_json::Value::String(cni_version.to_owned()));
        if let Some(prev) = prev_result {
            map.insert("prevResult".to_owned(), prev.clone());
        }
    }
    config
}

async fn invoke_plugin(
    cni: &CniConfig,
    vm_id: &str,
    netns_path: &Path,
    ifname: &str,
    command: &str,
    config: &serde_json::Value,
) -> Result<String> {
    let plugin_type = config
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Cni("plugin config missing 'type'".to_owned()))?;
    let bin_path = cni.bin_dir.join(plugin_type);

    let env: HashMap<&'static str, String> = HashMap::from([
        ("CNI_COMMAND", command.to_owned()),
        ("CNI_CONTAINERID", vm_id.to_owned()),
        ("CNI_NETNS", netns_path.display().to_string()),
        ("CNI_IFNAME", ifname.to_owned()),
        ("CNI_PATH", cni.bin_dir.display().to_string()),
    ])
    .into_iter()
    .collect();

    let mut child = Command::new(&bin_path)
        .envs(env)
        .env("CNI_CACHE_DIR", &cni.cache_dir)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| Error::Cni(format!("spawning {}: {e}", bin_path.display())))?;

    let payload = serde_json::to_vec(config).map_err(|e| Error::Cni(e.to_string()))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(&payload)
            .await
            .map_err(|e| Error::Cni(format!("writing to {}: {e}", bin_path.display())))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| Error::Cni(format!("waiting on {}: {e}", bin_path.display())))?;

    if !output.status.success() {
        return Err(Error::Cni(format!(
            "{} {command} failed: {}",
            bin_path.display(),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    String::from_utf8(output.stdout).map_err(|e| Error::Cni(e.to_string()))
}

#[cfg(test)]
#[derive(serde::Serialize)]
struct DummyConflist {
    #[serde(rename = "cniVersion")]
    cni_version: &'static str,
    plugins: Vec<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ifname_has_expected_shape() {
        let name = random_ifname();
        assert!(name.starts_with("veth"));
        assert_eq!(name.len(), "veth".len() + VETH_SUFFIX_LEN);
    }

    #[test]
    fn successive_ifnames_differ() {
        assert_ne!(random_ifname(), random_ifname());
    }

    #[tokio::test]
    async fn load_network_list_reads_conflist() {
        let dir = tempfile::tempdir().unwrap();
        let conflist = DummyConflist {
            cni_version: "1.0.0",
            plugins: vec![serde_json::json!({"type": "bridge"})],
        };
        tokio::fs::write(
            dir.path().join("shipwright.conflist"),
            serde_json::to_vec(&conflist).unwrap(),
        )
        .await
        .unwrap();

        let cni = CniConfig {
            bin_dir: "/opt/cni/bin".into(),
            conf_dir: dir.path().to_path_buf(),
            cache_dir: "/var/lib/cni".into(),
            network_name: "shipwright".into(),
        };
        let list = load_network_list(&cni).await.unwrap();
        assert_eq!(list.plugins.len(), 1);
    }

    #[tokio::test]
    async fn delete_with_missing_network_list_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let cni = CniConfig {
            bin_dir: "/opt/cni/bin".into(),
            conf_dir: dir.path().to_path_buf(),
            cache_dir: "/var/lib/cni".into(),
            network_name: "nonexistent".into(),
        };
        delete(&cni, "vm1", Path::new("/var/run/netns/vm1"), "veth0")
            .await
            .unwrap();
    }
}
