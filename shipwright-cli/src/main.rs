//! CLI front-end for `shipwright`.
//!
//! Intentionally thin (spec §1 places "the command-line front-end" out of
//! scope as an external collaborator): this binary only wires the in-scope
//! components together behind two subcommands, `build` and `run`, for
//! manual or CI exercise of the library crates.

mod config;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use clap::Parser;
use config::{BuildArgs, Cli, Command, RunArgs};
use shipwright::registry::{CommandConfig, NetworkConfig, RootfsIdentity, RunMetadata};
use shipwright::{firewall, id, registry::RunRegistry, rootfs, server, vmm};
use shipwright_recipe::planner::{self, DependencyResolver, NoDependencies};
use shipwright_recipe::resource::RecipeOrigin;
use shipwright_recipe::{reader, Stages};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Build(args) => build(args).await,
        Command::Run(args) => run(args).await,
    };

    if let Err(e) = &result {
        tracing::error!(%e, "fatal error");
        std::process::exit(1);
    }
    Ok(())
}

async fn build(args: BuildArgs) -> Result<()> {
    config::validate_jail(&args.jail)?;
    config::validate_runtime(&args.runtime)?;
    RootfsIdentity::parse(&args.tag).map_err(|e| anyhow::anyhow!(e))?;
    let env_overrides = config::resolve_env(&args.runtime)?;

    for cmd in &args.pre_build {
        run_host_command(cmd).await?;
    }

    tracing::info!(recipe = %args.recipe, "reading recipe");
    let instructions = reader::read(&args.recipe).await.context("reading recipe")?;
    let stages = Stages::split(instructions).context("splitting stages")?;

    let build_arg_overrides = parse_kv_multi(&args.build_args)?;
    let recipe_origin = recipe_origin(&args.recipe);

    let resolver: Box<dyn DependencyResolver> = if stages.named().next().is_some() {
        let exporter = shipwright_deps::DepsExporter::open(
            shipwright_deps::ExporterConfig {
                engine: args.container_engine.clone(),
                cache_dir: args.runtime.run_cache.join("deps"),
            },
            stages.clone(),
        )
        .context("opening dependency exporter")?;
        Box::new(exporter)
    } else {
        Box::new(NoDependencies)
    };

    let plan = planner::plan(
        &stages,
        &recipe_origin,
        build_arg_overrides,
        resolver.as_ref(),
        &args.excludes,
    )
    .await
    .context("planning build")?;

    let vm_id = id::generate();
    let registry = RunRegistry::open(&args.runtime.run_cache).context("opening run registry")?;
    let image_path = registry.rootfs_path(&vm_id);
    tokio::fs::create_dir_all(registry.vm_dir(&vm_id))
        .await
        .context("creating run directory")?;

    tracing::info!(path = %image_path.display(), "creating rootfs image");
    rootfs::create(&args.base_rootfs, &image_path, args.rootfs_size_mb)
        .await
        .context("creating rootfs image")?;

    let outcome = run_bootstrap_build(&args, &vm_id, &image_path, &plan, &env_overrides).await;

    match outcome {
        Ok(()) => {
            let output = args
                .output
                .clone()
                .unwrap_or_else(|| PathBuf::from(format!("{}.ext4", sanitize_tag(&args.tag))));
            tokio::fs::copy(&image_path, &output)
                .await
                .with_context(|| format!("copying built image to {}", output.display()))?;
            registry.remove(&vm_id).ok();

            for cmd in &args.post_build {
                run_host_command(cmd).await?;
            }
            println!("{}", output.display());
            Ok(())
        }
        Err(e) => {
            registry.remove(&vm_id).ok();
            Err(e)
        }
    }
}

/// Boots the builder VM, serves the bootstrap RPC to completion, and tears
/// the VM down. On success the rootfs image at `image_path` holds the
/// finished build; on any failure it is left in place for the caller to
/// discard (spec §7: an aborted build persists no artifact).
async fn run_bootstrap_build(
    args: &BuildArgs,
    vm_id: &str,
    image_path: &Path,
    plan: &shipwright_recipe::Plan,
    env_overrides: &[(String, String)],
) -> Result<()> {
    let listener = TcpListener::bind("0.0.0.0:0")
        .await
        .context("binding bootstrap listener")?;
    let bootstrap_port = listener.local_addr()?.port();

    let server_name = "bootstrap.shipwright.internal";
    let (acceptor, pki) =
        server::build_acceptor(server_name, "shipwright-guest").context("generating bootstrap TLS material")?;
    let (commands, resources, contexts) = server::prepare(plan);

    let netns_path = args.cni.netns_path.clone();
    let start_config = vmm::StartConfig {
        vm_id: vm_id.to_owned(),
        jailer: args.jail.clone().into(),
        machine: args.machine.clone().into(),
        cni: args.cni.clone().into(),
        command: CommandConfig {
            kernel_path: args.runtime.kernel_path.clone(),
            rootfs_path: image_path.to_path_buf(),
        },
        netns_path,
        readiness_timeout: Duration::from_secs(args.runtime.readiness_timeout_secs),
    };

    let handle = vmm::start(start_config).await.context("starting builder VM")?;

    let mut mmds = vec![
        ("bootstrap.address".to_owned(), format!("{}:{bootstrap_port}", handle.network.gateway)),
        ("bootstrap.server_name".to_owned(), server_name.to_owned()),
        ("bootstrap.ca_cert".to_owned(), pki.ca_cert_pem.clone()),
        ("bootstrap.client_cert".to_owned(), pki.client_cert_pem.clone()),
        ("bootstrap.client_key".to_owned(), pki.client_key_pem.clone()),
    ];
    if let Some(hostname) = &args.runtime.hostname {
        mmds.push(("hostname".to_owned(), hostname.clone()));
    }
    if let Some(identity_file) = &args.runtime.identity_file {
        let key = tokio::fs::read_to_string(identity_file)
            .await
            .with_context(|| format!("reading identity file {}", identity_file.display()))?;
        mmds.push(("ssh_authorized_key".to_owned(), key.trim().to_owned()));
    }
    for (k, v) in env_overrides {
        mmds.push((format!("env.{k}"), v.clone()));
    }

    vmm::publish_mmds(&handle.chroot_path, &mmds)
        .await
        .context("publishing boot parameters")?;

    let build_result = async {
        let (tls, _peer) = server::accept_one(&listener, &acceptor)
            .await
            .context("accepting bootstrap connection")?;
        server::handle_connection(tls, &commands, &resources, &contexts)
            .await
            .context("serving bootstrap RPC")
    }
    .await;

    handle
        .stop(Duration::from_secs(args.runtime.shutdown_timeout_secs))
        .await
        .context("stopping builder VM")?;

    build_result
}

async fn run(args: RunArgs) -> Result<()> {
    config::validate_jail(&args.jail)?;
    config::validate_runtime(&args.runtime)?;
    let rootfs_id = RootfsIdentity::parse(&args.tag).map_err(|e| anyhow::anyhow!(e))?;

    let vm_id = id::generate();
    let registry = RunRegistry::open(&args.runtime.run_cache).context("opening run registry")?;

    let start_config = vmm::StartConfig {
        vm_id: vm_id.clone(),
        jailer: args.jail.clone().into(),
        machine: args.machine.clone().into(),
        cni: args.cni.clone().into(),
        command: CommandConfig {
            kernel_path: args.runtime.kernel_path.clone(),
            rootfs_path: args.rootfs.clone(),
        },
        netns_path: args.cni.netns_path.clone(),
        readiness_timeout: Duration::from_secs(args.runtime.readiness_timeout_secs),
    };

    let mut handle = vmm::start(start_config).await.context("starting VM")?;
    tracing::info!(vm_id, ip = %handle.network.ip, "VM running");

    let mut metadata = RunMetadata {
        vm_id: vm_id.clone(),
        cni: args.cni.clone().into(),
        jailer: args.jail.clone().into(),
        machine: args.machine.clone().into(),
        command: CommandConfig {
            kernel_path: args.runtime.kernel_path.clone(),
            rootfs_path: args.rootfs.clone(),
        },
        rootfs: rootfs_id,
        pid: handle.pid,
        started_at: SystemTime::now(),
        network: NetworkConfig {
            ifname: handle.network.ifname.clone(),
            ip: handle.network.ip.clone(),
            gateway: handle.network.gateway.clone(),
            nameservers: handle.network.nameservers.clone(),
        },
    };
    handle.decorate_metadata(&mut metadata);
    registry.write(&metadata).context("writing run metadata")?;

    let port_mappings: Vec<firewall::PortMapping> = args
        .runtime
        .ports
        .iter()
        .map(|s| firewall::PortMapping::parse(s).map_err(|e| anyhow::anyhow!(e)))
        .collect::<Result<_>>()?;
    if !port_mappings.is_empty() {
        firewall::publish(&vm_id, &ip_only(&handle.network.ip), &port_mappings).await;
    }

    if args.runtime.daemonize {
        println!("{vm_id}");
        return Ok(());
    }

    handle.wait().await.context("waiting on VM")?;
    if !port_mappings.is_empty() {
        firewall::unpublish(&vm_id, &ip_only(&handle.network.ip), &port_mappings).await;
    }
    handle
        .stop(Duration::from_secs(args.runtime.shutdown_timeout_secs))
        .await
        .context("stopping VM")?;
    registry.remove(&vm_id).ok();
    Ok(())
}

fn ip_only(cidr: &str) -> String {
    cidr.split('/').next().unwrap_or(cidr).to_owned()
}

fn parse_kv_multi(entries: &[String]) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for entry in entries {
        let (k, v) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("invalid key=value entry {entry:?}"))?;
        map.insert(k.to_owned(), v.to_owned());
    }
    Ok(map)
}

/// Where `recipe` (a path, `http(s)://` URL, or `git+` reference) anchors a
/// relative `ADD`/`COPY` source. An `http(s)://` recipe resolves relative
/// sources against its own dirname; a `git+` reference is cloned to a local
/// scratch directory before parsing, so it resolves like a local path.
fn recipe_origin(recipe: &str) -> RecipeOrigin {
    if recipe.starts_with("http://") || recipe.starts_with("https://") {
        return RecipeOrigin::Http(recipe.to_owned());
    }
    if recipe.starts_with("git+") {
        return RecipeOrigin::Local(PathBuf::from("."));
    }
    RecipeOrigin::Local(
        Path::new(recipe)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    )
}

fn sanitize_tag(tag: &str) -> String {
    tag.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

async fn run_host_command(command: &str) -> Result<()> {
    tracing::info!(command, "running host command");
    let status = tokio::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .status()
        .await
        .with_context(|| format!("spawning host command {command:?}"))?;
    if !status.success() {
        anyhow::bail!("host command {command:?} exited with {status}");
    }
    Ok(())
}
