//! Build planning (C6): turns the unnamed stage's instructions into an
//! ordered [`Plan`] of executable steps plus a resolved-resource map.

use std::collections::BTreeMap;

use crate::env::BuildEnv;
use crate::error::{Error, Result};
use crate::instruction::Instruction;
use crate::resource::{self, RecipeOrigin, Resource};
use crate::stage::Stages;

/// Final VM metadata accumulated while planning, stamped onto the image.
#[derive(Debug, Clone, Default)]
pub struct VmMetadata {
    /// `ENTRYPOINT` tokens, if set.
    pub entrypoint: Option<Vec<String>>,
    /// `CMD` tokens, if set.
    pub cmd: Option<Vec<String>>,
    /// `EXPOSE` port/protocol declarations, in source order.
    pub exposed_ports: Vec<String>,
    /// `LABEL` key/value pairs.
    pub labels: BTreeMap<String, String>,
    /// `VOLUME` paths declared in the stage.
    pub volumes: Vec<String>,
    /// The build environment's final snapshot (`KEY=VALUE`).
    pub env: Vec<String>,
}

/// One executable step in a [`Plan`].
#[derive(Debug, Clone)]
pub enum PlanStep {
    /// A shell command to run in the guest.
    Run {
        /// Fully expanded command text.
        command: String,
        /// Environment snapshot in effect at this point.
        env: Vec<String>,
        /// Shell tokens (`/bin/sh -c`, etc.) in effect at this point.
        shell: Vec<String>,
        /// Effective user.
        user: String,
        /// Effective workdir.
        workdir: String,
    },
    /// An `ADD` or `COPY` materializing resources at `target`.
    Transfer {
        /// Key into [`Plan::resources`].
        source_id: String,
        /// Destination path in the image.
        target: String,
        /// Effective user.
        user: String,
        /// Effective workdir.
        workdir: String,
        /// Optional `--chown=user:group`.
        chown: Option<String>,
        /// Whether this came from `ADD` (vs. `COPY`); ADD additionally
        /// permits remote URL sources.
        is_add: bool,
    },
}

/// The ordered result of planning one recipe's unnamed stage.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Steps, in execution order.
    pub steps: Vec<PlanStep>,
    /// Resolved resources, keyed by the identifier a [`PlanStep::Transfer`]
    /// step's `source_id` references.
    pub resources: BTreeMap<String, Vec<Resource>>,
    /// Final VM metadata.
    pub metadata: VmMetadata,
}

/// Supplies the dependency exporter's (C5) output for a cross-stage `COPY`.
///
/// Implemented by `shipwright-deps`; kept as a trait here so the recipe
/// evaluator does not depend on the container-engine machinery that builds
/// and extracts dependency stages. Building and extraction both shell out to
/// subprocesses, hence the `async` method.
#[async_trait::async_trait]
pub trait DependencyResolver {
    /// Resolves `path` as exported from the named stage.
    ///
    /// # Errors
    /// Returns any error the exporter produces (`BuildFailed`,
    /// `ImageNotFound`, `PathNotPresent`), boxed.
    async fn resolve(
        &self,
        stage_name: &str,
        path: &str,
    ) -> std::result::Result<Vec<Resource>, Box<dyn std::error::Error + Send + Sync>>;
}

/// A resolver that errors on any use; for recipes with no named stages.
#[derive(Debug, Default)]
pub struct NoDependencies;

#[async_trait::async_trait]
impl DependencyResolver for NoDependencies {
    async fn resolve(
        &self,
        stage_name: &str,
        _path: &str,
    ) -> std::result::Result<Vec<Resource>, Box<dyn std::error::Error + Send + Sync>> {
        Err(format!("no dependency stages available, requested {stage_name}").into())
    }
}

/// Builds the [`Plan`] for `stages`' unnamed (final) stage.
///
/// `recipe_origin` anchors relative `ADD`/`COPY` sources against wherever the
/// recipe itself was read from (a local directory or an `http(s)://` URL).
/// `build_arg_overrides` supplies external `--build-arg` values. `excludes`
/// is a `.dockerignore`-style pattern list (a `!`-prefixed pattern negates a
/// prior exclusion) applied to local `ADD`/`COPY` source paths.
pub async fn plan(
    stages: &Stages,
    recipe_origin: &RecipeOrigin,
    build_arg_overrides: BTreeMap<String, String>,
    dependencies: &dyn DependencyResolver,
    excludes: &[String],
) -> Result<Plan> {
    let mut env = BuildEnv::with_overrides(build_arg_overrides);
    let mut steps = Vec::new();
    let mut resources: BTreeMap<String, Vec<Resource>> = BTreeMap::new();
    let mut metadata = VmMetadata::default();

    for instruction in &stages.unnamed().instructions {
        match instruction {
            Instruction::From { .. } => {}
            Instruction::Arg {
                key,
                default_value,
                ..
            } => env.put_arg(key, default_value.as_deref()),
            Instruction::Env { name, value, .. } => env.put_env(name, value),
            Instruction::Label { key, value, .. } => {
                metadata.labels.insert(env.expand(key), env.expand(value));
            }
            Instruction::Workdir { .. } | Instruction::User { .. } | Instruction::Shell { .. } => {
                // State already tracked per-instruction by the reader; the
                // planner only needs the snapshots carried on later steps.
            }
            Instruction::Expose { raw_value, .. } => {
                metadata.exposed_ports.push(env.expand(raw_value));
            }
            Instruction::Volume {
                values,
                user,
                workdir,
                ..
            } => {
                for path in values {
                    let expanded = env.expand(path);
                    metadata.volumes.push(expanded.clone());
                    steps.push(PlanStep::Run {
                        command: format!("mkdir -p {expanded}"),
                        env: env.snapshot(),
                        shell: vec!["/bin/sh".into(), "-c".into()],
                        user: user.clone(),
                        workdir: workdir.clone(),
                    });
                }
            }
            Instruction::Cmd { values, .. } => {
                metadata.cmd = Some(values.iter().map(|v| env.expand(v)).collect());
            }
            Instruction::Entrypoint { values, .. } => {
                metadata.entrypoint = Some(values.iter().map(|v| env.expand(v)).collect());
            }
            Instruction::Run {
                command,
                shell,
                user,
                workdir,
                ..
            } => {
                steps.push(PlanStep::Run {
                    command: env.expand(command),
                    env: env.snapshot(),
                    shell: shell.clone(),
                    user: user.clone(),
                    workdir: workdir.clone(),
                });
            }
            Instruction::Add {
                source,
                target,
                user,
                workdir,
                chown,
                ..
            } => {
                let source = env.expand(source);
                let target = env.expand(target);
                if excluded(&source, excludes) {
                    continue;
                }
                let resolved = resource::resolve(&source, recipe_origin)?;
                resources.insert(source.clone(), resolved);
                steps.push(PlanStep::Transfer {
                    source_id: source,
                    target,
                    user: user.clone(),
                    workdir: workdir.clone(),
                    chown: chown.clone(),
                    is_add: true,
                });
            }
            Instruction::Copy {
                source,
                target,
                from_stage,
                user,
                workdir,
                chown,
                ..
            } => {
                let source = env.expand(source);
                let target = env.expand(target);
                if excluded(&source, excludes) {
                    continue;
                }

                let source_id = if let Some(stage_name) = from_stage {
                    let synthetic = format!("{stage_name}://{source}");
                    let resolved = dependencies
                        .resolve(stage_name, &source)
                        .await
                        .map_err(|e| Error::Stage(e.to_string()))?;
                    resources.insert(synthetic.clone(), resolved);
                    synthetic
                } else {
                    let resolved = resource::resolve(&source, recipe_origin)?;
                    resources.insert(source.clone(), resolved);
                    source
                };

                steps.push(PlanStep::Transfer {
                    source_id,
                    target,
                    user: user.clone(),
                    workdir: workdir.clone(),
                    chown: chown.clone(),
                    is_add: false,
                });
            }
        }
    }

    metadata.env = env.snapshot();
    Ok(Plan {
        steps,
        resources,
        metadata,
    })
}

/// Applies `.dockerignore`-style exclude patterns to `path`.
///
/// Patterns are applied in order; a `!`-prefixed pattern un-excludes a path
/// matched by an earlier pattern. A path is excluded if the last matching
/// pattern is non-negated.
fn excluded(path: &str, patterns: &[String]) -> bool {
    let mut excluded = false;
    for pattern in patterns {
        let (negate, glob_text) = pattern
            .strip_prefix('!')
            .map_or((false, pattern.as_str()), |rest| (true, rest));
        let Ok(compiled) = glob::Pattern::new(glob_text) else {
            continue;
        };
        if compiled.matches(path) {
            excluded = !negate;
        }
    }
    excluded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader;
    use std::fs;
    use std::io::Write as _;

    async fn plan_text(text: &str, parent: &Path) -> Plan {
        let instructions = reader::parse(text).unwrap();
        let stages = Stages::split(instructions).unwrap();
        let origin = RecipeOrigin::Local(parent.to_path_buf());
        plan(&stages, &origin, BTreeMap::new(), &NoDependencies, &[])
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn run_command_expands_env() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan_text(
            "FROM alpine\nENV NAME=world\nRUN echo hello $NAME\n",
            dir.path(),
        )
        .await;
        let PlanStep::Run { command, .. } = &plan.steps[0] else {
            panic!("expected Run step")
        };
        assert_eq!(command, "echo hello world");
    }

    #[tokio::test]
    async fn volume_emits_mkdir_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan_text("FROM alpine\nVOLUME /data\n", dir.path()).await;
        assert_eq!(plan.metadata.volumes, vec!["/data".to_owned()]);
        let PlanStep::Run { command, .. } = &plan.steps[0] else {
            panic!("expected Run step")
        };
        assert_eq!(command, "mkdir -p /data");
    }

    #[tokio::test]
    async fn copy_resolves_local_source() {
        let dir = tempfile::tempdir().unwrap();
        fs::File::create(dir.path().join("app.bin"))
            .unwrap()
            .write_all(b"x")
            .unwrap();
        let plan = plan_text("FROM alpine\nCOPY app.bin /usr/bin/app\n", dir.path()).await;
        assert_eq!(plan.resources.len(), 1);
        assert!(plan.resources.contains_key("app.bin"));
    }

    #[tokio::test]
    async fn excluded_source_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::File::create(dir.path().join("secret.txt")).unwrap();
        let instructions =
            reader::parse("FROM alpine\nCOPY secret.txt /secret.txt\n").unwrap();
        let stages = Stages::split(instructions).unwrap();
        let origin = RecipeOrigin::Local(dir.path().to_path_buf());
        let out = plan(
            &stages,
            &origin,
            BTreeMap::new(),
            &NoDependencies,
            &["secret.txt".to_owned()],
        )
        .await
        .unwrap();
        assert!(out.steps.is_empty());
        assert!(out.resources.is_empty());
    }

    #[test]
    fn negated_pattern_keeps_file() {
        assert!(!excluded("keep.txt", &["*.txt".into(), "!keep.txt".into()]));
        assert!(excluded("drop.txt", &["*.txt".into(), "!keep.txt".into()]));
    }

    #[tokio::test]
    async fn cross_stage_copy_uses_synthetic_identifier() {
        struct Fake;
        #[async_trait::async_trait]
        impl DependencyResolver for Fake {
            async fn resolve(
                &self,
                _stage_name: &str,
                _path: &str,
            ) -> std::result::Result<Vec<Resource>, Box<dyn std::error::Error + Send + Sync>>
            {
                Ok(Vec::new())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let instructions = reader::parse(
            "FROM golang AS builder\nRUN go build -o /out/app\nFROM alpine\nCOPY --from=builder /out/app /usr/bin/app\n",
        )
        .unwrap();
        let stages = Stages::split(instructions).unwrap();
        let origin = RecipeOrigin::Local(dir.path().to_path_buf());
        let out = plan(&stages, &origin, BTreeMap::new(), &Fake, &[])
            .await
            .unwrap();
        let PlanStep::Transfer { source_id, .. } = &out.steps[0] else {
            panic!("expected Transfer step")
        };
        assert_eq!(source_id, "builder:///out/app");
    }
}
