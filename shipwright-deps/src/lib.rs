//! Dependency exporter for cross-stage `COPY --from=` in VM build recipes.
//!
//! Given a named build stage, reconstructs a minimal self-contained recipe
//! from its instructions, builds it with the host container engine, and
//! extracts only the paths later stages' `COPY --from=` reference. Built
//! images are cached on disk (keyed by the reconstructed recipe's content
//! digest) so a stage referenced by several `COPY`s is built once.
//!
//! # Architecture
//!
//! ```text
//! DepsExporter (implements shipwright_recipe::DependencyResolver)
//!  ├── build::build_stage   — reconstruct recipe, shell out to `docker build`
//!  ├── extract              — whiteout-aware layer extraction
//!  └── Store                — build cache + export root, keyed by digest
//! ```

mod build;
mod extract;
mod store;

use std::path::PathBuf;

use shipwright_recipe::{Resource, Stage, Stages};

pub use store::Store;

/// Result type for dependency export operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from reconstructing, building, or extracting a dependency stage.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The host container engine exited non-zero.
    #[error("build of stage {stage} failed: {message}")]
    BuildFailed {
        /// Name of the stage being built.
        stage: String,
        /// The engine's stderr tail or exit description.
        message: String,
    },

    /// The built image could not be found by the configured container engine.
    #[error("image not found after build: {0}")]
    ImageNotFound(String),

    /// A requested `COPY --from=` path is absent from the exported stage.
    #[error("path not present in stage {stage}: {path}")]
    PathNotPresent {
        /// Name of the stage exported.
        stage: String,
        /// The absolute path requested.
        path: String,
    },

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Malformed JSON in a saved image's manifest.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Configuration for [`DepsExporter`].
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Container engine binary to invoke (`docker`, `podman`, ...).
    pub engine: String,
    /// Root directory for the build cache and export root.
    pub cache_dir: PathBuf,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            engine: "docker".to_owned(),
            cache_dir: std::env::temp_dir().join("shipwright-deps"),
        }
    }
}

/// Builds and extracts named dependency stages on demand, implementing
/// [`shipwright_recipe::DependencyResolver`].
///
/// Holds the full stage graph so it can resolve a bare stage name (as seen
/// on `COPY --from=`) back to the [`Stage`] whose instructions it must
/// reconstruct and build.
#[derive(Debug)]
pub struct DepsExporter {
    engine: String,
    store: Store,
    stages: Stages,
}

impl DepsExporter {
    /// Opens an exporter rooted at `config.cache_dir`, resolving dependency
    /// stages out of `stages`.
    pub fn open(config: ExporterConfig, stages: Stages) -> Result<Self> {
        Ok(Self {
            engine: config.engine,
            store: Store::open(&config.cache_dir)?,
            stages,
        })
    }

    /// Builds `stage` (if not already cached) and extracts `path` from it.
    ///
    /// `path` may name a single file or a directory; directories yield one
    /// [`Resource`] per file found under them, never an entry for the
    /// directory node itself.
    pub async fn export(&self, stage: &Stage, path: &str) -> Result<Vec<Resource>> {
        let recipe_text = build::reconstruct_recipe(stage, &self.stages);
        let digest = store::content_digest(recipe_text.as_bytes());
        let stage_name = stage.name.clone().unwrap_or_else(|| stage.index.to_string());

        let rootfs = self.store.rootfs_path(&digest);
        if !rootfs.is_dir() {
            let save_path = build::build_and_save(&self.engine, &recipe_text, &digest, &self.store)
                .await
                .map_err(|e| Error::BuildFailed {
                    stage: stage_name.clone(),
                    message: e.to_string(),
                })?;

            let layers = build::ordered_layer_paths(&save_path)?;
            tokio::task::spawn_blocking({
                let rootfs = rootfs.clone();
                move || extract::extract_layers(&layers, &rootfs)
            })
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))??;
        }

        export_path(&rootfs, path, &self.store.export_root(&digest), &stage_name)
    }
}

#[async_trait::async_trait]
impl shipwright_recipe::DependencyResolver for DepsExporter {
    async fn resolve(
        &self,
        stage_name: &str,
        path: &str,
    ) -> std::result::Result<Vec<Resource>, Box<dyn std::error::Error + Send + Sync>> {
        let stage = self
            .stages
            .named_stage(stage_name)
            .ok_or_else(|| format!("no such stage: {stage_name}"))?;
        self.export(stage, path).await.map_err(Into::into)
    }
}

/// Copies `path` (file or directory) out of `rootfs` into `export_root`,
/// returning resolved resources for it.
fn export_path(
    rootfs: &std::path::Path,
    path: &str,
    export_root: &std::path::Path,
    stage_name: &str,
) -> Result<Vec<Resource>> {
    let relative = path.trim_start_matches('/');
    let source = rootfs.join(relative);
    if !source.exists() {
        return Err(Error::PathNotPresent {
            stage: stage_name.to_owned(),
            path: path.to_owned(),
        });
    }

    std::fs::create_dir_all(export_root)?;
    let mut resources = Vec::new();
    copy_into_export(&source, &source, export_root, &mut resources)?;
    Ok(resources)
}

/// Recursively copies `entry` (relative to `root`) into `export_root`,
/// appending one [`Resource`] per regular file.
fn copy_into_export(
    root: &std::path::Path,
    entry: &std::path::Path,
    export_root: &std::path::Path,
    out: &mut Vec<Resource>,
) -> Result<()> {
    if entry.is_dir() {
        for child in std::fs::read_dir(entry)? {
            let child = child?.path();
            copy_into_export(root, &child, export_root, out)?;
        }
        return Ok(());
    }

    let relative_target = entry.strip_prefix(root).unwrap_or(entry);
    let dest = export_root.join(relative_target);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(entry, &dest)?;
    out.push(Resource {
        origin: shipwright_recipe::Origin::LocalFile(dest),
        relative_target: relative_target.to_path_buf(),
        mode: file_mode(entry),
    });
    Ok(())
}

#[cfg(unix)]
fn file_mode(path: &std::path::Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).ok().map(|m| m.permissions().mode())
}

#[cfg(not(unix))]
fn file_mode(_path: &std::path::Path) -> Option<u32> {
    None
}
