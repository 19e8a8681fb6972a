//! Reconstructs a minimal recipe for one dependency stage and builds it with
//! the host container engine.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Deserialize;
use shipwright_recipe::{Stage, Stages};

use crate::store::Store;

/// Reconstructs a minimal, self-contained recipe text for `stage`.
///
/// Instructions are deduplicated by their verbatim original text (a stage
/// referenced from several `COPY --from=` sites reconstructs identically,
/// so the build cache keys collide and the stage builds once); the leading
/// `FROM` has its `AS <alias>` stripped since the reconstructed recipe is
/// single-stage.
#[must_use]
pub fn reconstruct_recipe(stage: &Stage, _stages: &Stages) -> String {
    let mut seen = std::collections::HashSet::new();
    let mut lines = Vec::with_capacity(stage.instructions.len());

    for (i, instruction) in stage.instructions.iter().enumerate() {
        let text = instruction.original();
        if !seen.insert(text.to_owned()) {
            continue;
        }
        if i == 0 {
            lines.push(strip_from_alias(text));
        } else {
            lines.push(text.to_owned());
        }
    }

    lines.join("\n") + "\n"
}

/// Removes a trailing ` AS <alias>` clause from a `FROM` line.
fn strip_from_alias(from_line: &str) -> String {
    match from_line.to_ascii_uppercase().find(" AS ") {
        Some(idx) => from_line[..idx].to_owned(),
        None => from_line.to_owned(),
    }
}

/// Builds `recipe_text` with `engine` (e.g. `docker`) and saves the result
/// to an image archive under `store`, keyed by `digest`. Returns the archive
/// path.
pub async fn build_and_save(
    engine: &str,
    recipe_text: &str,
    digest: &str,
    store: &Store,
) -> crate::Result<PathBuf> {
    let context = tempfile::tempdir().map_err(crate::Error::Io)?;
    let recipe_path = context.path().join("Dockerfile");
    tokio::fs::write(&recipe_path, recipe_text)
        .await
        .map_err(crate::Error::Io)?;

    let tag = format!("shipwright-dep-{}", digest.trim_start_matches("sha256:"));

    tracing::debug!(%tag, %engine, "building dependency stage");
    let build_output = tokio::process::Command::new(engine)
        .arg("build")
        .arg("--quiet")
        .arg("--tag")
        .arg(&tag)
        .arg("--file")
        .arg(&recipe_path)
        .arg(context.path())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(crate::Error::Io)?;

    if !build_output.status.success() {
        return Err(crate::Error::BuildFailed {
            stage: tag,
            message: String::from_utf8_lossy(&build_output.stderr).into_owned(),
        });
    }

    let save_path = store.save_path(digest);
    let save_status = tokio::process::Command::new(engine)
        .arg("save")
        .arg("--output")
        .arg(&save_path)
        .arg(&tag)
        .status()
        .await
        .map_err(crate::Error::Io)?;

    if !save_status.success() {
        return Err(crate::Error::ImageNotFound(tag));
    }

    Ok(save_path)
}

/// A `docker save` manifest entry: the ordered list of layer tar paths
/// (relative to the archive root) making up one image.
#[derive(Debug, Deserialize)]
struct ManifestEntry {
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Unpacks a `docker save` archive and returns its layers' tar paths, in
/// the order they must be applied (base layer first).
pub fn ordered_layer_paths(save_path: &Path) -> crate::Result<Vec<PathBuf>> {
    let extracted = save_path.with_extension("extracted");
    std::fs::create_dir_all(&extracted)?;

    let file = std::fs::File::open(save_path)?;
    let mut archive = tar::Archive::new(file);
    archive.unpack(&extracted)?;

    let manifest_text = std::fs::read_to_string(extracted.join("manifest.json"))?;
    let manifests: Vec<ManifestEntry> = serde_json::from_str(&manifest_text)?;
    let entry = manifests.into_iter().next().ok_or_else(|| {
        crate::Error::ImageNotFound(save_path.display().to_string())
    })?;

    Ok(entry
        .layers
        .into_iter()
        .map(|rel| extracted.join(rel))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipwright_recipe::reader;
    use shipwright_recipe::stage::Stages as RawStages;

    #[test]
    fn dedups_instructions_by_original_text() {
        let instructions = reader::parse(
            "FROM golang:1.22 AS builder\nRUN go build -o /out/app\nRUN go build -o /out/app\n",
        )
        .unwrap();
        let stages = RawStages::split(instructions).unwrap();
        let stage = stages.named_stage("builder").unwrap();
        let recipe = reconstruct_recipe(stage, &stages);
        assert_eq!(recipe.matches("RUN go build").count(), 1);
    }

    #[test]
    fn strips_as_alias_from_from_line() {
        assert_eq!(strip_from_alias("FROM golang:1.22 AS builder"), "FROM golang:1.22");
        assert_eq!(strip_from_alias("FROM alpine"), "FROM alpine");
    }
}
