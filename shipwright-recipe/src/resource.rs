//! Resource resolution (C4): turning an `ADD`/`COPY` source token into one or
//! more openable content streams.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{Error, ResolveError, Result};

/// A single resolved source: a file (or, for directories, one of its
/// descendants) that will be written to some `target` path in the image.
#[derive(Debug, Clone)]
pub struct Resource {
    /// Where this resource's bytes come from.
    pub origin: Origin,
    /// Path relative to the original `ADD`/`COPY` target, used to rebuild
    /// directory structure when a source resolves to many files.
    pub relative_target: PathBuf,
    /// Permission bits to apply, if the source is a regular local file.
    pub mode: Option<u32>,
}

/// Where a [`Resource`]'s bytes originate.
#[derive(Debug, Clone)]
pub enum Origin {
    /// A regular file already present on the local filesystem.
    LocalFile(PathBuf),
    /// An `http://`/`https://` URL, fetched lazily.
    Remote(String),
}

/// Where the recipe being evaluated was itself read from, needed to anchor a
/// relative `ADD`/`COPY` source (spec.md's Resource Resolver rule 1: a
/// relative source in an http(s)-fetched recipe resolves against
/// `dirname(original)`, not the working directory).
#[derive(Debug, Clone)]
pub enum RecipeOrigin {
    /// The recipe was read from a local directory; relative sources resolve
    /// against it.
    Local(PathBuf),
    /// The recipe was fetched from this `http(s)://` URL; relative sources
    /// resolve against its dirname.
    Http(String),
}

impl Resource {
    /// Opens this resource for reading.
    ///
    /// Local files are opened directly; remote resources are fetched in
    /// full. Both return a [`Read`]-capable stream as spec.md's `Opener`
    /// abstraction only guarantees this much to the planner and guest.
    pub fn open(&self) -> Result<Box<dyn Read>> {
        match &self.origin {
            Origin::LocalFile(path) => {
                let file = fs::File::open(path).map_err(Error::Io)?;
                Ok(Box::new(file))
            }
            Origin::Remote(url) => {
                let resp = reqwest::blocking::get(url)
                    .map_err(|e| Error::InvalidSource(format!("fetching {url}: {e}")))?;
                let status = resp.status();
                if !status.is_success() {
                    return Err(Error::Resolve(ResolveError::HttpError {
                        url: url.clone(),
                        status: status.as_u16(),
                    }));
                }
                let bytes = resp
                    .bytes()
                    .map_err(|e| Error::InvalidSource(format!("reading body of {url}: {e}")))?;
                Ok(Box::new(std::io::Cursor::new(bytes.to_vec())))
            }
        }
    }
}

/// Resolves an `ADD`/`COPY` `source` token against `origin` (where the
/// recipe itself was read from).
///
/// - `http://`/`https://` sources always resolve to a single
///   [`Origin::Remote`] with mode `0644` (rule 2).
/// - A relative source in an `http(s)://`-originated recipe resolves to
///   `dirname(origin)/source`, also a single `Origin::Remote` with mode
///   `0644` (rule 1); a `source` that escapes the origin's directory via
///   `../` is rejected.
/// - Otherwise `source` is glob-expanded against `origin`'s local directory;
///   each match that is a directory is walked recursively, producing one
///   `Resource` per regular file found, each carrying a `relative_target`
///   rebuilding the directory's structure under the `ADD`/`COPY` target. A
///   resolved path that would escape the directory is rejected.
pub fn resolve(source: &str, origin: &RecipeOrigin) -> Result<Vec<Resource>> {
    if source.is_empty() {
        return Err(Error::Resolve(ResolveError::EmptySource(source.to_owned())));
    }

    if source.starts_with("http://") || source.starts_with("https://") {
        return Ok(vec![Resource {
            origin: Origin::Remote(source.to_owned()),
            relative_target: PathBuf::new(),
            mode: Some(0o644),
        }]);
    }

    let recipe_parent = match origin {
        RecipeOrigin::Http(original_url) => {
            let url = join_url(original_url, source)?;
            return Ok(vec![Resource {
                origin: Origin::Remote(url),
                relative_target: PathBuf::new(),
                mode: Some(0o644),
            }]);
        }
        RecipeOrigin::Local(parent) => parent,
    };

    let pattern = if Path::new(source).is_absolute() {
        source.to_owned()
    } else {
        recipe_parent.join(source).to_string_lossy().into_owned()
    };

    let mut resources = Vec::new();
    let entries = glob::glob(&pattern)
        .map_err(|e| Error::Resolve(ResolveError::NotFound(format!("{source}: {e}"))))?;

    for entry in entries {
        let path = entry.map_err(|e| Error::Resolve(ResolveError::NotFound(format!("{source}: {e}"))))?;
        reject_traversal(&path, recipe_parent)?;

        if path.is_dir() {
            walk_dir(&path, &path, &mut resources)?;
        } else {
            let mode = file_mode(&path);
            resources.push(Resource {
                origin: Origin::LocalFile(path),
                relative_target: PathBuf::new(),
                mode,
            });
        }
    }

    if resources.is_empty() {
        return Err(Error::Resolve(ResolveError::NotFound(source.to_owned())));
    }

    Ok(resources)
}

/// Joins a relative `source` onto `dirname(original_url)`, rejecting any
/// `../` that would walk above the directory `original_url` itself lives in.
fn join_url(original_url: &str, source: &str) -> Result<String> {
    let (prefix, path) = split_url(original_url);
    let mut components: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    components.pop(); // drop the recipe file's own name, leaving its directory.

    for part in source.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if components.pop().is_none() {
                    return Err(Error::Resolve(ResolveError::Traversal(source.to_owned())));
                }
            }
            _ => components.push(part),
        }
    }

    Ok(format!("{prefix}/{}", components.join("/")))
}

/// Splits `url` into its `scheme://host` prefix and `/`-rooted path.
fn split_url(url: &str) -> (&str, &str) {
    let after_scheme = url.find("://").map_or(0, |i| i + 3);
    let path_start = url[after_scheme..]
        .find('/')
        .map_or(url.len(), |i| after_scheme + i);
    (&url[..path_start], &url[path_start..])
}

/// Recursively walks `dir`, pushing one [`Resource`] per regular file found,
/// each carrying its path relative to `root` as `relative_target`.
fn walk_dir(root: &Path, dir: &Path, out: &mut Vec<Resource>) -> Result<()> {
    for entry in fs::read_dir(dir).map_err(Error::Io)? {
        let entry = entry.map_err(Error::Io)?;
        let path = entry.path();
        if path.is_dir() {
            walk_dir(root, &path, out)?;
        } else {
            let relative_target = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_path_buf();
            out.push(Resource {
                mode: file_mode(&path),
                origin: Origin::LocalFile(path),
                relative_target,
            });
        }
    }
    Ok(())
}

/// Rejects a resolved path that escapes `recipe_parent`.
fn reject_traversal(path: &Path, recipe_parent: &Path) -> Result<()> {
    let canonical_parent = fs::canonicalize(recipe_parent).map_err(Error::Io)?;
    let canonical_path = fs::canonicalize(path).map_err(Error::Io)?;
    if !canonical_path.starts_with(&canonical_parent) {
        return Err(Error::Resolve(ResolveError::Traversal(
            path.display().to_string(),
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).ok().map(|m| m.permissions().mode())
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Option<u32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn local(dir: &Path) -> RecipeOrigin {
        RecipeOrigin::Local(dir.to_path_buf())
    }

    #[test]
    fn resolves_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.txt");
        fs::File::create(&file_path).unwrap().write_all(b"hi").unwrap();

        let resources = resolve("a.txt", &local(dir.path())).unwrap();
        assert_eq!(resources.len(), 1);
        assert!(matches!(resources[0].origin, Origin::LocalFile(_)));
    }

    #[test]
    fn resolves_directory_recursively() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::File::create(dir.path().join("root.txt")).unwrap().write_all(b"a").unwrap();
        fs::File::create(dir.path().join("sub/child.txt")).unwrap().write_all(b"b").unwrap();

        let resources = resolve("./", &local(dir.path())).unwrap();
        assert_eq!(resources.len(), 2);
    }

    #[test]
    fn rejects_traversal_outside_recipe_parent() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs::File::create(outside.path().join("secret.txt")).unwrap();

        let rel = pathdiff(outside.path().join("secret.txt").as_path(), dir.path());
        let err = resolve(&rel, &local(dir.path())).unwrap_err();
        assert!(matches!(err, Error::Resolve(ResolveError::Traversal(_))));
    }

    #[test]
    fn missing_source_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve("nope.txt", &local(dir.path())).unwrap_err();
        assert!(matches!(err, Error::Resolve(ResolveError::NotFound(_))));
    }

    #[test]
    fn empty_source_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve("", &local(dir.path())).unwrap_err();
        assert!(matches!(err, Error::Resolve(ResolveError::EmptySource(_))));
    }

    #[test]
    fn http_source_is_remote_with_standard_mode() {
        let origin = RecipeOrigin::Http("https://example.com/recipes/Dockerfile".to_owned());
        let resources = resolve("https://cdn.example.com/app.bin", &origin).unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].mode, Some(0o644));
        assert!(matches!(&resources[0].origin, Origin::Remote(u) if u == "https://cdn.example.com/app.bin"));
    }

    #[test]
    fn relative_source_in_http_recipe_resolves_against_recipe_dirname() {
        let origin = RecipeOrigin::Http("https://example.com/recipes/sub/Dockerfile".to_owned());
        let resources = resolve("app.bin", &origin).unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].mode, Some(0o644));
        assert!(matches!(
            &resources[0].origin,
            Origin::Remote(u) if u == "https://example.com/recipes/sub/app.bin"
        ));
    }

    #[test]
    fn relative_source_in_http_recipe_rejects_traversal_above_dirname() {
        let origin = RecipeOrigin::Http("https://example.com/recipes/Dockerfile".to_owned());
        let err = resolve("../../etc/passwd", &origin).unwrap_err();
        assert!(matches!(err, Error::Resolve(ResolveError::Traversal(_))));
    }

    /// A minimal relative-path builder sufficient for the traversal test.
    fn pathdiff(target: &Path, from: &Path) -> String {
        format!("../{}", target.strip_prefix(from.parent().unwrap()).unwrap().display())
    }
}
