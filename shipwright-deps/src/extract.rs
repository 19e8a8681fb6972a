//! OCI layer extraction with whiteout handling.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

/// Extracts layer tarballs, in order, into a rootfs directory.
///
/// Handles OCI whiteout files:
/// - `.wh.<name>` — deletes the named entry from a lower layer.
/// - `.wh..wh..opq` — marks the directory as opaque (clears inherited contents).
///
/// Later layers win: each is extracted after the previous layer's whiteouts
/// have already been applied, so an overwritten path simply gets replaced.
pub fn extract_layers(layers: &[PathBuf], rootfs: &Path) -> crate::Result<()> {
    fs::create_dir_all(rootfs)?;
    for layer_path in layers {
        let file = fs::File::open(layer_path)?;
        if layer_path.extension().and_then(|e| e.to_str()) == Some("gz") {
            extract_layer(GzDecoder::new(file), rootfs)?;
        } else {
            extract_layer(file, rootfs)?;
        }
    }
    Ok(())
}

/// Extracts a single tar stream into `rootfs`, processing whiteout entries.
fn extract_layer(reader: impl Read, rootfs: &Path) -> crate::Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    for raw_entry in archive.entries()? {
        let mut entry = raw_entry?;
        let rel = entry.path()?.into_owned();

        let Some(file_name) = rel.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if file_name == ".wh..wh..opq" {
            if let Some(parent) = rel.parent() {
                let target = rootfs.join(parent);
                if target.exists() {
                    clear_directory(&target)?;
                }
            }
            continue;
        }

        if let Some(target_name) = file_name.strip_prefix(".wh.") {
            if let Some(parent) = rel.parent() {
                let target = rootfs.join(parent).join(target_name);
                if target.is_dir() {
                    fs::remove_dir_all(&target).ok();
                } else {
                    fs::remove_file(&target).ok();
                }
            }
            continue;
        }

        entry.unpack_in(rootfs)?;
    }

    Ok(())
}

/// Removes all contents of a directory without removing the directory itself.
fn clear_directory(dir: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tar::{Builder, Header};

    fn write_tar(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut builder = Builder::new(file);
        for (name, data) in entries {
            let mut header = Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn later_layer_overwrites_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let layer1 = dir.path().join("1.tar");
        let layer2 = dir.path().join("2.tar");
        write_tar(&layer1, &[("a.txt", b"old")]);
        write_tar(&layer2, &[("a.txt", b"new")]);

        let rootfs = dir.path().join("rootfs");
        extract_layers(&[layer1, layer2], &rootfs).unwrap();

        let mut contents = String::new();
        fs::File::open(rootfs.join("a.txt"))
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "new");
    }

    #[test]
    fn whiteout_removes_lower_layer_file() {
        let dir = tempfile::tempdir().unwrap();
        let layer1 = dir.path().join("1.tar");
        let layer2 = dir.path().join("2.tar");
        write_tar(&layer1, &[("a.txt", b"hi")]);
        write_tar(&layer2, &[(".wh.a.txt", b"")]);

        let rootfs = dir.path().join("rootfs");
        extract_layers(&[layer1, layer2], &rootfs).unwrap();

        assert!(!rootfs.join("a.txt").exists());
    }

    #[test]
    fn opaque_whiteout_clears_directory() {
        let dir = tempfile::tempdir().unwrap();
        let layer1 = dir.path().join("1.tar");
        let layer2 = dir.path().join("2.tar");
        write_tar(&layer1, &[("sub/a.txt", b"hi"), ("sub/b.txt", b"there")]);
        write_tar(&layer2, &[("sub/.wh..wh..opq", b""), ("sub/c.txt", b"new")]);

        let rootfs = dir.path().join("rootfs");
        extract_layers(&[layer1, layer2], &rootfs).unwrap();

        assert!(!rootfs.join("sub/a.txt").exists());
        assert!(!rootfs.join("sub/b.txt").exists());
        assert!(rootfs.join("sub/c.txt").exists());
    }
}
