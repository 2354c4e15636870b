//! Layer extraction.
//!
//! Applies OCI layers in order onto a directory, honouring whiteouts, so the
//! directory ends up holding the image's flattened filesystem.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use thiserror::Error;
use tracing::{debug, warn};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Errors from layer extraction.
#[derive(Debug, Error)]
pub enum UnpackError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Layer {layer} could not be unpacked: {source}")]
    Layer {
        layer: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Unpack `layers` in order into `dest`.
pub fn unpack_layers(layers: &[PathBuf], dest: &Path) -> Result<(), UnpackError> {
    fs::create_dir_all(dest)?;

    for (i, layer) in layers.iter().enumerate() {
        debug!(layer = i, path = %layer.display(), "Unpacking layer");
        unpack_layer(layer, dest).map_err(|source| UnpackError::Layer {
            layer: layer.clone(),
            source,
        })?;
    }

    Ok(())
}

/// Unpack a single gzipped or plain tar layer.
fn unpack_layer(layer_path: &Path, dest: &Path) -> io::Result<()> {
    let file = File::open(layer_path)?;
    let reader = BufReader::new(file);

    // Try gzip first, fall back to raw tar
    if is_gzip(layer_path)? {
        let mut archive = Archive::new(GzDecoder::new(reader));
        extract_archive(&mut archive, dest)
    } else {
        let mut archive = Archive::new(reader);
        extract_archive(&mut archive, dest)
    }
}

/// Extract a tar archive handling whiteouts.
fn extract_archive<R: Read>(archive: &mut Archive<R>, dest: &Path) -> io::Result<()> {
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        // Check for path traversal
        if path.components().any(|c| c == Component::ParentDir) {
            warn!(path = %path.display(), "Skipping path with parent directory");
            continue;
        }

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let parent = relative(path.parent().unwrap_or(Path::new("")));

        if file_name == OPAQUE_WHITEOUT || file_name.starts_with(WHITEOUT_PREFIX) {
            apply_whiteout(dest, &parent, file_name)?;
            continue;
        }

        if !entry.unpack_in(dest)? {
            warn!(path = %path.display(), "Skipping entry outside destination");
        }
    }

    Ok(())
}

/// Strip root and prefix components so the path joins under the destination.
fn relative(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

/// Remove what a whiteout entry in `parent` hides from lower layers.
fn apply_whiteout(dest: &Path, parent: &Path, file_name: &str) -> io::Result<()> {
    let Some(dir) = contained_dir(dest, parent) else {
        return Ok(());
    };

    if file_name == OPAQUE_WHITEOUT {
        // Opaque whiteout - hide everything lower layers put in this directory
        for child in fs::read_dir(&dir)? {
            remove_path(&child?.path());
        }
    } else if let Some(target_name) = file_name.strip_prefix(WHITEOUT_PREFIX) {
        remove_path(&dir.join(target_name));
    }

    Ok(())
}

/// `dest/parent` if every component below `dest` is a real directory.
///
/// Symlinks left by lower layers are not followed, so a whiteout can only
/// remove entries inside `dest`.
fn contained_dir(dest: &Path, parent: &Path) -> Option<PathBuf> {
    let mut dir = dest.to_path_buf();

    for component in parent.components() {
        dir.push(component);
        match fs::symlink_metadata(&dir) {
            Ok(meta) if meta.file_type().is_symlink() => {
                warn!(path = %dir.display(), "Skipping whiteout below symlink");
                return None;
            }
            Ok(meta) if meta.is_dir() => {}
            // Nothing below a missing or non-directory parent to remove
            _ => return None,
        }
    }

    Some(dir)
}

/// Remove a file, symlink or directory tree without following symlinks.
fn remove_path(path: &Path) {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Failed to apply whiteout");
    }
}

/// Check if a file is gzip compressed.
fn is_gzip(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    if file.read_exact(&mut magic).is_ok() {
        Ok(magic == [0x1f, 0x8b])
    } else {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    use super::*;

    fn tar_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *contents).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn write_layer(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_unpack_plain_and_gzip_layers() {
        let temp = TempDir::new().unwrap();
        let plain = write_layer(
            temp.path(),
            "l1.tar",
            &tar_bytes(&[("index.html", b"<h1>hi</h1>"), ("css/site.css", b"body{}")]),
        );

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&tar_bytes(&[("about.html", b"about")]))
            .unwrap();
        let gzip = write_layer(temp.path(), "l2.tar.gz", &encoder.finish().unwrap());

        let rootfs = temp.path().join("rootfs");
        unpack_layers(&[plain, gzip], &rootfs).unwrap();

        assert_eq!(
            fs::read_to_string(rootfs.join("index.html")).unwrap(),
            "<h1>hi</h1>"
        );
        assert_eq!(
            fs::read_to_string(rootfs.join("css/site.css")).unwrap(),
            "body{}"
        );
        assert_eq!(fs::read_to_string(rootfs.join("about.html")).unwrap(), "about");
    }

    #[test]
    fn test_whiteouts_remove_lower_layer_files() {
        let temp = TempDir::new().unwrap();
        let lower = write_layer(
            temp.path(),
            "lower.tar",
            &tar_bytes(&[
                ("keep.html", b"keep"),
                ("old.html", b"old"),
                ("assets/a.js", b"a"),
                ("assets/b.js", b"b"),
            ]),
        );
        let upper = write_layer(
            temp.path(),
            "upper.tar",
            &tar_bytes(&[
                (".wh.old.html", b""),
                ("assets/.wh..wh..opq", b""),
                ("assets/c.js", b"c"),
            ]),
        );

        let rootfs = temp.path().join("rootfs");
        unpack_layers(&[lower, upper], &rootfs).unwrap();

        assert!(rootfs.join("keep.html").exists());
        assert!(!rootfs.join("old.html").exists());
        assert!(!rootfs.join(".wh.old.html").exists());
        assert!(!rootfs.join("assets/a.js").exists());
        assert!(!rootfs.join("assets/b.js").exists());
        assert!(rootfs.join("assets/c.js").exists());
    }

    fn tar_with_links(files: &[(&str, &[u8])], links: &[(&str, &Path)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, target) in links {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            builder.append_link(&mut header, path, target).unwrap();
        }
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *contents).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn test_whiteouts_do_not_follow_symlinks_out_of_rootfs() {
        let temp = TempDir::new().unwrap();
        let outside = temp.path().join("outside");
        let other = temp.path().join("other");
        fs::create_dir_all(outside.join("nested")).unwrap();
        fs::write(outside.join("victim-a"), "a").unwrap();
        fs::write(outside.join("nested/victim-b"), "b").unwrap();
        fs::create_dir_all(&other).unwrap();
        fs::write(other.join("victim-c"), "c").unwrap();

        let lower = write_layer(
            temp.path(),
            "lower.tar",
            &tar_with_links(
                &[("real/keep.html", b"keep")],
                &[
                    ("assets", outside.as_path()),
                    ("docs", other.as_path()),
                    ("real/link", outside.as_path()),
                ],
            ),
        );
        let upper = write_layer(
            temp.path(),
            "upper.tar",
            &tar_bytes(&[
                ("assets/.wh..wh..opq", b""),
                ("docs/.wh.victim-c", b""),
                ("real/link/.wh.victim-a", b""),
                (".wh.missing", b""),
            ]),
        );

        let rootfs = temp.path().join("rootfs");
        unpack_layers(&[lower, upper], &rootfs).unwrap();

        assert_eq!(fs::read_dir(&outside).unwrap().count(), 2);
        assert!(outside.join("victim-a").exists());
        assert!(outside.join("nested/victim-b").exists());
        assert!(other.join("victim-c").exists());
        assert!(rootfs.join("real/keep.html").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_whiteout_removes_symlink_itself() {
        let temp = TempDir::new().unwrap();
        let outside = temp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("victim"), "v").unwrap();

        let lower = write_layer(
            temp.path(),
            "lower.tar",
            &tar_with_links(&[], &[("assets", outside.as_path())]),
        );
        let upper = write_layer(temp.path(), "upper.tar", &tar_bytes(&[(".wh.assets", b"")]));

        let rootfs = temp.path().join("rootfs");
        unpack_layers(&[lower, upper], &rootfs).unwrap();

        assert!(fs::symlink_metadata(rootfs.join("assets")).is_err());
        assert!(outside.join("victim").exists());
    }

    #[test]
    fn test_missing_layer_is_an_error() {
        let temp = TempDir::new().unwrap();
        let err = unpack_layers(&[temp.path().join("nope.tar")], &temp.path().join("rootfs"))
            .unwrap_err();
        assert!(matches!(err, UnpackError::Layer { .. }));
    }
}
