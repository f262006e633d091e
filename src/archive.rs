use std::{
    io::{self, BufRead, BufReader, Read, Write},
    path::{Component, Path, PathBuf},
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use log::trace;
use tar::{Archive, Builder, EntryType, Header};
use thiserror::Error;
use walkdir::WalkDir;

/// Every packed entry lives under this directory.
pub const PACKAGE_PREFIX: &str = "package";

/// 1985-10-26T08:15:00Z, the fixed mtime of packed entries.
const PACKED_MTIME: u64 = 499_162_500;

const EXCLUDED: [&str; 2] = [".git", "node_modules"];

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
    #[error("Refusing to extract {path}: it escapes the destination")]
    PathTraversal { path: String },
    #[error("Refusing to extract {path}: unsupported entry type {kind}")]
    UnsupportedEntry { path: String, kind: String },
}

/// Packs `dir` into a gzipped tarball written to `out`.
///
/// Output depends only on file names, contents and the executable bit, so
/// packing the same tree twice yields identical bytes.
pub fn pack_dir<W: Write>(dir: &Path, out: W) -> Result<W, ArchiveError> {
    let mut builder = Builder::new(GzEncoder::new(out, Compression::default()));
    builder.mode(tar::HeaderMode::Deterministic);

    let walker = WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !EXCLUDED
                    .iter()
                    .any(|excluded| entry.file_name() == *excluded)
        });

    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        let name = Path::new(PACKAGE_PREFIX).join(relative);
        let file_type = entry.file_type();

        let mut header = Header::new_gnu();
        header.set_mtime(PACKED_MTIME);
        header.set_uid(0);
        header.set_gid(0);
        if file_type.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            builder.append_data(&mut header, &name, io::empty())?;
        } else if file_type.is_file() {
            let metadata = entry.metadata().map_err(io::Error::from)?;
            header.set_entry_type(EntryType::Regular);
            header.set_mode(if is_executable(&metadata) { 0o755 } else { 0o644 });
            header.set_size(metadata.len());
            let file = std::fs::File::open(entry.path())?;
            builder.append_data(&mut header, &name, file)?;
        } else {
            trace!("Skipping {} while packing", entry.path().display());
        }
    }

    Ok(builder.into_inner()?.finish()?)
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

/// Extracts a tarball, gzipped or not, into `dest`, dropping the first path
/// component of every entry (`package/` or a forge's `owner-repo-sha/`).
pub fn extract<R: Read>(input: R, dest: &Path) -> Result<(), ArchiveError> {
    let mut input = BufReader::new(input);
    let gzipped = input.fill_buf()?.starts_with(&[0x1f, 0x8b]);
    if gzipped {
        unpack(Archive::new(GzDecoder::new(input)), dest)
    } else {
        unpack(Archive::new(input), dest)
    }
}

fn unpack<R: Read>(mut archive: Archive<R>, dest: &Path) -> Result<(), ArchiveError> {
    std::fs::create_dir_all(dest)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let kind = entry.header().entry_type();
        match kind {
            EntryType::Regular | EntryType::Directory => {}
            // Metadata entries carry no content of their own.
            EntryType::XGlobalHeader | EntryType::XHeader | EntryType::GNULongName => continue,
            // Packing drops links as well, so trees extracted here match.
            EntryType::Symlink | EntryType::Link => {
                trace!("Skipping link {} while extracting", path.display());
                continue;
            }
            _ => {
                return Err(ArchiveError::UnsupportedEntry {
                    path: path.display().to_string(),
                    kind: format!("{kind:?}"),
                })
            }
        }

        let Some(relative) = strip_first_component(&path)? else {
            continue;
        };
        let target = dest.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
    }
    Ok(())
}

fn strip_first_component(path: &Path) -> Result<Option<PathBuf>, ArchiveError> {
    let mut stripped = PathBuf::new();
    for (index, component) in path.components().enumerate() {
        match component {
            Component::Normal(part) if index > 0 => stripped.push(part),
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(ArchiveError::PathTraversal {
                    path: path.display().to_string(),
                })
            }
        }
    }
    Ok((!stripped.as_os_str().is_empty()).then_some(stripped))
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn sample_package(dir: &Path) {
        std::fs::create_dir_all(dir.join("lib")).unwrap();
        std::fs::create_dir_all(dir.join(".git/objects")).unwrap();
        std::fs::create_dir_all(dir.join("node_modules/dep")).unwrap();
        std::fs::write(dir.join("package.json"), r#"{"name":"a","version":"1.0.0"}"#).unwrap();
        std::fs::write(dir.join("lib/index.js"), "module.exports = 1").unwrap();
        std::fs::write(dir.join(".git/HEAD"), "ref").unwrap();
        std::fs::write(dir.join("node_modules/dep/index.js"), "x").unwrap();
    }

    fn entry_names(tarball: &[u8]) -> Vec<String> {
        let mut archive = Archive::new(GzDecoder::new(tarball));
        archive
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().path().unwrap().display().to_string())
            .collect()
    }

    #[test]
    fn pack_is_deterministic_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        sample_package(dir.path());

        let first = pack_dir(dir.path(), Vec::new()).unwrap();
        std::fs::write(dir.path().join("node_modules/dep/index.js"), "changed").unwrap();
        let second = pack_dir(dir.path(), Vec::new()).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            entry_names(&first),
            vec!["package/lib", "package/lib/index.js", "package/package.json"]
        );
    }

    #[test]
    fn extract_strips_top_directory() {
        let source = tempfile::tempdir().unwrap();
        sample_package(source.path());
        let tarball = pack_dir(source.path(), Vec::new()).unwrap();

        let dest = tempfile::tempdir().unwrap();
        extract(tarball.as_slice(), dest.path()).unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.path().join("lib/index.js")).unwrap(),
            "module.exports = 1"
        );
        assert!(dest.path().join("package.json").is_file());
    }

    #[test]
    fn extract_uncompressed() {
        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_size(2);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        builder
            .append_data(&mut header, "owner-repo-abc/file.txt", &b"hi"[..])
            .unwrap();
        let tarball = builder.into_inner().unwrap();

        let dest = tempfile::tempdir().unwrap();
        extract(tarball.as_slice(), dest.path()).unwrap();
        assert_eq!(std::fs::read_to_string(dest.path().join("file.txt")).unwrap(), "hi");
    }

    #[test]
    fn extract_skips_links() {
        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_size(6);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        builder
            .append_data(&mut header, "owner-repo-abc/README.md", &b"readme"[..])
            .unwrap();
        for (kind, name) in [
            (EntryType::Symlink, "owner-repo-abc/README"),
            (EntryType::Link, "owner-repo-abc/README.txt"),
        ] {
            let mut header = Header::new_gnu();
            header.set_size(0);
            header.set_mode(0o777);
            header.set_entry_type(kind);
            header.set_link_name("owner-repo-abc/README.md").unwrap();
            builder.append_data(&mut header, name, io::empty()).unwrap();
        }
        let tarball = builder.into_inner().unwrap();

        let dest = tempfile::tempdir().unwrap();
        extract(tarball.as_slice(), dest.path()).unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.path().join("README.md")).unwrap(),
            "readme"
        );
        assert!(std::fs::symlink_metadata(dest.path().join("README")).is_err());
        assert!(!dest.path().join("README.txt").exists());
    }

    #[test]
    fn reject_traversal() {
        assert!(matches!(
            strip_first_component(Path::new("package/../../etc/passwd")),
            Err(ArchiveError::PathTraversal { .. })
        ));
        assert_eq!(
            strip_first_component(Path::new("package/a/b")).unwrap(),
            Some(PathBuf::from("a/b"))
        );
        assert_eq!(strip_first_component(Path::new("package/")).unwrap(), None);
    }
}
