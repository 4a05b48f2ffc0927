//! Archive extraction
//!
//! Unpacks rootfs archives entry by entry, preserving POSIX mode bits and
//! symlinks. Every entry path is resolved lexically against the destination
//! root first; an entry that would land outside it aborts the extraction.
//! Symlink targets are written verbatim, so they resolve relative to the
//! link's parent directory once the tree is in place.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use super::InstallError;

/// Supported archive containers, selected by file name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    TarXz,
    Zip,
}

impl ArchiveFormat {
    pub fn from_name(name: &str) -> Option<ArchiveFormat> {
        let name = name.to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Some(ArchiveFormat::TarXz)
        } else if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TarGz => "tar+gzip",
            Self::TarXz => "tar+xz",
            Self::Zip => "zip",
        }
    }
}

/// Entry counts from a completed extraction
#[derive(Debug, Default, Clone, Copy)]
pub struct UnpackStats {
    pub dirs: usize,
    pub files: usize,
    pub symlinks: usize,
    pub skipped: usize,
}

/// Unpack an archive into `dest`, dispatching on the file name
pub fn unpack(archive: &Path, dest: &Path) -> Result<UnpackStats, InstallError> {
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let format = ArchiveFormat::from_name(name)
        .ok_or_else(|| InstallError::UnsupportedFormat(name.to_string()))?;

    log::debug!("unpacking {} ({}) into {}", name, format.as_str(), dest.display());

    let file = File::open(archive)?;
    match format {
        ArchiveFormat::TarGz => {
            unpack_tar(flate2::read::GzDecoder::new(BufReader::new(file)), dest)
        }
        ArchiveFormat::TarXz => {
            unpack_tar(xz2::read::XzDecoder::new(BufReader::new(file)), dest)
        }
        ArchiveFormat::Zip => unpack_zip(file, dest),
    }
}

/// Resolve an entry path lexically below `root`. Absolute paths and paths
/// whose parent components climb out of `root` are traversal violations.
fn entry_destination(root: &Path, raw: &Path) -> Result<PathBuf, InstallError> {
    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;

    for component in raw.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(InstallError::Traversal(raw.to_path_buf()));
                }
                resolved.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(InstallError::Traversal(raw.to_path_buf()));
            }
        }
    }

    Ok(resolved)
}

fn ensure_parent(target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn set_mode(target: &Path, mode: u32) -> io::Result<()> {
    fs::set_permissions(target, fs::Permissions::from_mode(mode & 0o7777))
}

fn unpack_tar<R: Read>(reader: R, dest: &Path) -> Result<UnpackStats, InstallError> {
    let mut archive = tar::Archive::new(reader);
    let mut stats = UnpackStats::default();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw = entry.path()?.into_owned();
        let target = entry_destination(dest, &raw)?;
        let mode = entry.header().mode().unwrap_or(0o644);

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                fs::create_dir_all(&target)?;
                set_mode(&target, mode)?;
                stats.dirs += 1;
            }
            tar::EntryType::Regular => {
                ensure_parent(&target)?;
                let mut out = File::create(&target)?;
                io::copy(&mut entry, &mut out)?;
                set_mode(&target, mode)?;
                stats.files += 1;
            }
            tar::EntryType::Symlink => {
                let link = entry
                    .link_name()?
                    .map(|l| l.into_owned())
                    .unwrap_or_default();
                ensure_parent(&target)?;
                let _ = fs::remove_file(&target);
                std::os::unix::fs::symlink(&link, &target)?;
                stats.symlinks += 1;
            }
            other => {
                log::warn!("skipping unsupported tar entry {} ({:?})", raw.display(), other);
                stats.skipped += 1;
            }
        }
    }

    Ok(stats)
}

fn unpack_zip(file: File, dest: &Path) -> Result<UnpackStats, InstallError> {
    let mut archive = zip::ZipArchive::new(BufReader::new(file))?;
    let mut stats = UnpackStats::default();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let raw = PathBuf::from(entry.name());
        let target = entry_destination(dest, &raw)?;
        let mode = entry.unix_mode();
        let is_symlink = mode.map(|m| m & 0o170000 == 0o120000).unwrap_or(false);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            if let Some(mode) = mode {
                set_mode(&target, mode)?;
            }
            stats.dirs += 1;
        } else if is_symlink {
            let mut link = String::new();
            entry.read_to_string(&mut link)?;
            ensure_parent(&target)?;
            let _ = fs::remove_file(&target);
            std::os::unix::fs::symlink(&link, &target)?;
            stats.symlinks += 1;
        } else {
            ensure_parent(&target)?;
            let mut out = File::create(&target)?;
            io::copy(&mut entry, &mut out)?;
            if let Some(mode) = mode {
                set_mode(&target, mode)?;
            }
            stats.files += 1;
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_format_from_name() {
        assert_eq!(ArchiveFormat::from_name("rootfs.tar.xz"), Some(ArchiveFormat::TarXz));
        assert_eq!(ArchiveFormat::from_name("rootfs.TAR.GZ"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_name("base.tgz"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_name("bootstrap.zip"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::from_name("rootfs.tar.zst"), None);
        assert_eq!(ArchiveFormat::from_name(""), None);
    }

    #[test]
    fn test_entry_destination_plain() {
        let root = Path::new("/tmp/stage");
        let resolved = entry_destination(root, Path::new("usr/bin/foo")).unwrap();
        assert_eq!(resolved, PathBuf::from("/tmp/stage/usr/bin/foo"));
    }

    #[test]
    fn test_entry_destination_dot_components() {
        let root = Path::new("/tmp/stage");
        let resolved = entry_destination(root, Path::new("./usr/./bin")).unwrap();
        assert_eq!(resolved, PathBuf::from("/tmp/stage/usr/bin"));
    }

    #[test]
    fn test_entry_destination_internal_parent() {
        let root = Path::new("/tmp/stage");
        let resolved = entry_destination(root, Path::new("usr/lib/../bin/foo")).unwrap();
        assert_eq!(resolved, PathBuf::from("/tmp/stage/usr/bin/foo"));
    }

    #[test]
    fn test_entry_destination_rejects_escape() {
        let root = Path::new("/tmp/stage");
        assert!(matches!(
            entry_destination(root, Path::new("../../etc/passwd")),
            Err(InstallError::Traversal(_))
        ));
        assert!(matches!(
            entry_destination(root, Path::new("usr/../../x")),
            Err(InstallError::Traversal(_))
        ));
    }

    #[test]
    fn test_entry_destination_rejects_absolute() {
        let root = Path::new("/tmp/stage");
        assert!(matches!(
            entry_destination(root, Path::new("/etc/passwd")),
            Err(InstallError::Traversal(_))
        ));
    }

    fn build_tar_gz(entries: &[(&str, &str)]) -> Vec<u8> {
        let encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for (path, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(content.len() as u64);
            header.set_mode(0o755);
            // set_path refuses `..`, so write the name bytes directly;
            // hostile paths must survive into the fixture
            header.as_old_mut().name[..path.len()].copy_from_slice(path.as_bytes());
            header.set_cksum();
            builder.append(&header, content.as_bytes()).unwrap();
        }

        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_unpack_preserves_mode() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("root.tar.gz");
        let dest = dir.path().join("out");
        fs::create_dir_all(&dest).unwrap();

        let data = build_tar_gz(&[("usr/bin/foo", "#!/bin/sh\n")]);
        let mut f = File::create(&archive_path).unwrap();
        f.write_all(&data).unwrap();

        let stats = unpack(&archive_path, &dest).unwrap();
        assert_eq!(stats.files, 1);

        let mode = fs::metadata(dest.join("usr/bin/foo")).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o755);
    }

    #[test]
    fn test_unpack_rejects_traversal_entry() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("evil.tar.gz");
        let dest = dir.path().join("out");
        fs::create_dir_all(&dest).unwrap();

        let data = build_tar_gz(&[("../../etc/passwd", "root::0:0::/:/bin/sh\n")]);
        let mut f = File::create(&archive_path).unwrap();
        f.write_all(&data).unwrap();

        assert!(matches!(unpack(&archive_path, &dest), Err(InstallError::Traversal(_))));
        // Nothing may have been written for the rejected entry
        assert!(!dir.path().join("etc/passwd").exists());
    }

    #[test]
    fn test_unpack_symlink_target_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("links.tar.gz");
        let dest = dir.path().join("out");
        fs::create_dir_all(&dest).unwrap();

        let encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_cksum();
        builder.append_link(&mut header, "bin/sh", "../usr/bin/dash").unwrap();
        let data = builder.into_inner().unwrap().finish().unwrap();
        fs::write(&archive_path, data).unwrap();

        let stats = unpack(&archive_path, &dest).unwrap();
        assert_eq!(stats.symlinks, 1);

        let link = fs::read_link(dest.join("bin/sh")).unwrap();
        assert_eq!(link, PathBuf::from("../usr/bin/dash"));
    }
}
