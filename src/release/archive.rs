// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Archive extraction (zip, tar.gz, tar).
//!
//! The format is sniffed from the file's leading bytes, falling back to the
//! file name. Entries that would escape the destination directory are
//! rejected. On Unix every extracted regular file is made executable: release
//! zips do not reliably carry permission bits.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use flate2::read::GzDecoder;

use crate::error::{Result, WardenError};

/// Supported archive formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    Tar,
}

impl ArchiveFormat {
    /// Guess from the file name alone.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }

    /// Sniff from the first bytes of the file.
    pub fn from_magic(header: &[u8]) -> Option<Self> {
        if header.starts_with(b"PK\x03\x04") || header.starts_with(b"PK\x05\x06") {
            Some(ArchiveFormat::Zip)
        } else if header.starts_with(&[0x1f, 0x8b]) {
            Some(ArchiveFormat::TarGz)
        } else if header.len() >= 262 && &header[257..262] == b"ustar" {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }

    /// Sniff `path`, using `name_hint` when the content is inconclusive.
    pub fn detect(path: &Path, name_hint: &str) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| WardenError::io(format!("opening {}", path.display()), e))?;
        let mut header = [0u8; 512];
        let n = read_up_to(&mut file, &mut header)
            .map_err(|e| WardenError::io(format!("reading {}", path.display()), e))?;

        Self::from_magic(&header[..n])
            .or_else(|| Self::from_name(name_hint))
            .ok_or_else(|| WardenError::extraction(path, "unrecognized archive format"))
    }
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    file.seek(SeekFrom::Start(0))?;
    Ok(filled)
}

/// Extract `archive` into `dest` (created if missing).
pub fn extract(archive: &Path, format: ArchiveFormat, dest: &Path) -> Result<()> {
    tracing::debug!(
        archive = %archive.display(),
        dest = %dest.display(),
        ?format,
        "Extracting archive"
    );
    fs::create_dir_all(dest)
        .map_err(|e| WardenError::io(format!("creating {}", dest.display()), e))?;

    let file = File::open(archive)
        .map_err(|e| WardenError::io(format!("opening {}", archive.display()), e))?;

    match format {
        ArchiveFormat::Zip => extract_zip(archive, file, dest)?,
        ArchiveFormat::TarGz => unpack_tar(archive, GzDecoder::new(file), dest)?,
        ArchiveFormat::Tar => unpack_tar(archive, file, dest)?,
    }

    make_executable(dest)
        .map_err(|e| WardenError::io(format!("setting permissions under {}", dest.display()), e))
}

fn extract_zip(archive_path: &Path, file: File, dest: &Path) -> Result<()> {
    let mut zip = zip::ZipArchive::new(file).map_err(|e| WardenError::extraction(archive_path, e))?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| WardenError::extraction(archive_path, e))?;
        let relative = entry.enclosed_name().ok_or_else(|| {
            WardenError::extraction(
                archive_path,
                format!("entry {:?} escapes the extraction directory", entry.name()),
            )
        })?;
        let out_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)
                .map_err(|e| WardenError::io(format!("creating {}", out_path.display()), e))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| WardenError::io(format!("creating {}", parent.display()), e))?;
        }
        let mut out = File::create(&out_path)
            .map_err(|e| WardenError::io(format!("creating {}", out_path.display()), e))?;
        io::copy(&mut entry, &mut out).map_err(|e| WardenError::extraction(archive_path, e))?;
    }
    Ok(())
}

fn unpack_tar<R: Read>(archive_path: &Path, reader: R, dest: &Path) -> Result<()> {
    let mut tar = tar::Archive::new(reader);
    tar.set_preserve_permissions(true);
    // `unpack` refuses entries with `..` or absolute paths.
    tar.unpack(dest)
        .map_err(|e| WardenError::extraction(archive_path, e))
}

#[cfg(unix)]
fn make_executable(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = fs::symlink_metadata(&path)?;
        if meta.file_type().is_symlink() {
            continue;
        }
        if meta.is_dir() {
            make_executable(&path)?;
        } else {
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_dir: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    fn write_tar_gz(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let gz = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(gz);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_format_from_name() {
        assert_eq!(ArchiveFormat::from_name("a.ZIP"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::from_name("a.tar.gz"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_name("a.tgz"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_name("a.tar"), Some(ArchiveFormat::Tar));
        assert_eq!(ArchiveFormat::from_name("a.txt"), None);
    }

    #[test]
    fn test_magic_wins_over_name() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("download.bin");
        write_zip(&path, &[("build/bin/llama-server", b"#!/bin/sh\n")]);
        assert_eq!(ArchiveFormat::detect(&path, "misnamed.tar.gz").unwrap(), ArchiveFormat::Zip);
    }

    #[test]
    fn test_unknown_format_is_extraction_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("notes.txt");
        fs::write(&path, b"hello").unwrap();
        assert!(matches!(
            ArchiveFormat::detect(&path, "notes.txt"),
            Err(WardenError::Extraction { .. })
        ));
    }

    #[test]
    fn test_extract_zip_nested_layout() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("a.zip");
        write_zip(&archive, &[("build/bin/llama-server", b"bin"), ("build/bin/libggml.so", b"lib")]);

        let dest = tmp.path().join("out");
        extract(&archive, ArchiveFormat::Zip, &dest).unwrap();
        assert_eq!(fs::read(dest.join("build/bin/llama-server")).unwrap(), b"bin");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dest.join("build/bin/llama-server")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn test_extract_tar_gz() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("a.tar.gz");
        write_tar_gz(&archive, &[("llama-b1/llama-server", b"bin")]);

        let dest = tmp.path().join("out");
        let format = ArchiveFormat::detect(&archive, "a.tar.gz").unwrap();
        assert_eq!(format, ArchiveFormat::TarGz);
        extract(&archive, format, &dest).unwrap();
        assert_eq!(fs::read(dest.join("llama-b1/llama-server")).unwrap(), b"bin");
    }

    #[test]
    fn test_corrupt_zip_fails() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("bad.zip");
        fs::write(&archive, b"PK\x03\x04 definitely not a zip").unwrap();
        assert!(matches!(
            extract(&archive, ArchiveFormat::Zip, &tmp.path().join("out")),
            Err(WardenError::Extraction { .. })
        ));
    }
}
