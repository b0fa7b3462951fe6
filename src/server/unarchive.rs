use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::server::filesystem::{resolve_safe, Filesystem};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const USTAR_MAGIC: &[u8; 5] = b"ustar";
const USTAR_OFFSET: u64 = 257;

enum ArchiveFormat {
    Tar,
    TarGz,
}

impl Filesystem {
    /// Whether decompressing the named archive would keep the server inside
    /// its disk quota. Servers without a quota are always allowed. The
    /// current usage (cache permitted) and the archive's total uncompressed
    /// size are computed concurrently, so the answer costs the slower of the
    /// two rather than their sum.
    pub async fn space_available_for_decompression(&self, dir: &str, file: &str) -> Result<bool> {
        if self.disk_limit() <= 0 {
            return Ok(true);
        }

        let source = self.safe_path(Path::new(dir).join(file))?;

        let walk = tokio::task::spawn_blocking(move || archive_total_size(&source));
        let (usage, walked) = tokio::join!(self.cached_usage(true), walk);

        let usage = usage?;
        let total = walked.map_err(|e| Error::Io(std::io::Error::other(e)))??;

        Ok((usage + total) / 1_000_000 <= self.disk_limit())
    }

    /// Extracts an archive into `dir`, inferring the container format from
    /// the file header. Every entry lands through the path containment
    /// proof; an entry whose declared target escapes the data root aborts
    /// the extraction with `ZipSlip`. Partial extraction is not rolled back;
    /// the caller decides whether to quarantine or delete what landed.
    pub async fn decompress_file(&self, dir: &str, file: &str) -> Result<()> {
        if !self.space_available_for_decompression(dir, file).await? {
            return Err(Error::QuotaExceeded);
        }

        let source = self.safe_path(Path::new(dir).join(file))?;
        std::fs::metadata(&source)?;

        let root = self.root().to_path_buf();
        let server_id = self.server_id();
        let dir = dir.to_string();

        tokio::task::spawn_blocking(move || extract_archive(&root, server_id, &dir, &source))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }
}

fn extract_archive(root: &Path, server_id: Uuid, dir: &str, source: &Path) -> Result<()> {
    let file = File::open(source)?;

    let reader: Box<dyn Read> = match detect_format(&file)? {
        ArchiveFormat::TarGz => Box::new(GzDecoder::new(file)),
        ArchiveFormat::Tar => Box::new(file),
    };

    let mut archive = Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let kind = entry.header().entry_type();

        if kind.is_dir() {
            continue;
        }

        let name: PathBuf = entry.path()?.into_owned();
        let destination = match resolve_safe(root, &Path::new(dir).join(&name)) {
            Ok(p) => p,
            Err(Error::BadPathResolution { .. }) => {
                return Err(Error::ZipSlip {
                    entry: name.display().to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        // Links and special files are not materialized; only regular file
        // contents are written into the data directory.
        if !kind.is_file() {
            debug!(server = %server_id, entry = %name.display(), "skipping non-regular archive entry");
            continue;
        }

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut out = File::create(&destination)?;
        std::io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Ok(mode) = entry.header().mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&destination, std::fs::Permissions::from_mode(mode & 0o777))?;
        }
    }

    Ok(())
}

fn detect_format(file: &File) -> Result<ArchiveFormat> {
    let mut file = file;

    let mut magic = [0u8; 2];
    file.seek(SeekFrom::Start(0))?;
    if file.read(&mut magic)? == 2 && magic == GZIP_MAGIC {
        file.seek(SeekFrom::Start(0))?;
        return Ok(ArchiveFormat::TarGz);
    }

    let mut ustar = [0u8; 5];
    file.seek(SeekFrom::Start(USTAR_OFFSET))?;
    if file.read(&mut ustar)? == 5 && &ustar == USTAR_MAGIC {
        file.seek(SeekFrom::Start(0))?;
        return Ok(ArchiveFormat::Tar);
    }

    Err(Error::Validation(
        "unrecognized archive format, expected tar or tar.gz".to_string(),
    ))
}

/// Sum of the declared uncompressed sizes of every entry in the archive.
fn archive_total_size(source: &Path) -> Result<i64> {
    let file = File::open(source)?;

    let reader: Box<dyn Read> = match detect_format(&file)? {
        ArchiveFormat::TarGz => Box::new(GzDecoder::new(file)),
        ArchiveFormat::Tar => Box::new(file),
    };

    let mut archive = Archive::new(reader);
    let mut total: i64 = 0;
    for entry in archive.entries()? {
        let entry = entry?;
        total += entry.header().size().unwrap_or(0) as i64;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn write_tar(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(file);

        for (name, data) in entries {
            let mut header = tar::Header::new_ustar();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }

        builder.finish().unwrap();
    }

    fn write_tar_with_escape(path: &Path) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(file);

        // tar::Builder refuses ".." in append_data paths, so forge the
        // header the way a hostile archive would.
        let data = b"root::0:0::/root:/bin/bash";
        let mut header = tar::Header::new_gnu();
        {
            let gnu = header.as_gnu_mut().unwrap();
            let name = b"../../etc/passwd";
            gnu.name[..name.len()].copy_from_slice(name);
        }
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, &data[..]).unwrap();

        builder.finish().unwrap();
    }

    fn guard(root: &Path, quota_mb: i64) -> Filesystem {
        Filesystem::new(Uuid::new_v4(), root, quota_mb, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn extracts_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
        write_tar(
            &dir.path().join("uploads/world.tar"),
            &[
                ("world/level.dat", b"level data"),
                ("server.properties", b"motd=hi"),
            ],
        );

        let fs = guard(dir.path(), 0);
        fs.decompress_file("uploads", "world.tar").await.unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("uploads/world/level.dat")).unwrap(),
            b"level data"
        );
        assert_eq!(
            std::fs::read(dir.path().join("uploads/server.properties")).unwrap(),
            b"motd=hi"
        );
    }

    #[tokio::test]
    async fn refuses_zip_slip_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
        write_tar_with_escape(&dir.path().join("uploads/evil.tar"));

        let fs = guard(dir.path(), 0);
        let err = fs.decompress_file("uploads", "evil.tar").await.unwrap_err();

        assert!(matches!(err, Error::ZipSlip { .. }));
        assert!(!dir.path().join("../etc/passwd").exists());
    }

    #[tokio::test]
    async fn preflight_allows_unlimited_servers() {
        let dir = tempfile::tempdir().unwrap();
        let fs = guard(dir.path(), 0);

        // No quota: the archive does not even need to exist.
        assert!(fs
            .space_available_for_decompression("uploads", "missing.tar")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn preflight_blocks_archives_over_quota() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();

        // 60 MB on disk already.
        std::fs::write(dir.path().join("existing.bin"), vec![0u8; 60_000_000]).unwrap();

        // An archive that expands to ~50 MB.
        let payload = vec![0u8; 50_000_000];
        write_tar(
            &dir.path().join("uploads/big.tar"),
            &[("big.bin", payload.as_slice())],
        );

        let fs = guard(dir.path(), 100);
        assert!(!fs
            .space_available_for_decompression("uploads", "big.tar")
            .await
            .unwrap());

        let err = fs.decompress_file("uploads", "big.tar").await.unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded));
    }

    #[tokio::test]
    async fn preflight_allows_archives_within_quota() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
        write_tar(&dir.path().join("uploads/small.tar"), &[("a.txt", b"hello")]);

        let fs = guard(dir.path(), 100);
        assert!(fs
            .space_available_for_decompression("uploads", "small.tar")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn handles_gzip_compressed_tars() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();

        let tar_path = dir.path().join("plain.tar");
        write_tar(&tar_path, &[("hello.txt", b"compressed")]);
        let raw = std::fs::read(&tar_path).unwrap();
        std::fs::remove_file(&tar_path).unwrap();

        let gz = File::create(dir.path().join("uploads/world.tar.gz")).unwrap();
        let mut encoder = flate2::write::GzEncoder::new(gz, flate2::Compression::default());
        std::io::Write::write_all(&mut encoder, &raw).unwrap();
        encoder.finish().unwrap();

        let fs = guard(dir.path(), 0);
        fs.decompress_file("uploads", "world.tar.gz").await.unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("uploads/hello.txt")).unwrap(),
            b"compressed"
        );
    }

    #[tokio::test]
    async fn rejects_unknown_formats() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"not an archive").unwrap();

        let fs = guard(dir.path(), 0);
        let err = fs.decompress_file(".", "notes.txt").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
