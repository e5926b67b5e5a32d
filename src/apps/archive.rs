use anyhow::{Context, Result};
use std::fs::File;
use std::path::Path;

/// Supported bundle formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    TarBz2,
    Zip,
}

impl ArchiveKind {
    /// Determine the format from a recorded hint ("tar.gz", "tgz", ...) or,
    /// failing that, the bundle filename.
    pub fn detect(name: &str, hint: Option<&str>) -> Option<Self> {
        if let Some(hint) = hint {
            if let Some(kind) = Self::from_extension(hint.trim().trim_start_matches('.')) {
                return Some(kind);
            }
        }
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if lower.ends_with(".tar.bz2") || lower.ends_with(".tbz2") {
            Some(ArchiveKind::TarBz2)
        } else if lower.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else {
            None
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "tar.gz" | "tgz" | "gz" => Some(ArchiveKind::TarGz),
            "tar.bz2" | "tbz2" | "bz2" => Some(ArchiveKind::TarBz2),
            "zip" => Some(ArchiveKind::Zip),
            _ => None,
        }
    }

    /// Canonical hint written to the cache's type file.
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveKind::TarGz => "tar.gz",
            ArchiveKind::TarBz2 => "tar.bz2",
            ArchiveKind::Zip => "zip",
        }
    }
}

/// Extract `archive` into `dest` (created if missing). Blocking; run it on
/// a blocking thread. After extraction a single wrapping top-level
/// directory is flattened away and an empty result is an error.
pub fn extract(archive: &Path, kind: ArchiveKind, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;

    let file =
        File::open(archive).with_context(|| format!("opening archive {}", archive.display()))?;

    match kind {
        ArchiveKind::TarGz => {
            let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(file));
            tar.unpack(dest).context("unpacking tar.gz")?;
        }
        ArchiveKind::TarBz2 => {
            let mut tar = tar::Archive::new(bzip2::read::BzDecoder::new(file));
            tar.unpack(dest).context("unpacking tar.bz2")?;
        }
        ArchiveKind::Zip => {
            let mut zip = zip::ZipArchive::new(file).context("opening zip")?;
            zip.extract(dest).context("unpacking zip")?;
        }
    }

    flatten_single_dir(dest)?;

    if std::fs::read_dir(dest)?.next().is_none() {
        std::fs::remove_dir_all(dest).ok();
        anyhow::bail!("archive {} extracted to nothing", archive.display());
    }
    Ok(())
}

/// Bundles are often built as `app-1.2.3/...`; when the extracted tree is
/// exactly one directory, hoist its contents one level up.
fn flatten_single_dir(dest: &Path) -> Result<()> {
    let entries: Vec<_> = std::fs::read_dir(dest)?.collect::<std::io::Result<_>>()?;
    if entries.len() != 1 || !entries[0].file_type()?.is_dir() {
        return Ok(());
    }

    let inner = entries[0].path();
    for child in std::fs::read_dir(&inner)? {
        let child = child?;
        std::fs::rename(child.path(), dest.join(child.file_name()))?;
    }
    std::fs::remove_dir(&inner)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_targz(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, content.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, content) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_detect() {
        assert_eq!(ArchiveKind::detect("app.tar.gz", None), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::detect("app.tgz", None), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::detect("app.tar.bz2", None), Some(ArchiveKind::TarBz2));
        assert_eq!(ArchiveKind::detect("app.ZIP", None), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::detect("app", None), None);
        // The hint wins over the filename.
        assert_eq!(
            ArchiveKind::detect("app", Some("tar.gz")),
            Some(ArchiveKind::TarGz)
        );
        assert_eq!(
            ArchiveKind::detect("app.tar.gz", Some("zip")),
            Some(ArchiveKind::Zip)
        );
    }

    #[test]
    fn test_extract_targz_flattens_single_top_dir() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("app.tar.gz");
        write_targz(
            &archive,
            &[
                ("app-1.0/index.html", "<html>"),
                ("app-1.0/css/site.css", "body{}"),
            ],
        );

        let dest = dir.path().join("out");
        extract(&archive, ArchiveKind::TarGz, &dest).unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.join("index.html")).unwrap(),
            "<html>"
        );
        assert_eq!(
            std::fs::read_to_string(dest.join("css/site.css")).unwrap(),
            "body{}"
        );
        assert!(!dest.join("app-1.0").exists());
    }

    #[test]
    fn test_extract_zip_multiple_top_entries_not_flattened() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("app.zip");
        write_zip(&archive, &[("index.html", "<html>"), ("robots.txt", "ok")]);

        let dest = dir.path().join("out");
        extract(&archive, ArchiveKind::Zip, &dest).unwrap();
        assert!(dest.join("index.html").exists());
        assert!(dest.join("robots.txt").exists());
    }

    #[test]
    fn test_extract_empty_archive_fails() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("empty.tar.gz");
        write_targz(&archive, &[]);

        let dest = dir.path().join("out");
        assert!(extract(&archive, ArchiveKind::TarGz, &dest).is_err());
        assert!(!dest.exists());
    }
}
