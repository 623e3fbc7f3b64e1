// cloudstash/src/archive.rs
use anyhow::{Context, Result};
use bytes::Bytes;
use std::path::Path;
use tar::Builder;

/// Read the archive to upload from `source`.
///
/// A file is taken as an already-built archive and read as is. A directory is
/// packed into an uncompressed tar whose entry paths are relative to it.
pub fn load_archive(source: &Path) -> Result<Bytes> {
    if source.is_dir() {
        return pack_directory(source);
    }
    let data = std::fs::read(source)
        .with_context(|| format!("Failed to read archive file: {}", source.display()))?;
    Ok(Bytes::from(data))
}

/// Pack `source_dir` into an in-memory tar.
pub fn pack_directory(source_dir: &Path) -> Result<Bytes> {
    if !source_dir.is_dir() {
        return Err(anyhow::anyhow!(
            "Source for archival is not a directory: {}",
            source_dir.display()
        ));
    }

    println!("📦 Packing {} into a tar archive", source_dir.display());

    let mut tar_builder = Builder::new(Vec::new());
    tar_builder.follow_symlinks(false);
    tar_builder
        .append_dir_all(".", source_dir)
        .with_context(|| {
            format!("Failed to append directory {} to archive", source_dir.display())
        })?;
    let data = tar_builder
        .into_inner()
        .with_context(|| format!("Failed to finish tar archive for {}", source_dir.display()))?;

    println!("✓ Archive packed ({} bytes)", data.len());
    Ok(Bytes::from(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn test_pack_directory_keeps_relative_paths() -> anyhow::Result<()> {
        let dir = tempdir()?;
        std::fs::write(dir.path().join("config.yaml"), b"key: value")?;
        std::fs::create_dir(dir.path().join("data"))?;
        std::fs::write(dir.path().join("data").join("state.db"), b"sqlite")?;

        let packed = pack_directory(dir.path())?;
        let mut archive = tar::Archive::new(&packed[..]);
        let mut files = Vec::new();
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.header().entry_type().is_file() {
                let mut body = String::new();
                entry.read_to_string(&mut body)?;
                let path = entry.path()?.to_string_lossy().trim_start_matches("./").to_string();
                files.push((path, body));
            }
        }
        files.sort();
        assert_eq!(
            files,
            vec![
                ("config.yaml".to_string(), "key: value".to_string()),
                ("data/state.db".to_string(), "sqlite".to_string()),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_load_archive_reads_files_verbatim() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("existing.tar");
        std::fs::write(&path, b"prebuilt")?;
        assert_eq!(load_archive(&path)?, Bytes::from_static(b"prebuilt"));
        assert!(pack_directory(&path).is_err());
        assert!(load_archive(&dir.path().join("missing.tar")).is_err());
        Ok(())
    }
}
