//! Layer extraction: unpacking a gzipped tar layer onto a directory, with
//! OCI whiteout handling.

use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use tar::Archive;

use crate::error::Result;

/// Unpacks a gzip-compressed tar layer into `dest`, applying OCI whiteout
/// semantics: a `.wh.<name>` entry deletes `<name>` in the same directory
/// instead of being written, and a `.wh..wh..opq` entry clears the
/// directory it appears in before any further entries are applied.
pub fn extract_layer(gz_bytes: &[u8], dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let decoder = GzDecoder::new(gz_bytes);
    let mut archive = Archive::new(decoder);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();

        if name == ".wh..wh..opq" {
            let dir = path.parent().map_or_else(|| dest.to_path_buf(), |p| dest.join(p));
            clear_directory(&dir)?;
            continue;
        }
        if let Some(victim) = name.strip_prefix(".wh.") {
            let dir = path.parent().map_or_else(|| dest.to_path_buf(), |p| dest.join(p));
            let target = dir.join(victim);
            if target.is_dir() {
                let _ = std::fs::remove_dir_all(&target);
            } else {
                let _ = std::fs::remove_file(&target);
            }
            continue;
        }
        entry.unpack_in(dest)?;
    }
    Ok(())
}

/// Finds a single entry by exact path inside a gzip-compressed tar layer
/// and returns its contents, without writing anything to disk. Used to
/// pull `.imgpkg/images.yml` (and optionally `.imgpkg/bundle.yml`) out of
/// a bundle's content layer for inspection.
pub fn read_tar_entry(gz_bytes: &[u8], target_path: &str) -> Result<Option<Vec<u8>>> {
    let decoder = GzDecoder::new(gz_bytes);
    let mut archive = Archive::new(decoder);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if path.to_string_lossy() == target_path {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            return Ok(Some(buf));
        }
    }
    Ok(None)
}

fn clear_directory(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_layer(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        let tar_bytes = builder.into_inner().unwrap();
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn reads_single_entry() {
        let layer = make_layer(&[(".imgpkg/images.yml", b"kind: ImagesLock\n")]);
        let found = read_tar_entry(&layer, ".imgpkg/images.yml").unwrap().unwrap();
        assert_eq!(found, b"kind: ImagesLock\n");
    }

    #[test]
    fn missing_entry_returns_none() {
        let layer = make_layer(&[("other.txt", b"x")]);
        assert!(read_tar_entry(&layer, ".imgpkg/images.yml").unwrap().is_none());
    }

    #[test]
    fn extracts_and_applies_whiteout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"old").unwrap();
        let layer = make_layer(&[(".wh.keep.txt", b""), ("new.txt", b"new")]);
        extract_layer(&layer, dir.path()).unwrap();
        assert!(!dir.path().join("keep.txt").exists());
        assert_eq!(std::fs::read(dir.path().join("new.txt")).unwrap(), b"new");
    }
}
