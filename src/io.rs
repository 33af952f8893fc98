use std::{
    io::{self, Write},
    path::Path,
};

use tempfile::NamedTempFile;

/// Directory a file lives in, falling back to the current directory.
fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Replace the file content as a whole.
///
/// The data goes to a temporary file in the same directory which is then
/// renamed over the destination, so readers see either the old or the new
/// content, never a partial write.
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut tmp = NamedTempFile::new_in(parent_dir(path))?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Create a named temporary file next to `path`, keeping its extension so
/// that tools inferring the format from the name still work.
///
/// The file destructor will be called at the handle drop.
/// **As such, one must not simply get the file path and drop the handle.**
pub fn sibling_tempfile(path: &Path) -> io::Result<NamedTempFile> {
    let suffix = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();

    tempfile::Builder::new()
        .prefix(".repair-")
        .suffix(&suffix)
        .tempfile_in(parent_dir(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        // No temporary file is left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn write_atomic_fails_without_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("record.json");
        assert!(write_atomic(&path, b"data").is_err());
    }

    #[test]
    fn sibling_tempfile_keeps_extension() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = sibling_tempfile(&dir.path().join("video.mkv")).unwrap();
        assert_eq!(tmp.path().parent(), Some(dir.path()));
        assert_eq!(tmp.path().extension().unwrap(), "mkv");
    }
}
