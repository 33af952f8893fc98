use std::{
    fs::OpenOptions,
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    io::write_atomic,
    result::{bail, Result},
};

/// Ordered list of the jobs shown to the user, one uuid per line.
///
/// This is the only place defining display order and list membership:
/// a record missing from here is an orphan.
pub struct VideoIndex {
    path: PathBuf,
    ids: Vec<Uuid>,
}

impl VideoIndex {
    pub fn read_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Open or create file from the start with RW rights
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let mut ids: Vec<Uuid> = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match Uuid::parse_str(line) {
                Ok(id) if !ids.contains(&id) => ids.push(id),
                Ok(_) => debug!("Duplicate index entry {line} skipped"),
                Err(_) => warn!("Invalid index entry '{line}' skipped"),
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            ids,
        })
    }

    pub fn ids(&self) -> &[Uuid] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    /// Append a job at the end of the list.
    pub fn push(&mut self, id: Uuid) -> Result<()> {
        if self.contains(&id) {
            return bail("ID already exist in index");
        }

        // Push it to file first so that memory never lists more than disk
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{id}")?;

        self.ids.push(id);
        Ok(())
    }

    /// Remove a job from the list. Return whether it was listed.
    pub fn remove(&mut self, id: &Uuid) -> Result<bool> {
        Ok(self.retain(|other| other != id)? == 1)
    }

    /// Keep only the entries matching the predicate, returning how many were dropped.
    pub fn retain<F: FnMut(&Uuid) -> bool>(&mut self, mut keep: F) -> Result<usize> {
        let kept: Vec<Uuid> = self.ids.iter().copied().filter(|id| keep(id)).collect();
        let dropped = self.ids.len() - kept.len();
        if dropped == 0 {
            return Ok(0);
        }

        let content: String = kept.iter().map(|id| format!("{id}\n")).collect();
        write_atomic(&self.path, content.as_bytes())?;

        self.ids = kept;
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_survives_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("videos.list");
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let mut index = VideoIndex::read_or_create(&path).unwrap();
        for id in [a, b, c] {
            index.push(id).unwrap();
        }
        assert!(index.push(b).is_err());

        let index = VideoIndex::read_or_create(&path).unwrap();
        assert_eq!(index.ids(), &[a, b, c]);
    }

    #[test]
    fn remove_rewrites_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("videos.list");
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let mut index = VideoIndex::read_or_create(&path).unwrap();
        index.push(a).unwrap();
        index.push(b).unwrap();

        assert!(index.remove(&a).unwrap());
        assert!(!index.remove(&a).unwrap());

        let index = VideoIndex::read_or_create(&path).unwrap();
        assert_eq!(index.ids(), &[b]);
    }

    #[test]
    fn invalid_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("videos.list");
        let id = Uuid::new_v4();
        std::fs::write(&path, format!("garbage\n\n{id}\n{id}\n")).unwrap();

        let index = VideoIndex::read_or_create(&path).unwrap();
        assert_eq!(index.ids(), &[id]);
    }
}
