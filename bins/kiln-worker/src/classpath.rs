use crate::layout;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

#[cfg(windows)]
pub const CLASSPATH_SEPARATOR: &str = ";";
#[cfg(not(windows))]
pub const CLASSPATH_SEPARATOR: &str = ":";

/// Ordered set of locations searched for compiled code
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classpath {
    entries: Vec<PathBuf>,
}

impl Classpath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dependency archives directly inside `lib_dir`, sorted by file name.
    /// A missing library directory yields an empty classpath.
    pub fn from_libraries(lib_dir: &Path, archive_extension: &str) -> io::Result<Self> {
        let entries = layout::list_files(lib_dir, archive_extension)?;
        Ok(Self { entries })
    }

    /// Append a location, keeping order and skipping duplicates
    pub fn with(mut self, entry: impl AsRef<Path>) -> Self {
        let entry = entry.as_ref().to_path_buf();
        if !self.entries.contains(&entry) {
            self.entries.push(entry);
        }
        self
    }

    pub fn extend<I, P>(self, entries: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        entries.into_iter().fold(self, |cp, entry| cp.with(entry))
    }

    pub fn entries(&self) -> &[PathBuf] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Classpath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .entries
            .iter()
            .map(|entry| entry.display().to_string())
            .collect::<Vec<_>>()
            .join(CLASSPATH_SEPARATOR);
        f.write_str(&rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_from_libraries_keeps_only_archives() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("z-last.jar"), b"").unwrap();
        fs::write(dir.path().join("a-first.jar"), b"").unwrap();
        fs::write(dir.path().join("README"), b"").unwrap();

        let cp = Classpath::from_libraries(dir.path(), "jar").unwrap();
        assert_eq!(
            cp.entries(),
            &[dir.path().join("a-first.jar"), dir.path().join("z-last.jar")]
        );
    }

    #[test]
    fn test_missing_library_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cp = Classpath::from_libraries(&dir.path().join("lib"), "jar").unwrap();
        assert!(cp.is_empty());
        assert_eq!(cp.to_string(), "");
    }

    #[test]
    fn test_render_joins_with_separator() {
        let cp = Classpath::new()
            .with("/p/lib/a.jar")
            .with("/p/classes/src")
            .with("/p/lib/a.jar");
        assert_eq!(
            cp.to_string(),
            format!("/p/lib/a.jar{}/p/classes/src", CLASSPATH_SEPARATOR)
        );
    }

    #[test]
    fn test_extend_preserves_order() {
        let cp = Classpath::new().with("/a").extend(["/b", "/c"]);
        assert_eq!(
            cp.entries(),
            &[PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/c")]
        );
    }
}
