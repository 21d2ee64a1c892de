//! Per-project directory layout and source-tree discovery.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Fixed directory layout of a project, derived from its root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    pub root: PathBuf,
    pub main_sources: PathBuf,
    pub test_sources: PathBuf,
    pub libraries: PathBuf,
    pub main_classes: PathBuf,
    pub test_classes: PathBuf,
    /// Packaged artifact, `<root>/output.<archive_extension>`
    pub archive: PathBuf,
}

impl ProjectLayout {
    pub fn new(root: impl Into<PathBuf>, archive_extension: &str) -> Self {
        let root = root.into();
        Self {
            main_sources: root.join("src").join("main"),
            test_sources: root.join("src").join("test"),
            libraries: root.join("lib"),
            main_classes: root.join("classes").join("src"),
            test_classes: root.join("classes").join("test"),
            archive: root.join(format!("output.{}", archive_extension)),
            root,
        }
    }
}

/// Create a compiler output directory; a no-op when it already exists
pub async fn ensure_dir(dir: &Path) -> io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}

/// Depth-first search for the first file named `file_name`
///
/// Entries are visited in name order so the walk is deterministic.
/// A missing root is treated as an empty tree.
pub fn find_file(root: &Path, file_name: &str) -> io::Result<Option<PathBuf>> {
    if !root.is_dir() {
        return Ok(None);
    }
    for entry in sorted_entries(root)? {
        if entry.is_dir() {
            if let Some(found) = find_file(&entry, file_name)? {
                return Ok(Some(found));
            }
        } else if entry.file_name().is_some_and(|name| name == file_name) {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

/// Every file under `root` with the given extension, in walk order
pub fn collect_files(root: &Path, extension: &str) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if root.is_dir() {
        walk(root, extension, &mut files)?;
    }
    Ok(files)
}

fn walk(dir: &Path, extension: &str, files: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in sorted_entries(dir)? {
        if entry.is_dir() {
            walk(&entry, extension, files)?;
        } else if has_extension(&entry, extension) {
            files.push(entry);
        }
    }
    Ok(())
}

/// Files directly inside `dir` with the given extension, sorted by name
pub fn list_files(dir: &Path, extension: &str) -> io::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    Ok(sorted_entries(dir)?
        .into_iter()
        .filter(|path| path.is_file() && has_extension(path, extension))
        .collect())
}

fn sorted_entries(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension().is_some_and(|ext| ext == extension)
}

/// Fully qualified class name of a source file relative to its source root
///
/// `<root>/com/example/Main.java` → `com.example.Main`
pub fn qualified_name(source_root: &Path, source_file: &Path) -> Option<String> {
    let relative = source_file.strip_prefix(source_root).ok()?;
    let mut parts = relative
        .parent()
        .into_iter()
        .flat_map(Path::components)
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    parts.push(relative.file_stem()?.to_str()?);
    Some(parts.join("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn test_layout_paths() {
        let layout = ProjectLayout::new("/p", "jar");
        assert_eq!(layout.main_sources, PathBuf::from("/p/src/main"));
        assert_eq!(layout.test_sources, PathBuf::from("/p/src/test"));
        assert_eq!(layout.libraries, PathBuf::from("/p/lib"));
        assert_eq!(layout.main_classes, PathBuf::from("/p/classes/src"));
        assert_eq!(layout.test_classes, PathBuf::from("/p/classes/test"));
        assert_eq!(layout.archive, PathBuf::from("/p/output.jar"));
    }

    #[tokio::test]
    async fn test_ensure_dir_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("classes").join("src");
        ensure_dir(&target).await.unwrap();
        ensure_dir(&target).await.unwrap();
        assert!(target.is_dir());
    }

    #[test]
    fn test_find_file_is_depth_first_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("b/Main.java"));
        touch(&dir.path().join("a/deep/Main.java"));
        touch(&dir.path().join("c/Main.java"));

        let found = find_file(dir.path(), "Main.java").unwrap().unwrap();
        assert_eq!(found, dir.path().join("a/deep/Main.java"));
    }

    #[test]
    fn test_find_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a/Other.java"));
        assert_eq!(find_file(dir.path(), "Main.java").unwrap(), None);
        assert_eq!(find_file(&dir.path().join("nope"), "Main.java").unwrap(), None);
    }

    #[test]
    fn test_collect_files_filters_extension() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("com/x/A.java"));
        touch(&dir.path().join("com/x/notes.txt"));
        touch(&dir.path().join("B.java"));

        let files = collect_files(dir.path(), "java").unwrap();
        assert_eq!(
            files,
            vec![dir.path().join("B.java"), dir.path().join("com/x/A.java")]
        );
    }

    #[test]
    fn test_list_files_is_not_recursive() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("b.jar"));
        touch(&dir.path().join("a.jar"));
        touch(&dir.path().join("readme.md"));
        touch(&dir.path().join("nested/c.jar"));

        let files = list_files(dir.path(), "jar").unwrap();
        assert_eq!(files, vec![dir.path().join("a.jar"), dir.path().join("b.jar")]);
    }

    #[test]
    fn test_qualified_name() {
        let root = Path::new("/p/src/main");
        assert_eq!(
            qualified_name(root, Path::new("/p/src/main/com/eseo/example/Main.java")).as_deref(),
            Some("com.eseo.example.Main")
        );
        assert_eq!(
            qualified_name(root, Path::new("/p/src/main/Main.java")).as_deref(),
            Some("Main")
        );
        assert_eq!(qualified_name(root, Path::new("/elsewhere/Main.java")), None);
    }
}
