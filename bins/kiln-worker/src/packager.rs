//! Deployable archive assembly.
//!
//! The archive holds the project's compiled classes plus the exploded
//! contents of every library archive, with a fresh manifest naming the main
//! class. Entries are written in sorted order with a fixed timestamp so the
//! same inputs always produce the same bytes.

use crate::error::JobError;
use crate::layout::{self, ProjectLayout};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

pub const MANIFEST_DIR: &str = "META-INF/";
pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";

/// Signature files of a signed library; stale once its contents are merged
const SIGNATURE_SUFFIXES: [&str; 4] = [".SF", ".RSA", ".DSA", ".EC"];

/// Upper bound on the buffer reserved up front for a library entry
const MAX_ENTRY_PREALLOC: u64 = 1 << 20;

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Zip error: {0}")]
    Zip(String),
    #[error("Invalid archive input: {0}")]
    Invalid(String),
}

enum Entry {
    Directory,
    File(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct ArchivePackager {
    class_extension: String,
    archive_extension: String,
}

impl ArchivePackager {
    pub fn new(class_extension: impl Into<String>, archive_extension: impl Into<String>) -> Self {
        Self {
            class_extension: class_extension.into(),
            archive_extension: archive_extension.into(),
        }
    }

    /// Build `<root>/output.<ext>` off the async runtime and return its path
    pub async fn package(&self, project: &ProjectLayout, main_class: &str) -> Result<PathBuf, JobError> {
        let packager = self.clone();
        let project = project.clone();
        let main_class = main_class.to_string();

        let archive = tokio::task::spawn_blocking(move || packager.package_blocking(&project, &main_class))
            .await
            .map_err(|err| PackageError::Invalid(format!("packaging task failed: {err}")))??;
        Ok(archive)
    }

    pub fn package_blocking(&self, project: &ProjectLayout, main_class: &str) -> Result<PathBuf, PackageError> {
        let mut entries = BTreeMap::new();
        self.stage_classes(&project.main_classes, &mut entries)?;

        let libraries = layout::list_files(&project.libraries, &self.archive_extension)?;
        for library in &libraries {
            stage_library(library, &mut entries)?;
        }

        write_archive(&project.archive, main_class, &entries)?;
        info!(
            archive = %project.archive.display(),
            entries = entries.len(),
            libraries = libraries.len(),
            main_class,
            "Archive written"
        );
        Ok(project.archive.clone())
    }

    fn stage_classes(&self, classes_dir: &Path, entries: &mut BTreeMap<String, Entry>) -> Result<(), PackageError> {
        for file in layout::collect_files(classes_dir, &self.class_extension)? {
            let name = entry_name(classes_dir, &file)?;
            entries.insert(name, Entry::File(fs::read(&file)?));
        }
        Ok(())
    }
}

/// Archive entry name: relative path with `/` separators
fn entry_name(root: &Path, file: &Path) -> Result<String, PackageError> {
    let relative = file
        .strip_prefix(root)
        .map_err(|_| PackageError::Invalid(format!("{} is outside {}", file.display(), root.display())))?;
    let parts = relative
        .components()
        .map(|c| {
            c.as_os_str()
                .to_str()
                .ok_or_else(|| PackageError::Invalid(format!("non UTF-8 path {}", file.display())))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join("/"))
}

fn is_skipped_library_entry(name: &str) -> bool {
    if name.eq_ignore_ascii_case(MANIFEST_PATH) || name.eq_ignore_ascii_case(MANIFEST_DIR) {
        return true;
    }
    let upper = name.to_ascii_uppercase();
    upper.starts_with(MANIFEST_DIR) && SIGNATURE_SUFFIXES.iter().any(|suffix| upper.ends_with(suffix))
}

/// Explode one library into the staging map; later libraries overwrite earlier entries
fn stage_library(library: &Path, entries: &mut BTreeMap<String, Entry>) -> Result<(), PackageError> {
    let file = File::open(library)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|err| PackageError::Zip(format!("{}: {err}", library.display())))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| PackageError::Zip(format!("{}: {err}", library.display())))?;
        let name = entry.name().to_string();
        if is_skipped_library_entry(&name) {
            continue;
        }
        if entry.is_dir() {
            entries.insert(name, Entry::Directory);
            continue;
        }
        let mut bytes = Vec::with_capacity(capacity_hint(entry.size()));
        entry.read_to_end(&mut bytes)?;
        if let Some(Entry::File(_)) = entries.insert(name.clone(), Entry::File(bytes)) {
            debug!(entry = %name, library = %library.display(), "Library entry overrides earlier copy");
        }
    }
    Ok(())
}

/// The declared size comes from the archive header and is not trusted
fn capacity_hint(declared: u64) -> usize {
    declared.min(MAX_ENTRY_PREALLOC) as usize
}

fn manifest(main_class: &str) -> String {
    format!(
        "Manifest-Version: 1.0\r\nMain-Class: {}\r\nCreated-By: kiln\r\n\r\n",
        main_class
    )
}

fn write_archive(path: &Path, main_class: &str, entries: &BTreeMap<String, Entry>) -> Result<(), PackageError> {
    let partial = path.with_extension("partial");
    let file = File::create(&partial)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default());
    let zip_err = |err: zip::result::ZipError| PackageError::Zip(err.to_string());

    zip.add_directory(MANIFEST_DIR, options).map_err(zip_err)?;
    zip.start_file(MANIFEST_PATH, options).map_err(zip_err)?;
    zip.write_all(manifest(main_class).as_bytes())?;

    for (name, entry) in entries {
        match entry {
            Entry::Directory => zip.add_directory(name.as_str(), options).map_err(zip_err)?,
            Entry::File(bytes) => {
                zip.start_file(name.as_str(), options).map_err(zip_err)?;
                zip.write_all(bytes)?;
            }
        }
    }
    zip.finish().map_err(zip_err)?;

    fs::rename(&partial, path)?;
    Ok(())
}
