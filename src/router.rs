//! Routing finished downloads into permanent storage

use crate::error::{PpmiError, Result};
use crate::logging::Logger;
use crate::task::ExtensionSet;
use std::fs::File;
use std::path::{Path, PathBuf};

/// What happened to one finished download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutedFile {
    /// Moved as-is into the destination
    Moved { name: String, path: PathBuf },
    /// Zip archive unpacked into the destination, archive removed
    Extracted { name: String, members: Vec<String> },
}

impl RoutedFile {
    pub fn name(&self) -> &str {
        match self {
            RoutedFile::Moved { name, .. } | RoutedFile::Extracted { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileRouter {
    accepted: ExtensionSet,
    logger: Logger,
}

impl FileRouter {
    pub fn new(accepted: ExtensionSet, logger: Logger) -> Self {
        Self { accepted, logger }
    }

    /// Move or extract every name in `names` from `source_dir` into `destination`.
    ///
    /// All names are checked against the accepted extensions before any file
    /// is touched.
    pub fn route(
        &self,
        source_dir: &Path,
        names: &[String],
        destination: &Path,
    ) -> Result<Vec<RoutedFile>> {
        if let Some(bad) = names.iter().find(|n| !self.accepted.matches(n)) {
            return Err(PpmiError::FormatError {
                file: bad.clone(),
                accepted: self.accepted.to_string(),
            });
        }

        std::fs::create_dir_all(destination)?;

        let mut routed = Vec::with_capacity(names.len());
        for name in names {
            let source = source_dir.join(name);
            if is_zip(name) {
                let members = extract_archive(&source, destination)?;
                std::fs::remove_file(&source)?;
                let preview: Vec<&str> = members.iter().take(2).map(String::as_str).collect();
                self.logger.info(format_args!(
                    "Successfully downloaded files {:?}... ({} in {})",
                    preview,
                    members.len(),
                    name
                ));
                routed.push(RoutedFile::Extracted {
                    name: name.clone(),
                    members,
                });
            } else {
                let target = destination.join(name);
                move_file(&source, &target)?;
                self.logger
                    .info(format_args!("Successfully downloaded file {}", name));
                routed.push(RoutedFile::Moved {
                    name: name.clone(),
                    path: target,
                });
            }
        }

        Ok(routed)
    }
}

fn is_zip(name: &str) -> bool {
    name.to_lowercase().ends_with(".zip")
}

/// Rename, falling back to copy + remove across filesystems.
fn move_file(source: &Path, target: &Path) -> Result<()> {
    if std::fs::rename(source, target).is_ok() {
        return Ok(());
    }
    std::fs::copy(source, target)?;
    std::fs::remove_file(source)?;
    Ok(())
}

/// Unpack `archive` into `destination`, returning the extracted file names.
///
/// Entries whose path would escape the destination are skipped.
fn extract_archive(archive: &Path, destination: &Path) -> Result<Vec<String>> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    let mut members = Vec::new();

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let relative = match entry.enclosed_name() {
            Some(path) => path,
            None => continue,
        };
        let outpath = destination.join(&relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&outpath)?;
        std::io::copy(&mut entry, &mut outfile)?;
        members.push(entry.name().to_string());
    }

    Ok(members)
}

/// File names stored in a zip archive, directories excluded.
pub fn archive_members(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path)?;
    let mut zip = zip::ZipArchive::new(file)?;
    let mut names = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let entry = zip.by_index(i)?;
        if !entry.is_dir() {
            names.push(entry.name().to_string());
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

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

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_extracts_zip_and_removes_archive() {
        let work = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        write_zip(
            &work.path().join("study.zip"),
            &[("a.csv", "id\n1\n"), ("b.xml", "<x/>")],
        );

        let router = FileRouter::new(ExtensionSet::metadata(), Logger::silent());
        let routed = router
            .route(work.path(), &["study.zip".to_string()], dest.path())
            .unwrap();

        assert_eq!(
            routed,
            vec![RoutedFile::Extracted {
                name: "study.zip".to_string(),
                members: vec!["a.csv".to_string(), "b.xml".to_string()],
            }]
        );
        assert_eq!(names(dest.path()), vec!["a.csv", "b.xml"]);
        assert!(names(work.path()).is_empty());
    }

    #[test]
    fn test_moves_plain_file() {
        let work = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(work.path().join("x.csv"), "id\n").unwrap();

        let router = FileRouter::new(ExtensionSet::csv(), Logger::silent());
        let routed = router
            .route(work.path(), &["x.csv".to_string()], &dest.path().join("nested"))
            .unwrap();

        assert_eq!(routed[0].name(), "x.csv");
        assert_eq!(names(&dest.path().join("nested")), vec!["x.csv"]);
        assert!(!work.path().join("x.csv").exists());
    }

    #[test]
    fn test_format_checked_before_touching_files() {
        let work = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(work.path().join("a.csv"), "id\n").unwrap();
        std::fs::write(work.path().join("report.pdf"), "%PDF").unwrap();

        let router = FileRouter::new(ExtensionSet::csv(), Logger::silent());
        let err = router
            .route(
                work.path(),
                &["a.csv".to_string(), "report.pdf".to_string()],
                dest.path(),
            )
            .unwrap_err();

        match err {
            PpmiError::FormatError { file, accepted } => {
                assert_eq!(file, "report.pdf");
                assert_eq!(accepted, ".csv");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(work.path().join("a.csv").exists());
        assert!(names(dest.path()).is_empty());
    }

    #[test]
    fn test_unsafe_members_skipped() {
        let work = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        write_zip(
            &work.path().join("evil.zip"),
            &[("../escape.csv", "x"), ("ok.csv", "y")],
        );

        let router = FileRouter::new(ExtensionSet::metadata(), Logger::silent());
        let routed = router
            .route(work.path(), &["evil.zip".to_string()], dest.path())
            .unwrap();

        assert_eq!(
            routed,
            vec![RoutedFile::Extracted {
                name: "evil.zip".to_string(),
                members: vec!["ok.csv".to_string()],
            }]
        );
        assert!(!work.path().join("escape.csv").exists());
    }

    #[test]
    fn test_archive_members() {
        let work = tempfile::tempdir().unwrap();
        let path = work.path().join("study.zip");
        write_zip(&path, &[("Demographics.csv", ""), ("Vital_Signs.csv", "")]);

        let members = archive_members(&path).unwrap();
        assert_eq!(members, vec!["Demographics.csv", "Vital_Signs.csv"]);
    }
}
