//! Locating NIfTI images inside an extracted image collection
//!
//! A NIfTI export unpacks into `<root>/<subject>/<protocol>/<date>/S<series>/`
//! next to one `PPMI_<subject>_*.xml` metadata file per image. The metadata
//! ties an image to its subject, visit and protocol description.

use crate::error::{PpmiError, Result};
use crate::logging::Logger;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Study-data event ids and the visit names the imaging metadata uses.
pub const VISIT_NAMES: &[(&str, &str)] = &[
    ("SC", "Screening"),
    ("BL", "Baseline"),
    ("V04", "Month 12"),
    ("V06", "Month 24"),
    ("V08", "Month 36"),
    ("V10", "Month 48"),
    ("ST", "Symptomatic Therapy"),
    ("U01", "Unscheduled Visit 01"),
    ("U02", "Unscheduled Visit 02"),
    ("PW", "Premature Withdrawal"),
];

pub fn visit_name(event_id: &str) -> Option<&'static str> {
    VISIT_NAMES
        .iter()
        .find(|(id, _)| *id == event_id)
        .map(|(_, name)| *name)
}

/// Identity of one image, read from its XML metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub subject_id: String,
    pub visit: String,
    pub study_id: String,
    pub series_id: String,
    pub image_id: String,
    pub description: String,
}

impl ImageRecord {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content).map_err(|reason| PpmiError::ImageMetadata {
            file: path.to_path_buf(),
            reason,
        })
    }

    /// Read the first subject of the first project in `xml`.
    pub fn parse(xml: &str) -> std::result::Result<Self, String> {
        let doc = roxmltree::Document::parse(xml).map_err(|e| e.to_string())?;
        let subject = doc
            .root_element()
            .children()
            .filter(|n| n.has_tag_name("project"))
            .flat_map(|project| project.children())
            .find(|n| n.has_tag_name("subject"))
            .ok_or("no project/subject element")?;

        let visit = child(subject, "visit")?;
        let study = child(subject, "study")?;
        let series = child(study, "series")?;
        let protocol = child(study, "imagingProtocol")?;

        Ok(Self {
            subject_id: text(subject, "subjectIdentifier")?,
            visit: text(visit, "visitIdentifier")?,
            study_id: text(study, "studyIdentifier")?,
            series_id: text(series, "seriesIdentifier")?,
            image_id: text(protocol, "imageUID")?,
            description: text(protocol, "description")?,
        })
    }
}

fn child<'a, 'i>(
    node: roxmltree::Node<'a, 'i>,
    tag: &str,
) -> std::result::Result<roxmltree::Node<'a, 'i>, String> {
    node.children()
        .find(|n| n.has_tag_name(tag))
        .ok_or_else(|| format!("<{}> has no <{}>", node.tag_name().name(), tag))
}

fn text(node: roxmltree::Node<'_, '_>, tag: &str) -> std::result::Result<String, String> {
    let found = child(node, tag)?;
    Ok(found.text().map(|t| t.trim().to_string()).unwrap_or_default())
}

/// Protocol descriptions become directory names with these characters replaced.
fn protocol_dir(description: &str) -> String {
    description.replace([' ', '(', ')', '/'], "_")
}

/// Finds the NIfTI file of a subject, visit and protocol under one directory.
#[derive(Debug, Clone)]
pub struct NiftiFinder {
    root: PathBuf,
    logger: Logger,
}

impl NiftiFinder {
    pub fn new(root: impl Into<PathBuf>, logger: Logger) -> Self {
        Self {
            root: root.into(),
            logger,
        }
    }

    /// Metadata files of `subject_id` directly under the root, sorted.
    fn metadata_files(&self, subject_id: &str) -> Result<Vec<PathBuf>> {
        let pattern = format!("PPMI_{}_*.xml", subject_id);
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_file() && glob_match::glob_match(&pattern, &name) {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Path of the image matching all three keys, or `None` when no
    /// metadata file describes it.
    ///
    /// `event_id` is a study-data event such as `V06`, not a visit name.
    /// A matching metadata file whose image is missing, or present more
    /// than once, is an error.
    pub fn find(&self, subject_id: &str, event_id: &str, description: &str) -> Result<Option<PathBuf>> {
        let visit = visit_name(event_id).ok_or_else(|| {
            PpmiError::name_resolution(
                event_id,
                format!(
                    "unknown event id, expected one of {}",
                    VISIT_NAMES.iter().map(|(id, _)| *id).collect::<Vec<_>>().join(", ")
                ),
            )
        })?;

        for file in self.metadata_files(subject_id)? {
            let record = ImageRecord::load(&file)?;
            if record.subject_id != subject_id || record.visit != visit || record.description != description {
                self.logger.debug(format_args!(
                    "{} describes {} / {} / {}",
                    file.display(),
                    record.subject_id,
                    record.visit,
                    record.description
                ));
                continue;
            }
            return self.image_file(&record).map(Some);
        }
        Ok(None)
    }

    fn image_file(&self, record: &ImageRecord) -> Result<PathBuf> {
        let protocol = self.root.join(&record.subject_id).join(protocol_dir(&record.description));
        let series_dir = format!("S{}", record.series_id);
        let pattern = format!(
            "PPMI_{}_MR_*_S{}_I{}.nii",
            record.subject_id, record.series_id, record.image_id
        );

        let mut found = Vec::new();
        if protocol.is_dir() {
            // <protocol>/<date>/S<series>/<file>
            for entry in WalkDir::new(&protocol).min_depth(3).max_depth(3).follow_links(false) {
                let entry = entry.map_err(|e| PpmiError::Io(std::io::Error::other(e)))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let in_series = entry
                    .path()
                    .parent()
                    .and_then(|p| p.file_name())
                    .is_some_and(|n| n.to_string_lossy() == series_dir);
                let name = entry.file_name().to_string_lossy();
                if in_series && glob_match::glob_match(&pattern, &name) {
                    found.push(entry.into_path());
                }
            }
        }

        match found.len() {
            1 => {
                let path = found.remove(0);
                self.logger.info(format_args!("Found {}", path.display()));
                Ok(path)
            }
            n => Err(PpmiError::name_resolution(
                format!("{}/{}", protocol.display(), pattern),
                format!("{} file(s) match while exactly one was expected", n),
            )),
        }
    }
}
