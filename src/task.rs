//! Download task descriptions

use crate::error::{PpmiError, Result};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Case-insensitive set of accepted file extensions (`.csv`, `.zip`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionSet {
    extensions: Vec<String>,
}

impl ExtensionSet {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = Vec::new();
        for ext in extensions {
            let ext = ext.as_ref().trim().to_lowercase();
            if ext.is_empty() {
                continue;
            }
            let ext = if ext.starts_with('.') { ext } else { format!(".{}", ext) };
            if !normalized.contains(&ext) {
                normalized.push(ext);
            }
        }
        Self {
            extensions: normalized,
        }
    }

    pub fn matches(&self, file_name: &str) -> bool {
        let lowered = file_name.to_lowercase();
        self.extensions.iter().any(|ext| lowered.ends_with(ext.as_str()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.extensions.iter().map(String::as_str)
    }

    /// Study-data metadata: one csv, or a zip of csvs.
    pub fn metadata() -> Self {
        Self::new([".csv", ".zip"])
    }

    /// Image collection export: image archive, metadata archive and listings.
    pub fn imaging() -> Self {
        Self::new([".zip", ".csv", ".dcm", ".xml"])
    }

    pub fn csv() -> Self {
        Self::new([".csv"])
    }
}

impl fmt::Display for ExtensionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extensions.join(", "))
    }
}

/// How the portal packages exported images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageFormat {
    /// As stored in the archive, usually DICOM
    #[default]
    Archived,
    Nifti,
}

impl ImageFormat {
    /// Id of the export-format radio button on the portal
    pub fn button_id(&self) -> &'static str {
        match self {
            ImageFormat::Archived => "archivedButton",
            ImageFormat::Nifti => "niftiButton",
        }
    }
}

impl FromStr for ImageFormat {
    type Err = PpmiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "archived" => Ok(ImageFormat::Archived),
            "nifti" => Ok(ImageFormat::Nifti),
            other => Err(PpmiError::Config(format!(
                "Invalid image format: {}. Only \"archived\" and \"nifti\" are supported",
                other
            ))),
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageFormat::Archived => write!(f, "archived"),
            ImageFormat::Nifti => write!(f, "nifti"),
        }
    }
}

/// One browser-initiated download, from request to routed files.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub identifiers: Vec<String>,
    pub accepted: ExtensionSet,
    /// Number of finished files that make the download complete
    pub expected: usize,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub destination: PathBuf,
}

impl DownloadTask {
    pub fn new(
        identifiers: Vec<String>,
        accepted: ExtensionSet,
        expected: usize,
        timeout: Duration,
        poll_interval: Duration,
        destination: impl Into<PathBuf>,
    ) -> Result<Self> {
        if expected == 0 {
            return Err(PpmiError::Config(
                "a download must expect at least one file".to_string(),
            ));
        }
        if poll_interval.is_zero() {
            return Err(PpmiError::Config("poll interval must be positive".to_string()));
        }
        Ok(Self {
            identifiers,
            accepted,
            expected,
            timeout,
            poll_interval,
            destination: destination.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_set_normalizes() {
        let set = ExtensionSet::new(["csv", ".ZIP", " .csv "]);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![".csv", ".zip"]);
        assert!(set.matches("Demographics.CSV"));
        assert!(set.matches("study.zip"));
        assert!(!set.matches("image.dcm"));
        assert!(!set.matches("csv"));
        assert_eq!(set.to_string(), ".csv, .zip");
    }

    #[test]
    fn test_image_format_parse() {
        assert_eq!("nifti".parse::<ImageFormat>().unwrap(), ImageFormat::Nifti);
        assert_eq!("Archived".parse::<ImageFormat>().unwrap(), ImageFormat::Archived);
        assert!("dicom".parse::<ImageFormat>().is_err());
        assert_eq!(ImageFormat::Nifti.button_id(), "niftiButton");
    }

    #[test]
    fn test_task_rejects_zero_expected() {
        let result = DownloadTask::new(
            vec![],
            ExtensionSet::csv(),
            0,
            Duration::from_secs(10),
            Duration::from_secs(1),
            ".",
        );
        assert!(matches!(result, Err(PpmiError::Config(_))));
    }
}
