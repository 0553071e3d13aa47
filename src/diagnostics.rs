//! Diagnostic snapshots of the remote state
//!
//! When an interaction gives up, the navigator asks for a snapshot: a
//! screenshot, the page HTML and a small JSON manifest tying them together.
//! Capturing is best-effort; callers log a failed capture and carry on with
//! the error they already have.

use crate::browser::InteractionSurface;
use crate::error::{PpmiError, Result};
use crate::logging::Logger;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Something able to record the current remote state.
#[async_trait]
pub trait Diagnostics: Send + Sync {
    /// Capture a snapshot labelled `label`, returning the manifest path.
    async fn capture(&self, label: &str) -> Result<PathBuf>;
}

/// Manifest written next to the captured files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticFrame {
    /// What was being attempted
    pub label: String,

    /// ISO 8601 capture time
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<CapturedFile>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<CapturedFile>,

    /// Parts that could not be captured, with the reason
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedFile {
    pub path: String,
    pub size_bytes: usize,
    /// SHA-256 of the content
    pub hash: String,
}

/// Captures diagnostics from an [`InteractionSurface`] into a directory.
pub struct SurfaceDiagnostics<'a, S: InteractionSurface> {
    surface: &'a S,
    dir: PathBuf,
    logger: Logger,
}

impl<'a, S: InteractionSurface> SurfaceDiagnostics<'a, S> {
    pub fn new(surface: &'a S, dir: impl Into<PathBuf>, logger: Logger) -> Self {
        Self {
            surface,
            dir: dir.into(),
            logger,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl<'a, S: InteractionSurface> Diagnostics for SurfaceDiagnostics<'a, S> {
    async fn capture(&self, label: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let now = chrono::Utc::now();
        let stem = format!("{}_{}", now.format("%Y%m%dT%H%M%S%.3f"), sanitize_label(label));
        let mut frame = DiagnosticFrame {
            label: label.to_string(),
            timestamp: now.to_rfc3339(),
            url: None,
            screenshot: None,
            html: None,
            missing: Vec::new(),
        };

        match self.surface.current_url().await {
            Ok(url) => frame.url = Some(url),
            Err(e) => frame.missing.push(format!("url: {}", e)),
        }

        match self.surface.screenshot().await {
            Ok(png) => {
                let path = self.dir.join(format!("{}.png", stem));
                frame.screenshot = Some(write_captured(&path, &png).await?);
            }
            Err(e) => frame.missing.push(format!("screenshot: {}", e)),
        }

        match self.surface.page_source().await {
            Ok(html) => {
                let path = self.dir.join(format!("{}.html", stem));
                frame.html = Some(write_captured(&path, html.as_bytes()).await?);
            }
            Err(e) => frame.missing.push(format!("html: {}", e)),
        }

        if frame.screenshot.is_none() && frame.html.is_none() {
            return Err(PpmiError::PermanentFailure(format!(
                "nothing captured for {}: {}",
                label,
                frame.missing.join("; ")
            )));
        }

        let manifest = self.dir.join(format!("{}.json", stem));
        tokio::fs::write(&manifest, serde_json::to_string_pretty(&frame)?).await?;
        self.logger
            .debug(format_args!("Diagnostic frame written to {}", manifest.display()));

        Ok(manifest)
    }
}

async fn write_captured(path: &Path, content: &[u8]) -> Result<CapturedFile> {
    tokio::fs::write(path, content).await?;
    Ok(CapturedFile {
        path: path.to_string_lossy().to_string(),
        size_bytes: content.len(),
        hash: compute_hash(content),
    })
}

/// Compute SHA-256 hash of some bytes
fn compute_hash(content: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
