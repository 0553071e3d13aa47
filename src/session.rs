//! Portal sessions
//!
//! A session owns the credentials, a private working directory the browser
//! downloads into, and the interaction surface. Operations run one after the
//! other; an error that leaves the remote state unknown closes the session.

use crate::browser::{ChromeSurface, InteractionSurface, Locator};
use crate::config::{Credentials, Settings};
use crate::crawl::CheckboxCrawler;
use crate::diagnostics::{Diagnostics, SurfaceDiagnostics};
use crate::error::{PpmiError, Result};
use crate::logging::Logger;
use crate::mapping::{write_table, ChannelMapping, CheckboxCatalog};
use crate::navigator::{Navigator, PortalUrls};
use crate::poller::CompletionPoller;
use crate::retry::RetryPolicy;
use crate::router::{FileRouter, RoutedFile};
use crate::task::{DownloadTask, ExtensionSet, ImageFormat};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const METADATA_CHAIN: &[&str] = &["Download", "Study Data", "ALL"];
const ADVANCED_SEARCH_CHAIN: &[&str] = &["Search", "Advanced Image Search (beta)"];

/// Result columns shown for the 3D T1 listing
const T1_DISPLAY_COLUMNS: &[&str] = &[
    "RESET_VISIT.0",
    "RESET_PROTOCOL_STRING.1_Weighting",
    "RESET_PROTOCOL_STRING.1_Manufacturer",
    "RESET_PROTOCOL_STRING.1_Mfg_Model",
    "RESET_STUDY.0",
    "RESET_PROTOCOL_NUMERIC.imgProtocol_1_Field_Strength",
    "RESET_PROTOCOL_STRING.1_Acquisition_Plane",
];

/// Tunables of a session, usually derived from [`Settings`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub urls: PortalUrls,
    pub policy: RetryPolicy,
    pub settle: Duration,
    pub poll_interval: Duration,
    pub metadata_timeout: Duration,
    pub imaging_timeout: Duration,
    pub t1_info_timeout: Duration,
    pub in_progress_markers: Vec<String>,
    pub diagnostics_dir: PathBuf,
}

impl SessionOptions {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self {
            urls: settings.portal_urls(),
            policy: settings.retry.policy()?,
            settle: settings.retry.settle,
            poll_interval: settings.downloads.poll_interval,
            metadata_timeout: settings.downloads.metadata_timeout,
            imaging_timeout: settings.downloads.imaging_timeout,
            t1_info_timeout: settings.downloads.t1_info_timeout,
            in_progress_markers: settings.downloads.in_progress_markers.clone(),
            diagnostics_dir: settings.diagnostics_dir(),
        })
    }
}

/// Create the private download directory of a session.
pub fn create_workdir(parent: Option<&Path>) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("ppmi-");
    let dir = match parent {
        Some(parent) => {
            std::fs::create_dir_all(parent)?;
            // Chrome wants an absolute download path
            builder.tempdir_in(std::fs::canonicalize(parent)?)?
        }
        None => builder.tempdir()?,
    };
    Ok(dir)
}

pub struct Session<S: InteractionSurface> {
    credentials: Credentials,
    workdir: Option<TempDir>,
    surface: Option<S>,
    catalog: CheckboxCatalog,
    mapping: ChannelMapping,
    options: SessionOptions,
    cancel: CancellationToken,
    logger: Logger,
}

impl Session<ChromeSurface> {
    /// Start Chrome with downloads going to a fresh working directory.
    pub async fn launch(
        settings: &Settings,
        credentials: Credentials,
        catalog: CheckboxCatalog,
        mapping: ChannelMapping,
        logger: Logger,
    ) -> Result<Self> {
        let options = SessionOptions::from_settings(settings)?;
        let workdir = create_workdir(settings.downloads.temp_parent.as_deref())?;
        let surface = ChromeSurface::launch(
            settings.browser.connection_mode(),
            workdir.path(),
            logger.child("chrome"),
        )
        .await?;

        Ok(Self::new(
            credentials,
            workdir,
            surface,
            catalog,
            mapping,
            options,
            logger,
        ))
    }
}

impl<S: InteractionSurface> Session<S> {
    pub fn new(
        credentials: Credentials,
        workdir: TempDir,
        surface: S,
        catalog: CheckboxCatalog,
        mapping: ChannelMapping,
        options: SessionOptions,
        logger: Logger,
    ) -> Self {
        logger.debug(format_args!("Session working directory {}", workdir.path().display()));
        Self {
            credentials,
            workdir: Some(workdir),
            surface: Some(surface),
            catalog,
            mapping,
            options,
            cancel: CancellationToken::new(),
            logger,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.surface.is_none()
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_ref().map(TempDir::path)
    }

    pub fn catalog(&self) -> &CheckboxCatalog {
        &self.catalog
    }

    /// Token aborting the download wait in progress. A cancelled wait
    /// closes the session.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn parts(&self) -> Result<(&S, &Path)> {
        match (&self.surface, &self.workdir) {
            (Some(surface), Some(workdir)) => Ok((surface, workdir.path())),
            _ => Err(PpmiError::SessionClosed),
        }
    }

    fn diagnostics<'a>(&self, surface: &'a S) -> SurfaceDiagnostics<'a, S> {
        SurfaceDiagnostics::new(
            surface,
            self.options.diagnostics_dir.clone(),
            self.logger.child("diagnostics"),
        )
    }

    fn navigator<'a>(&self, surface: &'a S, diagnostics: &'a dyn Diagnostics) -> Navigator<'a, S> {
        Navigator::new(
            surface,
            self.options.urls.clone(),
            self.options.policy,
            self.logger.child("navigator"),
        )
        .with_settle(self.options.settle)
        .with_diagnostics(diagnostics)
    }

    /// Log in and land on the project home page.
    async fn enter_portal(&self, navigator: &Navigator<'_, S>) -> Result<()> {
        navigator.login(&self.credentials).await?;
        navigator.navigate(&self.options.urls.home).await
    }

    /// Wait for the download of `task`, then move it to its destination.
    async fn collect(&self, workdir: &Path, task: &DownloadTask) -> Result<Vec<RoutedFile>> {
        let poller = CompletionPoller::with_markers(
            self.options.in_progress_markers.clone(),
            self.logger.child("poller"),
        );
        let names = poller.wait(workdir, task, &self.cancel).await?;

        let router = FileRouter::new(task.accepted.clone(), self.logger.child("router"));
        let source = workdir.to_path_buf();
        let destination = task.destination.clone();
        let finished = names.clone();
        let routed = tokio::task::spawn_blocking(move || router.route(&source, &names, &destination))
            .await
            .map_err(|e| PpmiError::Io(std::io::Error::other(e)))?;

        // Unrouted leftovers would be taken for the next download
        if routed.is_err() {
            for name in &finished {
                let path = workdir.join(name);
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        self.logger
                            .warn(format_args!("Failed to discard {}: {}", path.display(), e));
                    }
                }
            }
        }
        routed
    }

    /// Empty the working directory before an export is triggered.
    fn clear_workdir(&self, workdir: &Path) -> Result<()> {
        for entry in std::fs::read_dir(workdir)? {
            let entry = entry?;
            let path = entry.path();
            self.logger
                .warn(format_args!("Discarding stale download {}", path.display()));
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Close the session when `result` is an error that leaves it unusable.
    async fn settle_outcome<T>(&mut self, operation: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal_to_session() {
                self.logger
                    .error(format_args!("{} failed, closing session: {}", operation, e));
                // Budget exhaustion already captured one
                if !matches!(e, PpmiError::RetryBudgetExceeded { .. }) {
                    self.capture_final_state(operation).await;
                }
                if let Err(close_err) = self.close().await {
                    self.logger
                        .warn(format_args!("Error while closing session: {}", close_err));
                }
            }
        }
        result
    }

    async fn capture_final_state(&self, operation: &str) {
        let Some(surface) = &self.surface else {
            return;
        };
        match self.diagnostics(surface).capture(operation).await {
            Ok(path) => self
                .logger
                .info(format_args!("Diagnostic saved to {}", path.display())),
            Err(e) => self
                .logger
                .warn(format_args!("Could not capture diagnostic: {}", e)),
        }
    }

    fn task(
        &self,
        identifiers: Vec<String>,
        accepted: ExtensionSet,
        expected: usize,
        timeout: Duration,
        destination: &Path,
    ) -> Result<DownloadTask> {
        DownloadTask::new(
            identifiers,
            accepted,
            expected,
            timeout,
            self.options.poll_interval,
            destination,
        )
    }

    /// Download study-data files, named by guessed or real file name.
    ///
    /// Every identifier is resolved before the portal is touched.
    pub async fn download_metadata(
        &mut self,
        identifiers: &[String],
        destination: &Path,
        timeout: Option<Duration>,
    ) -> Result<Vec<RoutedFile>> {
        self.parts()?;
        let checkbox_ids = self.catalog.resolve_all(identifiers, &self.mapping)?;
        let task = self.task(
            identifiers.to_vec(),
            ExtensionSet::metadata(),
            1,
            timeout.unwrap_or(self.options.metadata_timeout),
            destination,
        )?;

        let result = self.run_metadata(&checkbox_ids, &task).await;
        self.settle_outcome("metadata download", result).await
    }

    async fn run_metadata(&self, checkbox_ids: &[String], task: &DownloadTask) -> Result<Vec<RoutedFile>> {
        let (surface, workdir) = self.parts()?;
        let diagnostics = self.diagnostics(surface);
        let navigator = self.navigator(surface, &diagnostics);

        self.clear_workdir(workdir)?;
        self.enter_portal(&navigator).await?;
        navigator.click_chain(METADATA_CHAIN).await?;

        // The page renders each table twice (category and flat list)
        for id in checkbox_ids {
            navigator.click_first(&Locator::id(id.as_str()), 2).await?;
        }
        navigator
            .click_button(&Locator::id("downloadBtn"), "Download")
            .await?;

        self.collect(workdir, task).await
    }

    /// Download the images of `subject_ids` plus their metadata.
    pub async fn download_imaging_data(
        &mut self,
        subject_ids: &[String],
        destination: &Path,
        format: ImageFormat,
        timeout: Option<Duration>,
    ) -> Result<Vec<RoutedFile>> {
        if subject_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.parts()?;
        let task = self.task(
            subject_ids.to_vec(),
            ExtensionSet::imaging(),
            3,
            timeout.unwrap_or(self.options.imaging_timeout),
            destination,
        )?;

        let result = self.run_imaging(&task, format).await;
        self.settle_outcome("imaging download", result).await
    }

    async fn run_imaging(&self, task: &DownloadTask, format: ImageFormat) -> Result<Vec<RoutedFile>> {
        let (surface, workdir) = self.parts()?;
        let diagnostics = self.diagnostics(surface);
        let navigator = self.navigator(surface, &diagnostics);
        let collection = format!(
            "images-{}",
            workdir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        );

        self.clear_workdir(workdir)?;
        self.enter_portal(&navigator).await?;
        navigator.click_chain(ADVANCED_SEARCH_CHAIN).await?;

        navigator
            .enter_data(&Locator::id("subjectIdText"), &task.identifiers.join(","), "Subject ids")
            .await?;
        navigator
            .click_button(&Locator::id("advSearchQuery"), "Search")
            .await?;
        navigator
            .perform_named("Search_AdvancedImageSearchbeta_SelectAll")
            .await?;
        navigator
            .click_button(&Locator::id("advResultAddCollectId"), "Add to collection")
            .await?;
        navigator
            .enter_data(&Locator::id("nameText"), &collection, "Collection name")
            .await?;
        navigator
            .click_button(&Locator::id("nameText"), "Collection name")
            .await?;
        navigator
            .perform_named("Search_AdvancedImageSearchbeta_AddToCollection_OK")
            .await?;

        navigator.click_button(&Locator::id("export"), "Export").await?;
        navigator
            .click_button(&Locator::id("selectAllCheckBox"), "Select all")
            .await?;
        navigator
            .click_button(&Locator::id(format.button_id()), &format.to_string())
            .await?;
        navigator
            .click_button(&Locator::id("simple-download-button"), "Download")
            .await?;

        navigator
            .click_button(&Locator::partial_link_text("Zip File"), "Zip File")
            .await?;
        navigator
            .click_button(&Locator::partial_link_text("Metadata"), "Metadata")
            .await?;

        self.collect(workdir, task).await
    }

    /// Download the listing of available 3D T1 scans; returns its file name.
    pub async fn download_3d_t1_info(
        &mut self,
        destination: &Path,
        timeout: Option<Duration>,
    ) -> Result<String> {
        self.parts()?;
        let task = self.task(
            Vec::new(),
            ExtensionSet::csv(),
            1,
            timeout.unwrap_or(self.options.t1_info_timeout),
            destination,
        )?;

        let result = self.run_t1_info(&task).await;
        let routed = self.settle_outcome("3D T1 info download", result).await?;
        routed
            .first()
            .map(|file| file.name().to_string())
            .ok_or_else(|| PpmiError::PermanentFailure("3D T1 listing produced no file".to_string()))
    }

    async fn run_t1_info(&self, task: &DownloadTask) -> Result<Vec<RoutedFile>> {
        let (surface, workdir) = self.parts()?;
        let diagnostics = self.diagnostics(surface);
        let navigator = self.navigator(surface, &diagnostics);

        self.clear_workdir(workdir)?;
        self.enter_portal(&navigator).await?;
        navigator.click_chain(ADVANCED_SEARCH_CHAIN).await?;

        navigator
            .click_button(&Locator::id("imgProtocol_checkBox1.Acquisition_Type.3D"), "3D")
            .await?;
        for column in T1_DISPLAY_COLUMNS {
            navigator.click_button(&Locator::id(*column), column).await?;
        }
        navigator
            .click_button(&Locator::id("advSearchQuery"), "Search")
            .await?;
        navigator
            .click_button(
                &Locator::xpath("//*[@type=\"button\" and @value=\"CSV Download\"]"),
                "CSV Download",
            )
            .await?;

        self.collect(workdir, task).await
    }

    /// Crawl the study-data page into a guessed name -> checkbox id table,
    /// written to `cache_file` and used by later metadata downloads.
    pub async fn crawl_study_data(&mut self, cache_file: &Path) -> Result<BTreeMap<String, String>> {
        self.parts()?;
        let result = self.run_crawl(METADATA_CHAIN, cache_file, true).await;
        let table = self.settle_outcome("study data crawl", result).await?;
        self.catalog = CheckboxCatalog::from_map(table.clone());
        Ok(table)
    }

    /// Crawl the advanced search page into a criterion label -> checkbox id table.
    pub async fn crawl_advanced_search(&mut self, cache_file: &Path) -> Result<BTreeMap<String, String>> {
        self.parts()?;
        let result = self.run_crawl(ADVANCED_SEARCH_CHAIN, cache_file, false).await;
        self.settle_outcome("advanced search crawl", result).await
    }

    async fn run_crawl(
        &self,
        chain: &[&str],
        cache_file: &Path,
        study_data: bool,
    ) -> Result<BTreeMap<String, String>> {
        let (surface, _) = self.parts()?;
        let diagnostics = self.diagnostics(surface);
        let navigator = self.navigator(surface, &diagnostics);

        self.enter_portal(&navigator).await?;
        navigator.click_chain(chain).await?;
        let html = navigator.page_source().await?;

        let crawler = CheckboxCrawler::new(self.logger.child("crawl"));
        let table = if study_data {
            crawler.study_data(&html)
        } else {
            crawler.checkboxes(&html)
        };
        write_table(cache_file, &table)?;
        self.logger.info(format_args!(
            "Wrote {} entries to {}",
            table.len(),
            cache_file.display()
        ));
        Ok(table)
    }

    /// Close the surface and remove the working directory. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        let mut first_error = None;

        if let Some(mut surface) = self.surface.take() {
            if let Err(e) = surface.close().await {
                self.logger.warn(format_args!("Failed to close surface: {}", e));
                first_error = Some(PpmiError::from(e));
            }
        }
        if let Some(workdir) = self.workdir.take() {
            let path = workdir.path().to_path_buf();
            if let Err(e) = workdir.close() {
                self.logger
                    .warn(format_args!("Failed to remove {}: {}", path.display(), e));
                if first_error.is_none() {
                    first_error = Some(PpmiError::Io(e));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_default_settings() {
        let options = SessionOptions::from_settings(&Settings::default()).unwrap();
        assert_eq!(options.metadata_timeout, Duration::from_secs(120));
        assert_eq!(options.imaging_timeout, Duration::from_secs(600));
        assert_eq!(options.policy.max_trials(), 30);
        assert_eq!(options.urls, PortalUrls::ida());
    }

    #[test]
    fn test_zero_trials_rejected_in_options() {
        let mut settings = Settings::default();
        settings.retry.max_trials = 0;
        assert!(matches!(
            SessionOptions::from_settings(&settings),
            Err(PpmiError::Config(_))
        ));
    }

    #[test]
    fn test_workdir_under_parent() {
        let parent = tempfile::tempdir().unwrap();
        let workdir = create_workdir(Some(&parent.path().join("downloads"))).unwrap();
        assert!(workdir.path().is_absolute());
        assert!(workdir
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("ppmi-"));
    }
}
