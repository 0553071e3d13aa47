//! Portal navigation
//!
//! Menu entries of the portal are described as data: a name, how to find the
//! element to click, and what must be true afterwards. Performing an action
//! clicks until the post-condition holds, bounded by [`RetryableAction`].

use crate::browser::{InteractionResult, InteractionSurface, Locator};
use crate::config::Credentials;
use crate::diagnostics::Diagnostics;
use crate::error::{InteractionError, PpmiError, Result};
use crate::logging::Logger;
use crate::retry::{RetryPolicy, RetryableAction};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Entry points of the portal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalUrls {
    pub main: String,
    pub home: String,
    pub login: String,
    pub study_data: String,
}

impl PortalUrls {
    pub fn ida() -> Self {
        Self::with_base("https://ida.loni.usc.edu")
    }

    /// Same paths under another origin (used against a local stand-in).
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            main: format!("{}/login.jsp?project=PPMI", base),
            home: format!("{}/home/projectPage.jsp?project=PPMI", base),
            login: format!("{}/explore/jsp/common/login.jsp?project=PPMI", base),
            study_data: format!("{}/pages/access/studyData.jsp", base),
        }
    }
}

impl Default for PortalUrls {
    fn default() -> Self {
        Self::ida()
    }
}

/// What must hold once an action has been performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Postcondition {
    /// Click once, check nothing
    None,
    ElementPresent(Locator),
    UrlStartsWith(String),
    UrlEquals(String),
    /// Every pair must appear in the query string
    UrlQuery(Vec<(String, String)>),
}

impl Postcondition {
    fn query(pairs: &[(&str, &str)]) -> Self {
        Postcondition::UrlQuery(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiAction {
    pub name: String,
    pub locator: Locator,
    pub postcondition: Postcondition,
}

impl UiAction {
    pub fn new(name: impl Into<String>, locator: Locator, postcondition: Postcondition) -> Self {
        Self {
            name: name.into(),
            locator,
            postcondition,
        }
    }
}

/// Named UI actions, keyed by their chain name (`Download_StudyData_ALL`).
#[derive(Debug, Clone, Default)]
pub struct ActionTable {
    actions: HashMap<String, UiAction>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, action: UiAction) {
        self.actions.insert(action.name.clone(), action);
    }

    pub fn get(&self, name: &str) -> Option<&UiAction> {
        self.actions.get(name)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Menu catalog of the portal.
    pub fn portal(urls: &PortalUrls) -> Self {
        let mut table = Self::new();

        table.insert(UiAction::new(
            "Download",
            Locator::class_name("ida-menu-option.sub-menu.download"),
            Postcondition::ElementPresent(Locator::class_name(
                "ida-menu-option.sub-menu.download.active",
            )),
        ));
        table.insert(UiAction::new(
            "Download_StudyData",
            Locator::text("Study Data"),
            Postcondition::UrlStartsWith(urls.study_data.clone()),
        ));
        table.insert(UiAction::new(
            "Download_StudyData_ALL",
            Locator::id("ygtvlabelel71"),
            Postcondition::UrlEquals(urls.study_data.clone()),
        ));
        table.insert(UiAction::new(
            "Download_ImageCollections",
            Locator::text("Image Collections"),
            Postcondition::query(&[("page", "DOWNLOADS"), ("subPage", "IMAGE_COLLECTIONS")]),
        ));
        table.insert(UiAction::new(
            "Download_GeneticData",
            Locator::text("Genetic Data"),
            Postcondition::query(&[("page", "DOWNLOADS"), ("subPage", "GENETIC_DATA")]),
        ));

        table.insert(UiAction::new(
            "Search",
            Locator::class_name("ida-menu-option.sub-menu.search"),
            Postcondition::ElementPresent(Locator::class_name(
                "ida-menu-option.sub-menu.search.active",
            )),
        ));
        table.insert(UiAction::new(
            "Search_SimpleImageSearch",
            Locator::text("Simple Image Search"),
            Postcondition::query(&[("page", "SEARCH"), ("subPage", "SIMPLE_QUERY")]),
        ));
        table.insert(UiAction::new(
            "Search_AdvancedImageSearch",
            Locator::text("Advanced Image Search"),
            Postcondition::query(&[("page", "SEARCH"), ("subPage", "ADV_QUERY")]),
        ));
        table.insert(UiAction::new(
            "Search_AdvancedImageSearchbeta",
            Locator::text("Advanced Image Search (beta)"),
            Postcondition::query(&[("page", "SEARCH"), ("subPage", "NEW_ADV_QUERY")]),
        ));
        table.insert(UiAction::new(
            "Search_AdvancedImageSearchbeta_SelectAll",
            Locator::css("input[type=\"checkbox\"][id*=\"selectAll\"]"),
            Postcondition::None,
        ));
        table.insert(UiAction::new(
            "Search_AdvancedImageSearchbeta_AddToCollection_OK",
            Locator::xpath("//button[normalize-space()='OK']"),
            Postcondition::None,
        ));

        table
    }
}

/// Strip spaces and parentheses from a menu label: `Advanced Image Search (beta)`
/// becomes `AdvancedImageSearchbeta`.
pub fn clean_label(label: &str) -> String {
    label
        .chars()
        .filter(|c| !matches!(c, '(' | ')' | ' '))
        .collect()
}

/// Action keys for a chain of menu labels, one per prefix.
pub fn chain_keys(labels: &[&str]) -> Vec<String> {
    let mut prefix: Vec<String> = Vec::with_capacity(labels.len());
    labels
        .iter()
        .map(|label| {
            prefix.push(clean_label(label));
            prefix.join("_")
        })
        .collect()
}

/// True when every `(key, value)` pair appears in the query string of `url`.
pub fn check_url_query(url: &str, expected: &[(String, String)]) -> bool {
    let parsed = match Url::parse(url) {
        Ok(u) => u,
        Err(_) => return false,
    };
    let query: HashMap<String, String> = parsed.query_pairs().into_owned().collect();
    expected
        .iter()
        .all(|(key, value)| query.get(key).map(String::as_str) == Some(value.as_str()))
}

/// Drives the portal UI through an [`InteractionSurface`].
pub struct Navigator<'a, S: InteractionSurface> {
    surface: &'a S,
    table: ActionTable,
    urls: PortalUrls,
    policy: RetryPolicy,
    settle: Duration,
    diagnostics: Option<&'a dyn Diagnostics>,
    logger: Logger,
}

impl<'a, S: InteractionSurface> Navigator<'a, S> {
    pub fn new(surface: &'a S, urls: PortalUrls, policy: RetryPolicy, logger: Logger) -> Self {
        Self {
            surface,
            table: ActionTable::portal(&urls),
            urls,
            policy,
            settle: Duration::from_secs(1),
            diagnostics: None,
            logger,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: &'a dyn Diagnostics) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn with_table(mut self, table: ActionTable) -> Self {
        self.table = table;
        self
    }

    pub fn urls(&self) -> &PortalUrls {
        &self.urls
    }

    fn retry(&self) -> RetryableAction<'a> {
        let action = RetryableAction::new(self.policy, self.logger.child("retry"));
        match self.diagnostics {
            Some(diagnostics) => action.with_diagnostics(diagnostics),
            None => action,
        }
    }

    async fn holds(&self, postcondition: &Postcondition) -> InteractionResult<bool> {
        match postcondition {
            Postcondition::None => Ok(false),
            Postcondition::ElementPresent(locator) => {
                Ok(!self.surface.find_all(locator).await?.is_empty())
            }
            Postcondition::UrlStartsWith(prefix) => {
                Ok(self.surface.current_url().await?.starts_with(prefix.as_str()))
            }
            Postcondition::UrlEquals(expected) => Ok(self.surface.current_url().await? == *expected),
            Postcondition::UrlQuery(pairs) => {
                Ok(check_url_query(&self.surface.current_url().await?, pairs))
            }
        }
    }

    /// Click `action` until its post-condition holds.
    pub async fn perform(&self, action: &UiAction) -> Result<()> {
        self.logger.debug(format_args!("Performing {}", action.name));
        let unchecked = action.postcondition == Postcondition::None;

        self.retry()
            .run(&action.name, || async move {
                if !unchecked && self.holds(&action.postcondition).await? {
                    return Ok(());
                }

                let element = self.surface.find(&action.locator).await?;
                self.surface.click(&element).await?;
                if unchecked {
                    return Ok(());
                }

                tokio::time::sleep(self.settle).await;
                if self.holds(&action.postcondition).await? {
                    Ok(())
                } else {
                    Err(InteractionError::transient(format!(
                        "{:?} not met after clicking {}",
                        action.postcondition, action.locator
                    )))
                }
            })
            .await
    }

    /// Perform a table action by name.
    pub async fn perform_named(&self, name: &str) -> Result<()> {
        let action = self
            .table
            .get(name)
            .ok_or_else(|| PpmiError::PermanentFailure(format!("unknown UI action '{}'", name)))?;
        self.perform(action).await
    }

    /// Click through a menu path, e.g. `["Download", "Study Data", "ALL"]`.
    ///
    /// Every key is looked up before anything is clicked.
    pub async fn click_chain(&self, labels: &[&str]) -> Result<()> {
        let keys = chain_keys(labels);
        let actions = keys
            .iter()
            .map(|key| {
                self.table.get(key).ok_or_else(|| {
                    PpmiError::PermanentFailure(format!("unknown UI action '{}'", key))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        for action in actions {
            self.perform(action).await?;
        }
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> Result<()> {
        self.retry()
            .run(&format!("navigate {}", url), || async move {
                self.surface.navigate(url).await
            })
            .await
    }

    /// Wait until `locator` matches an element.
    pub async fn wait_for_element(&self, locator: &Locator) -> Result<S::Element> {
        self.retry()
            .run(&format!("wait for {}", locator), || async move {
                self.surface.find(locator).await
            })
            .await
    }

    pub async fn click_button(&self, locator: &Locator, debug_name: &str) -> Result<()> {
        self.logger
            .debug(format_args!("Click button {} {}", locator, debug_name));
        self.retry()
            .run(&format!("click {}", locator), || async move {
                let element = self.surface.find(locator).await?;
                self.surface.click(&element).await
            })
            .await
    }

    pub async fn enter_data(&self, locator: &Locator, text: &str, debug_name: &str) -> Result<()> {
        self.logger
            .debug(format_args!("Enter data {} {}", locator, debug_name));
        self.retry()
            .run(&format!("type into {}", locator), || async move {
                let element = self.surface.find(locator).await?;
                self.surface.type_text(&element, text).await
            })
            .await
    }

    /// Click the first `limit` elements matching `locator`; at least one must exist.
    ///
    /// Each element is retried on its own, so a failure on one never clicks
    /// the ones before it a second time.
    pub async fn click_first(&self, locator: &Locator, limit: usize) -> Result<usize> {
        let mut clicked = 0;
        while clicked < limit {
            let index = clicked;
            let done = self
                .retry()
                .run(&format!("click #{} of {}", index + 1, locator), || async move {
                    let elements = self.surface.find_all(locator).await?;
                    match elements.get(index) {
                        Some(element) => self.surface.click(element).await.map(|_| true),
                        None if index == 0 => Err(InteractionError::transient(format!(
                            "no element matches {}",
                            locator
                        ))),
                        None => Ok(false),
                    }
                })
                .await?;
            if !done {
                break;
            }
            clicked += 1;
        }
        Ok(clicked)
    }

    pub async fn page_source(&self) -> Result<String> {
        self.retry()
            .run("read page source", || async move { self.surface.page_source().await })
            .await
    }

    async fn accept_cookie_policy(&self) -> Result<()> {
        self.navigate(&self.urls.main).await?;

        // The banner is absent once accepted, so a few tries are enough
        let policy = RetryPolicy::new(3u32.min(self.policy.max_trials()), self.policy.backoff())?;
        let banner = Locator::class_name("ida-cookie-policy-accept");
        let outcome = RetryableAction::new(policy, self.logger.child("retry"))
            .run("accept cookie policy", || {
                let banner = &banner;
                async move {
                    let element = self.surface.find(banner).await?;
                    self.surface.click(&element).await
                }
            })
            .await;

        match outcome {
            Err(e @ PpmiError::PermanentFailure(_)) => Err(e),
            Err(e) => {
                self.logger
                    .debug(format_args!("Cookie policy already accepted ({})", e));
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// Log into the portal.
    pub async fn login(&self, credentials: &Credentials) -> Result<()> {
        self.accept_cookie_policy().await?;
        self.navigate(&self.urls.login).await?;

        let email = Locator::name("userEmail");
        let password = Locator::name("userPassword");
        let button = Locator::tag("button");

        self.wait_for_element(&email).await?;
        self.enter_data(&email, &credentials.login, "Email").await?;
        self.wait_for_element(&password).await?;
        self.enter_data(&password, &credentials.password, "Password")
            .await?;
        self.wait_for_element(&button).await?;
        self.click_button(&button, "Login button").await?;

        tokio::time::sleep(self.settle).await;
        let rejected = self
            .surface
            .find_all(&Locator::class_name("register-input-error-msg.invalid-login"))
            .await
            .map(|found| !found.is_empty())
            .unwrap_or(false);
        if rejected {
            self.logger.error("Login Failed");
            return Err(PpmiError::PermanentFailure("login rejected".to_string()));
        }

        self.logger.info("Login Successful");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_keys() {
        assert_eq!(
            chain_keys(&["Download", "Study Data", "ALL"]),
            vec!["Download", "Download_StudyData", "Download_StudyData_ALL"]
        );
        assert_eq!(
            chain_keys(&["Search", "Advanced Image Search (beta)"]),
            vec!["Search", "Search_AdvancedImageSearchbeta"]
        );
    }

    #[test]
    fn test_portal_table_covers_menu_chains() {
        let table = ActionTable::portal(&PortalUrls::ida());
        for chain in [
            &["Download", "Study Data", "ALL"][..],
            &["Download", "Image Collections"][..],
            &["Download", "Genetic Data"][..],
            &["Search", "Simple Image Search"][..],
            &["Search", "Advanced Image Search"][..],
            &["Search", "Advanced Image Search (beta)"][..],
        ] {
            for key in chain_keys(chain) {
                assert!(table.get(&key).is_some(), "missing {}", key);
            }
        }
    }

    #[test]
    fn test_check_url_query() {
        let url = "https://ida.loni.usc.edu/home/projectPage.jsp?project=PPMI&page=SEARCH&subPage=NEW_ADV_QUERY";
        let pairs = |p: &[(&str, &str)]| -> Vec<(String, String)> {
            p.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        };
        assert!(check_url_query(url, &pairs(&[("page", "SEARCH"), ("subPage", "NEW_ADV_QUERY")])));
        assert!(!check_url_query(url, &pairs(&[("subPage", "ADV_QUERY")])));
        assert!(!check_url_query(url, &pairs(&[("missing", "")])));
        assert!(!check_url_query("not a url", &pairs(&[("page", "SEARCH")])));
    }

    /// Elements are numbered by position; the second one fails its first click.
    struct FlakyList {
        clicks: std::sync::Mutex<Vec<usize>>,
        failed_once: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl InteractionSurface for FlakyList {
        type Element = usize;

        async fn navigate(&self, _url: &str) -> InteractionResult<()> {
            Ok(())
        }

        async fn find(&self, _locator: &Locator) -> InteractionResult<usize> {
            Ok(1)
        }

        async fn find_all(&self, _locator: &Locator) -> InteractionResult<Vec<usize>> {
            Ok(vec![1, 2, 3])
        }

        async fn click(&self, element: &usize) -> InteractionResult<()> {
            if *element == 2 && !self.failed_once.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(InteractionError::transient("click intercepted"));
            }
            self.clicks.lock().unwrap().push(*element);
            Ok(())
        }

        async fn type_text(&self, _element: &usize, _text: &str) -> InteractionResult<()> {
            Ok(())
        }

        async fn current_url(&self) -> InteractionResult<String> {
            Ok(String::new())
        }

        async fn page_source(&self) -> InteractionResult<String> {
            Ok(String::new())
        }

        async fn screenshot(&self) -> InteractionResult<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn close(&mut self) -> InteractionResult<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_click_first_retries_only_the_failed_element() -> anyhow::Result<()> {
        let surface = FlakyList {
            clicks: std::sync::Mutex::new(Vec::new()),
            failed_once: std::sync::atomic::AtomicBool::new(false),
        };
        let policy = RetryPolicy::new(3, Duration::from_millis(10))?;
        let navigator = Navigator::new(&surface, PortalUrls::ida(), policy, Logger::silent());

        let clicked = navigator.click_first(&Locator::id("1001"), 2).await?;

        assert_eq!(clicked, 2);
        assert_eq!(*surface.clicks.lock().unwrap(), vec![1, 2]);
        Ok(())
    }

    #[test]
    fn test_portal_urls_with_base() {
        let urls = PortalUrls::with_base("http://127.0.0.1:8080/");
        assert_eq!(urls.study_data, "http://127.0.0.1:8080/pages/access/studyData.jsp");
        assert_eq!(PortalUrls::ida().main, "https://ida.loni.usc.edu/login.jsp?project=PPMI");
    }
}
