//! In-memory stand-in for the portal
//!
//! Elements are identified by their locator. Clicking an element applies the
//! effects registered for it: changing the URL, revealing another element or
//! dropping a file into the download directory, the way the browser would.

#![allow(dead_code)]

use async_trait::async_trait;
use ppmi_downloader::browser::InteractionResult;
use ppmi_downloader::{InteractionError, InteractionSurface, Locator, PortalUrls};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const BASE_URL: &str = "https://portal.test";

pub fn urls() -> PortalUrls {
    PortalUrls::with_base(BASE_URL)
}

#[derive(Debug, Clone)]
pub enum Effect {
    GoTo(String),
    Show(Locator),
    Download { name: String, content: Vec<u8> },
}

#[derive(Debug, Default)]
pub struct PortalState {
    pub url: String,
    /// Number of elements matching each locator
    pub visible: HashMap<Locator, usize>,
    pub effects: HashMap<Locator, Vec<Effect>>,
    pub page_source: String,
    pub clicks: Vec<Locator>,
    pub typed: Vec<(Locator, String)>,
    pub visited: Vec<String>,
    pub closed: bool,
    pub download_dir: PathBuf,
}

#[derive(Clone)]
pub struct ScriptedPortal {
    state: Arc<Mutex<PortalState>>,
}

impl ScriptedPortal {
    pub fn new(download_dir: &Path) -> Self {
        let state = PortalState {
            url: "about:blank".to_string(),
            page_source: "<html><body></body></html>".to_string(),
            download_dir: download_dir.to_path_buf(),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Portal with a working login form and the Download / Search menus.
    pub fn with_menus(download_dir: &Path) -> Self {
        let portal = Self::new(download_dir);
        let urls = urls();

        portal.show(Locator::name("userEmail"));
        portal.show(Locator::name("userPassword"));
        portal.show(Locator::tag("button"));

        let download_menu = Locator::class_name("ida-menu-option.sub-menu.download");
        portal.show(download_menu.clone());
        portal.on_click(
            download_menu,
            Effect::Show(Locator::class_name("ida-menu-option.sub-menu.download.active")),
        );
        portal.show(Locator::text("Study Data"));
        portal.on_click(
            Locator::text("Study Data"),
            Effect::GoTo(format!("{}?tab=all", urls.study_data)),
        );
        portal.show(Locator::id("ygtvlabelel71"));
        portal.on_click(Locator::id("ygtvlabelel71"), Effect::GoTo(urls.study_data.clone()));

        let search_menu = Locator::class_name("ida-menu-option.sub-menu.search");
        portal.show(search_menu.clone());
        portal.on_click(
            search_menu,
            Effect::Show(Locator::class_name("ida-menu-option.sub-menu.search.active")),
        );
        let advanced = Locator::text("Advanced Image Search (beta)");
        portal.show(advanced.clone());
        portal.on_click(
            advanced,
            Effect::GoTo(format!("{}&page=SEARCH&subPage=NEW_ADV_QUERY", urls.home)),
        );

        portal
    }

    pub fn show(&self, locator: Locator) {
        self.show_many(locator, 1);
    }

    pub fn show_many(&self, locator: Locator, count: usize) {
        self.lock().visible.insert(locator, count);
    }

    pub fn on_click(&self, locator: Locator, effect: Effect) {
        self.lock().effects.entry(locator).or_default().push(effect);
    }

    pub fn clear_effects(&self, locator: &Locator) {
        self.lock().effects.remove(locator);
    }

    /// Show `locator` and make a click on it download `name`.
    pub fn download_on_click(&self, locator: Locator, name: &str, content: &[u8]) {
        self.show(locator.clone());
        self.on_click(
            locator,
            Effect::Download {
                name: name.to_string(),
                content: content.to_vec(),
            },
        );
    }

    pub fn set_page_source(&self, html: &str) {
        self.lock().page_source = html.to_string();
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&PortalState) -> R) -> R {
        f(&self.lock())
    }

    /// Every navigation, click and keystroke seen so far.
    pub fn interactions(&self) -> usize {
        self.with_state(|s| s.visited.len() + s.clicks.len() + s.typed.len())
    }

    pub fn clicks_on(&self, locator: &Locator) -> usize {
        self.with_state(|s| s.clicks.iter().filter(|c| *c == locator).count())
    }

    pub fn is_closed(&self) -> bool {
        self.with_state(|s| s.closed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PortalState> {
        self.state.lock().unwrap()
    }

    fn check_open(state: &PortalState) -> InteractionResult<()> {
        if state.closed {
            Err(InteractionError::permanent("browser connection lost"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl InteractionSurface for ScriptedPortal {
    type Element = Locator;

    async fn navigate(&self, url: &str) -> InteractionResult<()> {
        let mut state = self.lock();
        Self::check_open(&state)?;
        state.visited.push(url.to_string());
        state.url = url.to_string();
        Ok(())
    }

    async fn find(&self, locator: &Locator) -> InteractionResult<Locator> {
        let state = self.lock();
        Self::check_open(&state)?;
        match state.visible.get(locator) {
            Some(count) if *count > 0 => Ok(locator.clone()),
            _ => Err(InteractionError::transient(format!(
                "no element matches {}",
                locator
            ))),
        }
    }

    async fn find_all(&self, locator: &Locator) -> InteractionResult<Vec<Locator>> {
        let state = self.lock();
        Self::check_open(&state)?;
        let count = state.visible.get(locator).copied().unwrap_or(0);
        Ok(vec![locator.clone(); count])
    }

    async fn click(&self, element: &Locator) -> InteractionResult<()> {
        let mut state = self.lock();
        Self::check_open(&state)?;
        state.clicks.push(element.clone());

        let effects = state.effects.get(element).cloned().unwrap_or_default();
        for effect in effects {
            match effect {
                Effect::GoTo(url) => state.url = url,
                Effect::Show(locator) => {
                    state.visible.insert(locator, 1);
                }
                Effect::Download { name, content } => {
                    std::fs::write(state.download_dir.join(name), content)
                        .map_err(|e| InteractionError::permanent(e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    async fn type_text(&self, element: &Locator, text: &str) -> InteractionResult<()> {
        let mut state = self.lock();
        Self::check_open(&state)?;
        state.typed.push((element.clone(), text.to_string()));
        Ok(())
    }

    async fn current_url(&self) -> InteractionResult<String> {
        let state = self.lock();
        Self::check_open(&state)?;
        Ok(state.url.clone())
    }

    async fn page_source(&self) -> InteractionResult<String> {
        let state = self.lock();
        Self::check_open(&state)?;
        Ok(state.page_source.clone())
    }

    async fn screenshot(&self) -> InteractionResult<Vec<u8>> {
        let state = self.lock();
        Self::check_open(&state)?;
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn close(&mut self) -> InteractionResult<()> {
        self.lock().closed = true;
        Ok(())
    }
}
