//! Settings and credentials
//!
//! Settings come from an optional TOML file where every field has a default.
//! Credentials are looked up in the credentials file, then the environment,
//! then asked for interactively.

use crate::browser::ConnectionMode;
use crate::error::{PpmiError, Result};
use crate::navigator::PortalUrls;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CREDENTIALS_FILE: &str = ".ppmi_config";
pub const LOGIN_ENV: &str = "PPMI_LOGIN";
pub const PASSWORD_ENV: &str = "PPMI_PASSWORD";
pub const DEBUG_PORT_ENV: &str = "PPMI_DEBUG_PORT";

/// Serde helper storing a `Duration` as (fractional) seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub browser: BrowserSettings,
    pub downloads: DownloadSettings,
    pub retry: RetrySettings,
    pub mapping: MappingSettings,
    pub diagnostics_dir: Option<PathBuf>,
    /// Portal origin, `https://ida.loni.usc.edu` unless set
    pub portal_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    pub chrome_path: Option<String>,
    pub no_sandbox: bool,
    /// Connect to an already running Chrome instead of launching one
    pub debug_port: Option<u16>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            no_sandbox: false,
            debug_port: None,
        }
    }
}

impl BrowserSettings {
    pub fn connection_mode(&self) -> ConnectionMode {
        match self.debug_port {
            Some(port) => ConnectionMode::DebugPort(port),
            None => ConnectionMode::Sandboxed {
                chrome_path: self.chrome_path.clone(),
                no_sandbox: self.no_sandbox,
                headless: self.headless,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    /// Parent of the per-session working directory (system temp dir if unset)
    pub temp_parent: Option<PathBuf>,
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    #[serde(with = "duration_secs")]
    pub metadata_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub imaging_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub t1_info_timeout: Duration,
    pub in_progress_markers: Vec<String>,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            temp_parent: None,
            poll_interval: Duration::from_secs(1),
            metadata_timeout: Duration::from_secs(120),
            imaging_timeout: Duration::from_secs(600),
            t1_info_timeout: Duration::from_secs(120),
            in_progress_markers: crate::poller::DEFAULT_IN_PROGRESS_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_trials: u32,
    #[serde(with = "duration_secs")]
    pub backoff: Duration,
    /// Pause after a click before checking its post-condition
    #[serde(with = "duration_secs")]
    pub settle: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_trials: 30,
            backoff: Duration::from_secs(1),
            settle: Duration::from_secs(1),
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> Result<RetryPolicy> {
        RetryPolicy::new(self.max_trials, self.backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingSettings {
    /// Guessed file name -> checkbox id, produced by `crawl study-data`
    pub checkbox_ids: PathBuf,
    /// Guessed file name -> real file name, produced by `build-mapping`
    pub guessed_to_real: PathBuf,
}

impl Default for MappingSettings {
    fn default() -> Self {
        Self {
            checkbox_ids: PathBuf::from("study_data_to_checkbox_id.json"),
            guessed_to_real: PathBuf::from("guessed_to_real.json"),
        }
    }
}

impl Settings {
    /// Load settings from `path`, falling back to defaults when it is absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)?;
                Self::from_toml(&content)?
            }
            Some(path) => {
                return Err(PpmiError::Config(format!(
                    "settings file {} does not exist",
                    path.display()
                )))
            }
            None => Self::default(),
        };

        if settings.browser.debug_port.is_none() {
            if let Ok(port) = std::env::var(DEBUG_PORT_ENV) {
                settings.browser.debug_port = Some(port.parse().map_err(|_| {
                    PpmiError::Config(format!("{} is not a port number: {}", DEBUG_PORT_ENV, port))
                })?);
            }
        }

        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| PpmiError::Config(e.to_string()))
    }

    pub fn portal_urls(&self) -> PortalUrls {
        match &self.portal_url {
            Some(base) => PortalUrls::with_base(base),
            None => PortalUrls::ida(),
        }
    }

    /// Where diagnostic frames go: configured dir, or the user cache dir.
    pub fn diagnostics_dir(&self) -> PathBuf {
        self.diagnostics_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("ppmi-downloader")
                .join("diagnostics")
        })
    }
}

/// Portal login and password.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    File,
    Environment,
    Prompt,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialsFile {
    ppmi: Option<PartialCredentials>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PartialCredentials {
    login: Option<String>,
    password: Option<String>,
}

/// Resolve credentials from (1) `file`, (2) `env`, (3) `prompt`, in that order.
///
/// Credentials that did not come from the file are written back to it so the
/// next run finds them there.
pub fn resolve_credentials<E, P>(file: &Path, env: E, prompt: P) -> Result<(Credentials, CredentialSource)>
where
    E: Fn(&str) -> Option<String>,
    P: FnOnce() -> Result<Credentials>,
{
    if let Some(credentials) = read_credentials_file(file)? {
        return Ok((credentials, CredentialSource::File));
    }

    let (credentials, source) = match (env(LOGIN_ENV), env(PASSWORD_ENV)) {
        (Some(login), Some(password)) => (Credentials { login, password }, CredentialSource::Environment),
        _ => (prompt()?, CredentialSource::Prompt),
    };

    write_credentials_file(file, &credentials)?;
    Ok((credentials, source))
}

/// Credentials from the process environment, prompting on the terminal last.
pub fn load_credentials(file: &Path) -> Result<Credentials> {
    resolve_credentials(file, |key| std::env::var(key).ok(), prompt_credentials)
        .map(|(credentials, _)| credentials)
}

fn read_credentials_file(path: &Path) -> Result<Option<Credentials>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let parsed: CredentialsFile = toml::from_str(&content).map_err(|e| {
        PpmiError::Credentials(format!("{} is not valid TOML: {}", path.display(), e))
    })?;
    Ok(parsed.ppmi.and_then(|section| match (section.login, section.password) {
        (Some(login), Some(password)) => Some(Credentials { login, password }),
        _ => None,
    }))
}

fn write_credentials_file(path: &Path, credentials: &Credentials) -> Result<()> {
    use std::io::Write;

    let file = CredentialsFile {
        ppmi: Some(PartialCredentials {
            login: Some(credentials.login.clone()),
            password: Some(credentials.password.clone()),
        }),
    };
    let content = toml::to_string(&file).map_err(|e| PpmiError::Credentials(e.to_string()))?;
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut out = options.open(path)?;

    // An existing file keeps its mode, so tighten it before writing
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        out.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    out.write_all(content.as_bytes())?;
    Ok(())
}

fn prompt_credentials() -> Result<Credentials> {
    use std::io::{self, Write};

    print!("PPMI login: ");
    io::stdout().flush()?;
    let mut login = String::new();
    io::stdin().read_line(&mut login)?;
    let login = login.trim().to_string();
    if login.is_empty() {
        return Err(PpmiError::Credentials("empty login".to_string()));
    }

    let password = rpassword::prompt_password("PPMI password: ")
        .map_err(|e| PpmiError::Credentials(format!("could not read password: {}", e)))?;

    Ok(Credentials { login, password })
}
