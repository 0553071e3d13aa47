pub mod browser;
pub mod config;
pub mod crawl;
pub mod diagnostics;
pub mod error;
pub mod finder;
pub mod logging;
pub mod mapping;
pub mod navigator;
pub mod poller;
pub mod reconcile;
pub mod retry;
pub mod router;
pub mod session;
pub mod task;

//  Re-export commonly used items
pub use browser::{ChromeSurface, ConnectionMode, InteractionSurface, Locator};
pub use config::{Credentials, Settings};
pub use diagnostics::{DiagnosticFrame, Diagnostics, SurfaceDiagnostics};
pub use error::{InteractionError, PpmiError, Result};
pub use finder::{ImageRecord, NiftiFinder};
pub use logging::Logger;
pub use mapping::{ChannelMapping, CheckboxCatalog};
pub use navigator::{ActionTable, Navigator, PortalUrls, Postcondition, UiAction};
pub use poller::{CompletionPoller, DirSnapshot, PollStatus};
pub use reconcile::{Reconciler, Similarity};
pub use retry::{RetryPolicy, RetryableAction};
pub use router::{FileRouter, RoutedFile};
pub use session::{Session, SessionOptions};
pub use task::{DownloadTask, ExtensionSet, ImageFormat};
