pub mod chrome;
pub mod surface;

pub use chrome::{ChromeSurface, ConnectionMode};
pub use surface::{InteractionResult, InteractionSurface, Locator, Selector};
