//! Hot-reloadable gateway settings: data model and concurrently-read store.

pub mod model;
pub mod store;

pub use model::{AccessRight, Account, BasicAuth, Settings};
pub use store::SettingsStore;
