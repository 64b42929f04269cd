pub mod config;
pub mod events;
pub mod rewrite;
pub mod types;

pub use config::Config;
pub use events::{UiEvent, UiEventType};
pub use rewrite::rewrite_for_environment;
pub use types::*;
