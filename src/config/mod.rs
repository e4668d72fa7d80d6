pub mod ai;
pub mod settings;
pub mod sources;

pub use settings::Settings;
pub use sources::{load_sources_default, load_sources_from, validate as validate_sources};
