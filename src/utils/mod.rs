pub mod ids;
pub mod logging;

pub use ids::{gen_id, now_millis};
pub use logging::LoggingConfig;
