pub mod status_handlers;

pub use status_handlers::{health_handler, instances_handler, overview_handler};
