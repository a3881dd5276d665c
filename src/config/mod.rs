//! Pipeline settings and configuration management

mod settings;

pub use settings::*;
