pub mod config;
pub mod correlation;
pub mod error;
pub mod history;
pub mod interpreter;
pub mod logger;
pub mod pipeline;
pub mod registry;
pub mod settings;
pub mod template;
