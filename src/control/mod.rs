//! Glue between the cloud command/shadow channel and the pipeline

pub mod commands;
pub mod serve;
pub mod shadow;

pub use commands::CommandHandler;
pub use serve::{serve, ServeExit};
pub use shadow::StreamTarget;
