pub mod commands;
pub mod ingest;
pub mod review;

pub mod cmd {
    pub use super::commands::Cli;
}
