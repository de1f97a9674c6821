mod cli;
mod output;

pub use cli::Cli;
