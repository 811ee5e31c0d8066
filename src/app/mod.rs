pub mod config;
pub mod data_io;
pub mod dedupe;
pub mod error;
pub mod fetch;
pub mod harvest;
pub mod normalize;
pub mod parser;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod scan;
pub mod types;
pub mod urls;

#[cfg(test)]
mod testing;

pub use runtime::run;
pub use types::Cli;
