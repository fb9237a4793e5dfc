//! imagespy CLI - scrape container registries into a local image store.

pub mod commands;
pub mod context;
pub mod output;
