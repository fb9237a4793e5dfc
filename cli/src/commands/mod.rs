//! CLI command definitions and dispatch.

mod children;
mod layer;
mod notify;
mod scrape;
mod update;
mod version;

use clap::{Parser, Subcommand};
use imagespy_core::log::init_tracing;

use crate::context::{load_config, Context, GlobalArgs};

/// Track container images, their tags and layer provenance.
#[derive(Parser)]
#[command(name = "imagespy", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Scrape an image tag and refresh its latest tag
    Scrape(scrape::ScrapeArgs),
    /// Re-scrape stored images
    Update(update::UpdateArgs),
    /// Show the source images of a layer
    Layer(layer::LayerArgs),
    /// Show images built from an image
    Children(children::ChildrenArgs),
    /// Process a registry notification envelope
    Notify(notify::NotifyArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let command = match cli.command {
        Command::Version(args) => return version::execute(args).await,
        command => command,
    };

    let config = load_config(&cli.global)?;
    init_tracing(&config.log)?;
    let context = Context::open(config)?;

    match command {
        Command::Scrape(args) => scrape::execute(args, &context).await,
        Command::Update(args) => update::execute(args, &context).await,
        Command::Layer(args) => layer::execute(args, &context).await,
        Command::Children(args) => children::execute(args, &context).await,
        Command::Notify(args) => notify::execute(args, &context).await,
        Command::Version(args) => version::execute(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "imagespy",
            "update",
            "latest",
            "--workers",
            "4",
            "--registry",
            "dev.local",
            "--insecure",
        ])
        .unwrap();
        assert_eq!(cli.global.registry.as_deref(), Some("dev.local"));
        assert!(cli.global.insecure);
        assert!(matches!(cli.command, Command::Update(_)));
    }

    #[test]
    fn test_log_format_parsed() {
        let cli = Cli::try_parse_from(["imagespy", "--log-format", "json", "version"]).unwrap();
        assert_eq!(
            cli.global.log_format,
            Some(imagespy_core::log::LogFormat::Json)
        );
        assert!(Cli::try_parse_from(["imagespy", "--log-format", "xml", "version"]).is_err());
    }
}
