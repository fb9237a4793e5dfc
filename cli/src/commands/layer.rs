//! `imagespy layer` command.

use clap::Args;

use crate::context::Context;
use crate::output;

#[derive(Args)]
pub struct LayerArgs {
    /// Layer digest (sha256:...)
    pub digest: String,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: LayerArgs, context: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let images = context.scraper.provenance().source_images(&args.digest)?;

    if args.json {
        println!("{}", output::to_json(&images)?);
    } else {
        println!("{}", output::image_table(&images));
    }
    Ok(())
}
