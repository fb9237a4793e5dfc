//! `imagespy scrape` command.

use clap::Args;
use imagespy_runtime::scrape_reference;

use crate::context::Context;
use crate::output;

#[derive(Args)]
pub struct ScrapeArgs {
    /// Image reference, e.g. nginx:1.25 or ghcr.io/org/app:2
    pub image: String,
}

pub async fn execute(args: ScrapeArgs, context: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let (image, latest) = scrape_reference(
        context.scraper.as_ref(),
        &args.image,
        context.default_registry(),
    )
    .await?;

    let result = serde_json::json!({
        "image": image,
        "latest": latest,
    });
    println!("{}", output::to_json(&result)?);
    Ok(())
}
