//! `imagespy children` command.

use clap::Args;
use imagespy_core::model::Image;
use imagespy_runtime::store::{ImageGetOptions, Repositories};
use imagespy_runtime::ImageReference;

use crate::context::Context;
use crate::output;

#[derive(Args)]
pub struct ChildrenArgs {
    /// Stored image, as digest (sha256:...) or tagged reference
    pub image: String,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: ChildrenArgs, context: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let image = find_image(context, &args.image)?;
    let children = context.scraper.provenance().children(image.id)?;

    if args.json {
        println!("{}", output::to_json(&children)?);
    } else {
        println!("{}", output::image_table(&children));
    }
    Ok(())
}

/// Look up a stored image by digest, or by repository name and tag.
fn find_image(context: &Context, image: &str) -> Result<Image, Box<dyn std::error::Error>> {
    let options = if image.starts_with("sha256:") {
        ImageGetOptions::by_digest(image)
    } else {
        let reference = ImageReference::parse_with_registry(image, context.default_registry())?;
        match &reference.digest {
            Some(digest) => ImageGetOptions::by_digest(digest.as_str()),
            None => ImageGetOptions {
                name: Some(reference.repository_name()),
                tag_name: Some(reference.tag_or_default().to_string()),
                ..Default::default()
            },
        }
    };
    Ok(context.store.images().get(&options)?)
}
