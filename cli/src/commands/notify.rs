//! `imagespy notify` command.

use std::io::Read;
use std::path::PathBuf;

use clap::Args;
use imagespy_core::event::events;
use imagespy_runtime::{NotificationHandler, EVENTS_MEDIA_TYPE};

use crate::context::Context;

#[derive(Args)]
pub struct NotifyArgs {
    /// Envelope file; reads stdin when omitted
    pub file: Option<PathBuf>,

    /// Content type the envelope was delivered with
    #[arg(long, default_value = EVENTS_MEDIA_TYPE)]
    pub content_type: String,
}

pub async fn execute(args: NotifyArgs, context: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let payload = match &args.file {
        Some(path) => std::fs::read(path)?,
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            buf
        }
    };

    let mut promotions = context
        .events
        .subscribe_filtered(|e| e.key == events::TAG_LATEST_PROMOTED);
    let handler = NotificationHandler::new(context.scraper.clone());
    let handles = handler.handle(&args.content_type, &payload);
    let scheduled = handles.len();
    for handle in handles {
        handle.await?;
    }

    println!("processed {} pushed image(s)", scheduled);
    for event in promotions.drain() {
        if let (Some(name), Some(tag)) = (event.field("name"), event.field("tag")) {
            println!(
                "latest for {}: {}",
                name.as_str().unwrap_or_default(),
                tag.as_str().unwrap_or_default()
            );
        }
    }
    Ok(())
}
