use anyhow::Result;
use sdm_core::controller::Controller;
use sdm_core::item::{StreamDescriptor, Subtypes};
use std::path::Path;

#[allow(clippy::too_many_arguments)]
pub async fn run_add(
    controller: &Controller,
    url: &str,
    folder: &Path,
    name: Option<String>,
    audio_url: Option<String>,
    manifest_url: Option<String>,
    hls: bool,
    at: Option<u64>,
) -> Result<()> {
    let subtypes = Subtypes {
        dash: audio_url.is_some(),
        hls: hls || manifest_url.is_some() || url.contains(".m3u8"),
        ..Default::default()
    };
    let desc = StreamDescriptor {
        url: url.to_string(),
        audio_url,
        manifest_url,
        subtypes,
        ..Default::default()
    };

    let item = controller.add(desc, folder, name)?;
    if let Some(at) = at {
        controller.schedule(&item.uid, at);
    }
    controller.save().await?;
    println!("added {} as {} ({})", item.uid, item.name, item.status());
    Ok(())
}
