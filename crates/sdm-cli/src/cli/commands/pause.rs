use anyhow::Result;
use sdm_core::controller::Controller;

use super::super::resolve_uid;

pub async fn run_pause(controller: &Controller, uid: &str) -> Result<()> {
    let uid = resolve_uid(controller, uid)?;
    if controller.pause(&uid) {
        controller.save().await?;
        println!("paused {uid}");
    } else {
        println!("{uid} is not in a pausable state");
    }
    Ok(())
}
