use anyhow::Result;
use sdm_core::controller::Controller;

use super::super::resolve_uid;

pub async fn run_resume(controller: &Controller, uid: &str) -> Result<()> {
    let uid = resolve_uid(controller, uid)?;
    if controller.resume(&uid) {
        controller.save().await?;
        println!("queued {uid}; start it with `sdm run`");
    } else {
        println!("{uid} cannot be resumed from its current state");
    }
    Ok(())
}
