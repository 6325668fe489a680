use anyhow::Result;
use sdm_core::controller::Controller;

use super::super::resolve_uid;

pub async fn run_remove(controller: &Controller, uid: &str, delete_files: bool) -> Result<()> {
    let uid = resolve_uid(controller, uid)?;
    if controller.delete(&uid, delete_files) {
        controller.save().await?;
        println!("removed {uid}");
    } else {
        println!("no item {uid}");
    }
    Ok(())
}
