use anyhow::Result;
use sdm_core::controller::Controller;

use super::super::view::StdoutView;

pub async fn run_scheduler(
    controller: &Controller,
    on_complete: Option<String>,
    shutdown: bool,
) -> Result<()> {
    controller.add_observer(Box::new(StdoutView));
    controller.set_completion_command(on_complete);
    controller.set_shutdown_on_complete(shutdown);

    let count = controller.run().await?;
    println!("queue drained, {count} item(s) processed");
    Ok(())
}
