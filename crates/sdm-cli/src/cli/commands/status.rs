use sdm_core::controller::Controller;

use super::super::view::human;

pub fn run_status(controller: &Controller) {
    let items = controller.list();
    if items.is_empty() {
        println!("no items");
        return;
    }
    for item in items {
        let total = item.total_size();
        let size = if total > 0 {
            human(total)
        } else {
            "?".to_string()
        };
        println!(
            "{}  {:<14} {:>10}  {}",
            &item.uid[..8.min(item.uid.len())],
            item.status().to_string(),
            size,
            item.target_file().display()
        );
    }
}
