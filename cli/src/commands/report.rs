use colored::*;
use sweepr_common::event::StoredEvent;
use sweepr_core::store;

use super::DbArgs;

/// Prints every stored event for `target`, oldest first, as a JSON array.
pub async fn report(target: &str, db: &DbArgs) -> anyhow::Result<()> {
    let store = store::attach_store(&db.settings()).await?;
    let events: Vec<StoredEvent> = store.events_for_target(target).await;

    eprintln!("{} {} event(s) for {}", "[+]".green().bold(), events.len(), target.bold());
    println!("{}", serde_json::to_string_pretty(&events)?);
    Ok(())
}
