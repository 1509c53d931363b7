//! Upload listing for the `status` command.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteUploadStore;

pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteUploadStore::new(pool.clone());
    let uploads = store.list_uploads().await?;
    pool.close().await;

    if uploads.is_empty() {
        println!("No uploads.");
        return Ok(());
    }

    println!(
        "{:<6} {:<11} {:<24} {:<12} {:<20} {:>10}  FAILURE",
        "ID", "STATE", "REPOSITORY", "COMMIT", "INDEXER", "BYTES"
    );
    for listing in &uploads {
        let upload = &listing.upload;
        println!(
            "{:<6} {:<11} {:<24} {:<12} {:<20} {:>10}  {}",
            upload.id,
            upload.state.as_str(),
            listing.repository,
            upload.commit.chars().take(12).collect::<String>(),
            upload.indexer,
            upload.upload_size,
            upload.failure_message.as_deref().unwrap_or("")
        );
    }

    Ok(())
}
