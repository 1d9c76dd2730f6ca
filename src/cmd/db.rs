//! Database commands: `spaghettihub init-db` and `spaghettihub work-status`.

use anyhow::{Context, Result};
use std::path::Path;

use spaghettihub::config::AppConfig;
use spaghettihub::store::Store;

fn open_store(path: &Path) -> Result<Store> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
    }
    Store::open(path)
}

pub fn cmd_init_db(config: &AppConfig) -> Result<()> {
    open_store(&config.database.path)?;
    println!("Database initialized at {}", config.database.path.display());
    Ok(())
}

pub async fn cmd_work_status(config: &AppConfig, request_uuid: &str) -> Result<()> {
    let store = open_store(&config.database.path)?;
    let uuid = request_uuid.to_string();
    let Some(work) = store.call(move |db| db.get_work(&uuid)).await? else {
        anyhow::bail!("No porting request with UUID {}", request_uuid);
    };

    println!();
    println!("{}", console::style(format!("Porting request {}", work.request_uuid)).bold());
    println!("  Status:       {}", work.status.as_str());
    println!("  Launchpad:    {}", work.launchpad_url);
    println!(
        "  GitHub:       {}",
        work.github_url.as_deref().unwrap_or("-")
    );
    println!("  Requested at: {}", work.requested_at);
    if let Some(completed_at) = &work.completed_at {
        println!("  Completed at: {}", completed_at);
    }
    println!();
    Ok(())
}
