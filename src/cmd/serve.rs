//! Webhook server and workflow engine: `spaghettihub serve`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use spaghettihub::app::{EngineSettings, Services, build_engine, build_state};
use spaghettihub::clients::{GitHubClient, LaunchpadClient, LxdClient};
use spaghettihub::config::AppConfig;
use spaghettihub::porting::GitVcs;
use spaghettihub::server::start_server;
use spaghettihub::store::Store;

async fn connect_lxd(config: &AppConfig) -> Result<LxdClient> {
    let lxd = &config.lxd;
    let mut builder = LxdClient::builder(&lxd.endpoint)
        .project(&lxd.project)
        .accept_invalid_certs(lxd.accept_invalid_certs)
        .operation_timeout(Duration::from_secs(lxd.operation_timeout_secs));
    if let (Some(cert), Some(key)) = (&lxd.client_cert, &lxd.client_key) {
        builder = builder.client_certificate(cert, key)?;
    }
    let client = builder.build()?;

    if lxd.trust_password.is_empty() {
        info!(endpoint = %lxd.endpoint, "No LXD trust password; assuming the certificate is trusted");
    } else if let Err(e) = client.authenticate(&lxd.trust_password).await {
        warn!(endpoint = %lxd.endpoint, error = %format!("{:#}", e), "LXD authentication failed; runner VMs will fail until it succeeds");
    }
    Ok(client)
}

pub async fn cmd_serve(config: AppConfig) -> Result<()> {
    let problems = config.validate();
    if !problems.is_empty() {
        anyhow::bail!("Invalid configuration:\n  {}", problems.join("\n  "));
    }

    if let Some(parent) = config.database.path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let store = Store::open(&config.database.path).context("Failed to open database")?;

    let services = Services {
        github: Arc::new(GitHubClient::new(
            &config.github.api_url,
            &config.github.repository,
            &config.github.token,
            &config.github.runner_token,
        )),
        launchpad: Arc::new(LaunchpadClient::new(&config.porting.launchpad_api_root)),
        vm_host: Arc::new(connect_lxd(&config).await?),
        vcs: Arc::new(GitVcs::new(config.git_vcs_settings())),
    };

    let engine = Arc::new(build_engine(
        &store,
        &services,
        &EngineSettings::from_config(&config),
    ));
    let resumed = engine.recover().await.context("Failed to resume workflows")?;
    info!(count = resumed.len(), "Recovery scan finished");

    let state = build_state(
        store,
        engine,
        config.tracker_settings(),
        &config.github.webhook_secret,
    );
    start_server(&config.server_config(), state).await
}
