use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use catalog_session::auth::{SessionManager, SessionPhase, SqliteStorage, WordPressAuth};
use catalog_session::config::Config;
use catalog_session::http_client::AuthorizedClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("🚀 Catalog session starting...");
    tracing::info!("Catalog site: {}", config.base_url);
    tracing::debug!("Session store: {}", config.store_file.display());

    let storage = Arc::new(SqliteStorage::open(&config.store_file)?);
    let remote = Arc::new(WordPressAuth::new(
        &config.base_url,
        Duration::from_secs(config.http_request_timeout),
    )?);

    let manager = SessionManager::builder(remote.clone(), storage)
        .profile_lookup(remote)
        .policy(config.session_policy())
        .lifetimes(config.store_lifetimes())
        .build();

    if config.logout {
        manager.logout().await;
        tracing::info!("👋 Signed out, stored session cleared");
        return Ok(());
    }

    // Restore the previous session, or sign in
    match manager.load_stored_auth().await {
        SessionPhase::SignedOut => {
            let credentials = config.credentials()?;
            match manager.login(&credentials, config.remember_me).await {
                Ok(identity) => {
                    tracing::info!("✅ Signed in as {} <{}>", identity.display_name, identity.email);
                }
                Err(e) => {
                    tracing::error!("❌ Sign-in failed: {}", e);
                    anyhow::bail!("Unable to sign in to {}", config.base_url);
                }
            }
        }
        _ => {
            let name = manager
                .current_identity()
                .await
                .map(|identity| identity.display_name)
                .unwrap_or_default();
            tracing::info!("✅ Restored stored session for {}", name);
        }
    }

    if let Some(wake) = manager.next_wake() {
        tracing::info!("Next token renewal at {}", wake.to_rfc3339());
    }

    if let Some(ref path) = config.fetch {
        let client = AuthorizedClient::new(Arc::new(manager.clone()), config.http_request_timeout)?;
        fetch_once(&client, &config.base_url, path).await?;
    }

    print_startup_banner(&config);

    keep_fresh(&manager).await;

    tracing::info!("👋 Shutdown complete");
    Ok(())
}

/// Fetch one API path through the authorized client and log the result
async fn fetch_once(client: &AuthorizedClient, base_url: &str, path: &str) -> Result<()> {
    let url = format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'));
    let request = client.client().get(&url).build()?;

    let response = client
        .execute(request)
        .await
        .with_context(|| format!("Request to {} failed", url))?;

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    tracing::info!(status = %status, bytes = body.len(), "📦 Fetched {}", url);
    tracing::debug!("{}", body);
    Ok(())
}

/// Log phase changes until Ctrl+C or until the session is lost
async fn keep_fresh(manager: &SessionManager) {
    let mut phases = manager.watch_phase();

    loop {
        tokio::select! {
            changed = phases.changed() => {
                if changed.is_err() {
                    break;
                }
                let phase = *phases.borrow_and_update();
                match phase {
                    SessionPhase::SignedIn => {
                        tracing::info!(
                            next_wake = ?manager.next_wake(),
                            "🔄 Session renewed"
                        );
                    }
                    SessionPhase::Reauthenticating => {
                        tracing::debug!("Re-authenticating...");
                    }
                    SessionPhase::SignedOut => {
                        tracing::warn!("⚠️ Session ended, sign in again to continue");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C signal, shutting down...");
                break;
            }
        }
    }
}

/// Print startup banner
fn print_startup_banner(config: &Config) {
    let banner = r#"
╔═══════════════════════════════════════════════════════════╗
║                                                           ║
║              🔐 Catalog Session - Rust Edition            ║
║                                                           ║
║  Keeps a WordPress catalog login fresh                    ║
║                                                           ║
╚═══════════════════════════════════════════════════════════╝
"#;

    println!("{}", banner);
    println!("  Version:        {}", env!("CARGO_PKG_VERSION"));
    println!("  Site:           {}", config.base_url);
    println!("  Store:          {}", config.store_file.display());
    println!("  Refresh margin: {}s", config.refresh_margin);
    println!("  Network errors: {:?}", config.network_error_policy);
    println!("  Log Level:      {}", config.log_level);
    println!();
}
