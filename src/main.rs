use alm_sync::config::{load_config, SyncConfig};
use alm_sync::{ProjectScope, SyncEngine, SyncResult};
use anyhow::{bail, Context, Result};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "alm_sync=info".into()),
        )
        .init();

    info!("alm-sync starting...");

    // Read configuration from file and environment
    let mut config = match std::env::var("ALM_SYNC_CONFIG") {
        Ok(path) => load_config(&path)?,
        Err(_) => SyncConfig::default(),
    };
    if let Ok(base_url) = std::env::var("ALM_BASE_URL") {
        config.alm.base_url = base_url;
    }

    let encryption_key = std::env::var("ALM_SYNC_ENCRYPTION_KEY")
        .context("ALM_SYNC_ENCRYPTION_KEY is required (base64-encoded 32-byte key)")?;

    let owner = std::env::var("ALM_SYNC_USER").context("ALM_SYNC_USER is required")?;
    let group =
        std::env::var("ALM_SYNC_GROUP").unwrap_or_else(|_| config.sync.default_group.clone());

    info!(
        base_url = %config.alm.base_url,
        store = %config.store.path,
        owner = %owner,
        group = %group,
        "Configuration loaded"
    );

    let engine = SyncEngine::from_config(&config, &encryption_key)?.with_group(&group);

    // Without a password the cached credential is used
    if let Ok(password) = std::env::var("ALM_SYNC_PASSWORD") {
        engine
            .login(&owner, &password)
            .await
            .context("ALM login failed")?;
    }

    let cancel = engine.cancellation_token();
    let outcome = tokio::select! {
        result = run(&engine, &owner) => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl_c signal")?;
            info!("Shutdown signal received, cancelling sync");
            cancel.cancel();
            Ok(())
        }
    };

    engine.logout(&owner).await;
    info!("alm-sync stopped");
    outcome
}

/// Walks domains, projects and the root of the test plan.
async fn run(engine: &SyncEngine, owner: &str) -> Result<()> {
    let domains = report("domains", engine.sync_domains(owner).await)?;

    let domain = match std::env::var("ALM_SYNC_DOMAIN") {
        Ok(domain) => domain,
        Err(_) => match domains.first() {
            Some(first) => first.clone(),
            None => {
                warn!("No domains visible to this user");
                return Ok(());
            }
        },
    };

    let projects = report("projects", engine.sync_projects(owner, &domain).await)?;
    let project = match std::env::var("ALM_SYNC_PROJECT") {
        Ok(project) => project,
        Err(_) => match projects.first() {
            Some(first) => first.clone(),
            None => {
                warn!(domain = %domain, "No projects in domain");
                return Ok(());
            }
        },
    };

    let scope = ProjectScope::new(&domain, &project);
    report(
        "root test folders",
        engine.sync_root_test_folders(owner, &scope).await,
    )?;
    Ok(())
}

/// Logs a sync result and returns the synced entity names.
fn report(what: &str, result: SyncResult) -> Result<Vec<String>> {
    if result.partial {
        warn!(what, count = result.count, "{}", result.message);
    } else if !result.success {
        bail!("{}: {}", what, result.message);
    } else {
        info!(what, count = result.count, "{}", result.message);
    }
    Ok(result.entities.into_iter().map(|e| e.name).collect())
}
