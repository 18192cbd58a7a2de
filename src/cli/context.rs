//! Shared wiring: build the session center and its collaborators from
//! configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use wheelhouse_artifact_store::{ArtifactUploader, S3Store, UploaderConfig};
use wheelhouse_driver::{browser_available, Viewport};
use wheelhouse_escalation::{HttpVisionClient, VisionClient};
use wheelhouse_profile_store::ProfileStore;
use wheelhouse_script_engine::CredentialProvider;
use wheelhouse_session_center::{CenterConfig, ChromiumFactory, SessionCenter, StubFactory};

use crate::config::Config;
use crate::secrets::FileSecretSource;
use crate::server::SettingsStore;

pub(crate) struct AppContext {
    pub config: Arc<Config>,
    pub center: Arc<SessionCenter>,
    pub settings: Arc<SettingsStore>,
}

pub(crate) async fn build(config: Config) -> Result<AppContext> {
    let config = Arc::new(config);
    let settings = Arc::new(SettingsStore::load(config.settings_path()));

    let store = Arc::new(
        ProfileStore::open(&config.profiles_root)
            .with_context(|| format!("cannot open profiles root {}", config.profiles_root.display()))?,
    );

    let uploader = match &config.artifact_bucket {
        Some(bucket) => {
            info!(target: "cli", bucket = %bucket, "artifact uploads enabled");
            let store = Arc::new(S3Store::from_env(bucket.clone()).await);
            Arc::new(ArtifactUploader::new(
                Some(store),
                UploaderConfig {
                    workers: config.upload_workers,
                    ..Default::default()
                },
            ))
        }
        None => Arc::new(ArtifactUploader::disabled()),
    };

    let vision = vision_client(&config, &settings);
    let credentials: Option<Arc<dyn CredentialProvider>> = config
        .consolidated_secret_path
        .as_ref()
        .map(|path| Arc::new(FileSecretSource::new(path)) as Arc<dyn CredentialProvider>);

    let factory: Arc<dyn wheelhouse_session_center::DriverFactory> = if browser_available() {
        Arc::new(ChromiumFactory)
    } else {
        warn!(
            target: "cli",
            "no browser executable found; sessions will run against the stub driver"
        );
        Arc::new(StubFactory::new())
    };

    let center = SessionCenter::new(
        store,
        uploader,
        factory,
        vision,
        credentials,
        CenterConfig {
            default_step_timeout: config.step_timeout(),
            default_script_deadline: config.script_deadline(),
            session_drain_deadline: config.drain_deadline(),
            max_vision_escalations_per_script: config.max_vision_escalations_per_script,
            default_browser_channel: config.default_browser_channel.clone(),
            default_viewport: Viewport::default(),
        },
    );

    Ok(AppContext {
        config,
        center,
        settings,
    })
}

fn vision_client(config: &Config, settings: &SettingsStore) -> Option<Arc<dyn VisionClient>> {
    let api_key = settings
        .api_key()
        .or_else(|| std::env::var("WHEELHOUSE_LLM_API_KEY").ok())
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())?;
    let model = settings
        .llm_model()
        .unwrap_or_else(|| config.llm_model.clone());
    info!(target: "cli", model = %model, "vision tiers enabled");
    Some(Arc::new(HttpVisionClient::new(api_key, model)))
}
