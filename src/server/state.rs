use std::sync::Arc;

use wheelhouse_session_center::SessionCenter;

use crate::config::Config;

use super::events::SeqRegistry;
use super::settings::SettingsStore;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub center: Arc<SessionCenter>,
    pub settings: Arc<SettingsStore>,
    pub(crate) seq: Arc<SeqRegistry>,
}

impl AppState {
    pub fn new(config: Arc<Config>, center: Arc<SessionCenter>, settings: Arc<SettingsStore>) -> Self {
        Self {
            config,
            center,
            settings,
            seq: Arc::new(SeqRegistry::default()),
        }
    }
}
