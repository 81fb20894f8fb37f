use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::agent::ModelBackend;
use crate::db::store::KeyValueStore;
use crate::errors::AppError;
use crate::models::{AppSettings, AppSettingsUpdate, ModelOptions, ModelSettings};

const APP_SETTINGS_KEY: &str = "app-settings";
const MODEL_SETTINGS_KEY: &str = "model-settings";

/// Application and per-model settings, cached after the first read.
#[derive(Clone)]
pub struct SettingsRepository {
    store: Arc<dyn KeyValueStore>,
    defaults: AppSettings,
    app: Arc<RwLock<Option<AppSettings>>>,
    models: Arc<RwLock<Option<ModelSettings>>>,
}

impl SettingsRepository {
    pub fn new(store: Arc<dyn KeyValueStore>, defaults: AppSettings) -> Self {
        Self {
            store,
            defaults,
            app: Arc::new(RwLock::new(None)),
            models: Arc::new(RwLock::new(None)),
        }
    }

    /// Stored app settings; the defaults are written on first use.
    pub async fn app_settings(&self, force_refresh: bool) -> Result<AppSettings, AppError> {
        if !force_refresh {
            if let Some(cached) = self.app.read().await.as_ref() {
                return Ok(cached.clone());
            }
        }

        let settings = match self.store.get(APP_SETTINGS_KEY).await? {
            Some(value) => serde_json::from_value(value)?,
            None => {
                debug!("No stored app settings; writing defaults");
                self.store
                    .set(APP_SETTINGS_KEY, serde_json::to_value(&self.defaults)?)
                    .await?;
                self.defaults.clone()
            }
        };
        *self.app.write().await = Some(settings.clone());
        Ok(settings)
    }

    pub async fn save_app_settings(&self, update: AppSettingsUpdate) -> Result<AppSettings, AppError> {
        let merged = self.app_settings(true).await?.merge(update);
        self.store
            .set(APP_SETTINGS_KEY, serde_json::to_value(&merged)?)
            .await?;
        self.app_settings(true).await
    }

    async fn stored_model_settings(&self) -> Result<ModelSettings, AppError> {
        match self.store.get(MODEL_SETTINGS_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(ModelSettings::new()),
        }
    }

    /// Options for every model the backend currently offers.
    ///
    /// Known models keep their stored options, new ones get defaults, models
    /// the backend no longer lists are dropped. If the model list cannot be
    /// fetched the stored map is returned unchanged.
    pub async fn model_settings(
        &self,
        force_refresh: bool,
        backend: &dyn ModelBackend,
    ) -> Result<ModelSettings, AppError> {
        if !force_refresh {
            if let Some(cached) = self.models.read().await.as_ref() {
                return Ok(cached.clone());
            }
        }

        let stored = self.stored_model_settings().await?;
        let api_url = self.app_settings(false).await?.ollama_api_url;
        let settings = match backend.fetch_model_list(&api_url).await {
            Ok(models) => {
                let merged: ModelSettings = models
                    .into_iter()
                    .map(|model| {
                        let options = stored.get(&model.name).cloned().unwrap_or_default();
                        (model.name, options)
                    })
                    .collect();
                self.store
                    .set(MODEL_SETTINGS_KEY, serde_json::to_value(&merged)?)
                    .await?;
                merged
            }
            Err(e) => {
                warn!("Model list unavailable, using stored model settings: {e}");
                stored
            }
        };

        *self.models.write().await = Some(settings.clone());
        Ok(settings)
    }

    pub async fn save_model_settings(&self, settings: ModelSettings) -> Result<(), AppError> {
        self.store
            .set(MODEL_SETTINGS_KEY, serde_json::to_value(&settings)?)
            .await?;
        *self.models.write().await = Some(settings);
        Ok(())
    }

    /// Options for one model, falling back to defaults when nothing is stored.
    pub async fn model_options(&self, model_name: &str) -> Result<ModelOptions, AppError> {
        if let Some(cached) = self.models.read().await.as_ref() {
            if let Some(options) = cached.get(model_name) {
                return Ok(options.clone());
            }
        }
        Ok(self
            .stored_model_settings()
            .await?
            .remove(model_name)
            .unwrap_or_default())
    }
}
