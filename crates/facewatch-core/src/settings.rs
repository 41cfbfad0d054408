//! Recognition options shared by every analysis surface.

use crate::store::{SettingsStore, StoreError};
use crate::types::RecognitionOptions;
use tokio::sync::watch;

/// Single writer for [`RecognitionOptions`]; readers subscribe.
pub struct Settings<S: SettingsStore> {
    store: S,
    options: watch::Sender<RecognitionOptions>,
}

impl<S: SettingsStore> Settings<S> {
    pub fn open(store: S) -> Self {
        let options = store.load_options().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load settings; using defaults");
            RecognitionOptions::default()
        });
        let (tx, _) = watch::channel(options);
        Self { store, options: tx }
    }

    pub fn get(&self) -> RecognitionOptions {
        *self.options.borrow()
    }

    /// Persist and publish new options.
    pub fn set(&mut self, options: RecognitionOptions) -> Result<(), StoreError> {
        self.store.save_options(&options)?;
        self.options.send_replace(options);
        tracing::info!(
            recognize_gender = options.recognize_gender,
            count_people = options.count_people,
            "recognition options updated"
        );
        Ok(())
    }

    pub fn subscribe(&self) -> watch::Receiver<RecognitionOptions> {
        self.options.subscribe()
    }
}
