use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::SensorError;
use super::types::{Accuracy, LocationFix, PermissionStatus, WatchOptions};

pub type WatchEvent = Result<LocationFix, SensorError>;

/// Device location sensor.
#[async_trait]
pub trait LocationSensor: Send + Sync {
    async fn request_foreground_permission(&self) -> PermissionStatus;

    async fn last_known_position(&self) -> Result<Option<LocationFix>, SensorError>;

    async fn current_position(&self, accuracy: Accuracy) -> Result<LocationFix, SensorError>;

    fn watch_position(&self, options: WatchOptions) -> Result<Subscription, SensorError>;
}

/// Live watch registration. Dropping it removes the watch from the sensor.
pub struct Subscription {
    events: mpsc::UnboundedReceiver<WatchEvent>,
    on_remove: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        events: mpsc::UnboundedReceiver<WatchEvent>,
        on_remove: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            on_remove: Some(Box::new(on_remove)),
        }
    }

    /// Next watch event, or `None` once the sensor closes the watch.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }

    pub fn remove(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(on_remove) = self.on_remove.take() {
            self.events.close();
            on_remove();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.on_remove.is_some())
            .finish()
    }
}
