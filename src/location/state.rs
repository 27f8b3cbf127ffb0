use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

use super::types::{AddressPoint, LocationFix};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LocationState {
    pub location: Option<LocationFix>,
    pub address: Option<AddressPoint>,
    pub loading: bool,
    pub loading_address: bool,
    pub error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Bumped once per published fix.
    pub revision: u64,
}

/// Observable holder of the latest location, address and error.
///
/// Readers either poll with [`LocationStore::snapshot`] or follow changes
/// through [`LocationStore::subscribe`]. Writes go through the narrow
/// [`PositionWriter`] and [`AddressWriter`] handles so that each field group
/// has exactly one writer.
#[derive(Debug, Clone)]
pub struct LocationStore {
    tx: Arc<watch::Sender<LocationState>>,
}

impl Default for LocationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocationStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LocationState::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> LocationState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LocationState> {
        self.tx.subscribe()
    }

    pub fn position_writer(&self) -> PositionWriter {
        PositionWriter {
            tx: self.tx.clone(),
        }
    }

    pub fn address_writer(&self) -> AddressWriter {
        AddressWriter {
            tx: self.tx.clone(),
        }
    }
}

/// Write access to `location`, `loading` and `error`.
#[derive(Debug, Clone)]
pub struct PositionWriter {
    tx: Arc<watch::Sender<LocationState>>,
}

impl PositionWriter {
    pub fn begin_session(&self) {
        self.tx.send_modify(|state| {
            state.error = None;
            state.loading = true;
        });
    }

    pub fn publish(&self, fix: LocationFix) {
        self.tx.send_modify(|state| {
            state.location = Some(fix);
            state.loading = false;
            state.updated_at = Some(Utc::now());
            state.revision += 1;
        });
    }

    /// Clears `loading` once no session is left to deliver a fix.
    pub fn end_session(&self) {
        self.tx.send_if_modified(|state| {
            let changed = state.loading;
            state.loading = false;
            changed
        });
    }

    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_modify(|state| {
            state.error = Some(message);
            state.loading = false;
        });
    }

    /// Records `message` only while no fix has ever been published.
    pub fn fail_if_no_fix(&self, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_if_modified(|state| {
            if state.location.is_some() {
                return false;
            }
            state.error = Some(message);
            state.loading = false;
            true
        });
    }
}

/// Write access to `address` and `loading_address`.
#[derive(Debug, Clone)]
pub struct AddressWriter {
    tx: Arc<watch::Sender<LocationState>>,
}

impl AddressWriter {
    pub fn begin_lookup(&self) {
        self.tx.send_if_modified(|state| {
            let changed = !state.loading_address;
            state.loading_address = true;
            changed
        });
    }

    pub fn commit(&self, address: AddressPoint) {
        self.tx.send_modify(|state| {
            state.address = Some(address);
            state.loading_address = false;
        });
    }

    pub fn lookup_failed(&self) {
        self.tx.send_modify(|state| {
            state.loading_address = false;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_clears_loading_and_bumps_revision() {
        let store = LocationStore::new();
        let writer = store.position_writer();

        writer.begin_session();
        assert!(store.snapshot().loading);

        writer.publish(LocationFix::new(1.0, 2.0));
        let state = store.snapshot();
        assert!(!state.loading);
        assert_eq!(state.revision, 1);
        assert_eq!(state.location, Some(LocationFix::new(1.0, 2.0)));
        assert!(state.updated_at.is_some());
    }

    #[test]
    fn begin_session_clears_previous_error() {
        let store = LocationStore::new();
        let writer = store.position_writer();

        writer.fail("location permission denied");
        assert_eq!(
            store.snapshot().error.as_deref(),
            Some("location permission denied")
        );

        writer.begin_session();
        let state = store.snapshot();
        assert_eq!(state.error, None);
        assert!(state.loading);
    }

    #[test]
    fn end_session_only_notifies_when_loading() {
        let store = LocationStore::new();
        let mut rx = store.subscribe();
        let writer = store.position_writer();

        writer.end_session();
        assert!(!rx.has_changed().unwrap());

        writer.begin_session();
        rx.borrow_and_update();
        writer.end_session();
        assert!(rx.has_changed().unwrap());
        assert!(!store.snapshot().loading);
    }

    #[test]
    fn address_writes_leave_location_untouched() {
        let store = LocationStore::new();
        store.position_writer().publish(LocationFix::new(1.0, 2.0));

        let addresses = store.address_writer();
        addresses.begin_lookup();
        assert!(store.snapshot().loading_address);

        addresses.commit(AddressPoint {
            address: Some("1 Main Rd".into()),
            latitude: 1.0,
            longitude: 2.0,
        });
        let state = store.snapshot();
        assert!(!state.loading_address);
        assert_eq!(state.revision, 1);
        assert_eq!(
            state.address.and_then(|a| a.address).as_deref(),
            Some("1 Main Rd")
        );
    }

    #[tokio::test]
    async fn subscribers_see_latest_value() {
        let store = LocationStore::new();
        let mut rx = store.subscribe();
        let writer = store.position_writer();

        writer.publish(LocationFix::new(1.0, 1.0));
        writer.publish(LocationFix::new(2.0, 2.0));

        rx.changed().await.unwrap();
        let state = rx.borrow_and_update().clone();
        assert_eq!(state.revision, 2);
        assert_eq!(state.location, Some(LocationFix::new(2.0, 2.0)));
    }
}
