//! Garden store: greenhouse list, current selection and the polling loop
//!
//! The store owns at most one polling task. Every selection change bumps a
//! generation counter under the state lock; a poll response that was
//! requested under an older generation is discarded instead of applied.
//! The poller is started and stopped while the state write lock is held, so
//! the running loop always matches the selection.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::GreenhouseApi;
use crate::domain::{Field, Greenhouse, ListQuery, SensorUpdate, Series};
use crate::error::{error_codes, ClientError, ErrorResponse};
use crate::storage::{keys, SecureStore, StorageError};
use crate::validators::{validate_field_index, validate_greenhouse_id, ValidationError};

/// Message stored in `GardenState::error` when the list cannot be fetched
pub const FETCH_FAILED_MESSAGE: &str = "Failed to fetch greenhouses";

#[derive(Debug, Error)]
pub enum GardenError {
    #[error("No greenhouse is selected")]
    NoSelection,

    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Remote(#[from] ClientError),

    #[error("{0}")]
    Storage(#[from] StorageError),
}

impl GardenError {
    pub fn code(&self) -> &'static str {
        match self {
            GardenError::NoSelection => error_codes::NO_SELECTION,
            GardenError::Validation(e) if e.field == "field_index" => {
                error_codes::FIELD_OUT_OF_RANGE
            }
            GardenError::Validation(_) => error_codes::INVALID_VALUE,
            GardenError::Remote(e) => e.code(),
            GardenError::Storage(_) => error_codes::STORAGE_ERROR,
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        match self {
            GardenError::Remote(e) => e.to_error_response(),
            GardenError::Validation(e) => ErrorResponse::new(self.code(), e.message.clone()),
            other => ErrorResponse::new(other.code(), other.to_string()),
        }
    }
}

impl From<GardenError> for ErrorResponse {
    fn from(err: GardenError) -> Self {
        err.to_error_response()
    }
}

/// Observable garden state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GardenState {
    pub greenhouses: Vec<Greenhouse>,
    pub selected_greenhouse: Option<Greenhouse>,
    pub selected_field: Option<Field>,
    pub selected_field_index: Option<usize>,
    pub is_loading: bool,
    pub error: Option<String>,
}

impl GardenState {
    fn clear_selection(&mut self) {
        self.selected_greenhouse = None;
        self.selected_field = None;
        self.selected_field_index = None;
    }

    fn selected_id(&self) -> Option<&str> {
        self.selected_greenhouse
            .as_ref()
            .map(|g| g.greenhouse_id.as_str())
    }

    /// Replace the cached entry and, if it is the selected greenhouse, the selection
    /// Returns true when the selection was refreshed
    fn reconcile(&mut self, fresh: Greenhouse) -> bool {
        for cached in self
            .greenhouses
            .iter_mut()
            .filter(|g| g.greenhouse_id == fresh.greenhouse_id)
        {
            *cached = fresh.clone();
        }

        if self.selected_id() != Some(fresh.greenhouse_id.as_str()) {
            return false;
        }

        if let Some(index) = self.selected_field_index {
            match fresh.field(index) {
                Some(field) => self.selected_field = Some(field.clone()),
                None => {
                    warn!(
                        greenhouse_id = %fresh.greenhouse_id,
                        field_index = index,
                        "Selected field no longer exists, clearing field selection"
                    );
                    self.selected_field = None;
                    self.selected_field_index = None;
                }
            }
        }
        self.selected_greenhouse = Some(fresh);
        true
    }
}

struct GardenInner {
    api: Arc<dyn GreenhouseApi>,
    storage: Arc<dyn SecureStore>,
    state: RwLock<GardenState>,
    generation: AtomicU64,
    /// List fetches still outstanding; only touched under the state write lock
    fetches_in_flight: AtomicUsize,
    ticks: watch::Sender<u64>,
}

impl GardenInner {
    /// Fetch the selected greenhouse once and fold it into the state
    async fn poll_tick(&self, greenhouse_id: &str) -> Result<bool, GardenError> {
        let generation = self.generation.load(Ordering::SeqCst);
        let fresh = self.api.get_greenhouse(greenhouse_id).await?;

        let mut state = self.state.write().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(greenhouse_id = %greenhouse_id, "Discarding response for a superseded selection");
            return Ok(false);
        }
        if fresh.greenhouse_id != greenhouse_id {
            warn!(
                requested = %greenhouse_id,
                received = %fresh.greenhouse_id,
                "Poll response is for a different greenhouse"
            );
        }
        Ok(state.reconcile(fresh))
    }

    /// Bump the generation; callers hold the state write lock
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn tick_completed(&self) {
        self.ticks.send_modify(|count| *count = count.wrapping_add(1));
    }
}

struct PollHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    greenhouse_id: String,
}

/// Holds the greenhouse list and selection and keeps the selection fresh
pub struct GardenStore {
    inner: Arc<GardenInner>,
    poller: Mutex<Option<PollHandle>>,
    poll_interval: Duration,
}

impl GardenStore {
    pub fn new(
        api: Arc<dyn GreenhouseApi>,
        storage: Arc<dyn SecureStore>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(GardenInner {
                api,
                storage,
                state: RwLock::new(GardenState::default()),
                generation: AtomicU64::new(0),
                fetches_in_flight: AtomicUsize::new(0),
                ticks: watch::channel(0).0,
            }),
            poller: Mutex::new(None),
            poll_interval,
        }
    }

    pub async fn state(&self) -> GardenState {
        self.inner.state.read().await.clone()
    }

    /// Receiver bumped after every completed poll tick, once the tick's result is in the state
    pub fn subscribe_ticks(&self) -> watch::Receiver<u64> {
        self.inner.ticks.subscribe()
    }

    /// Fetch the first page of greenhouses
    pub async fn fetch_greenhouses(&self) -> Result<Vec<Greenhouse>, GardenError> {
        self.fetch_greenhouses_with(&ListQuery::default()).await
    }

    /// Fetch greenhouses and replace the cached list
    /// A list that no longer contains the selected greenhouse invalidates the selection
    pub async fn fetch_greenhouses_with(
        &self,
        query: &ListQuery,
    ) -> Result<Vec<Greenhouse>, GardenError> {
        {
            let mut state = self.inner.state.write().await;
            self.inner.fetches_in_flight.fetch_add(1, Ordering::SeqCst);
            state.is_loading = true;
            state.error = None;
        }

        let result = self.inner.api.list_greenhouses(query).await;

        let mut state = self.inner.state.write().await;
        if self.inner.fetches_in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            state.is_loading = false;
        }
        let greenhouses = match result {
            Ok(greenhouses) => greenhouses,
            Err(err) => {
                error!(error = %err, "Failed to fetch greenhouses");
                state.error = Some(FETCH_FAILED_MESSAGE.to_string());
                return Err(err.into());
            }
        };

        info!(count = greenhouses.len(), "Fetched greenhouses");
        state.greenhouses = greenhouses.clone();

        if let Some(selected_id) = state.selected_id().map(str::to_string) {
            match greenhouses.iter().find(|g| g.greenhouse_id == selected_id) {
                Some(fresh) => {
                    state.reconcile(fresh.clone());
                }
                None => {
                    warn!(greenhouse_id = %selected_id, "Selected greenhouse is gone, clearing selection");
                    self.inner.next_generation();
                    state.clear_selection();
                    self.stop_polling_for(&selected_id);
                }
            }
        }
        Ok(greenhouses)
    }

    /// Select a greenhouse (clearing the field selection) and restart polling
    /// `None` clears the in-memory selection and stops polling
    pub async fn select_greenhouse(&self, greenhouse: Option<Greenhouse>) -> Result<(), GardenError> {
        let Some(greenhouse) = greenhouse else {
            let mut state = self.inner.state.write().await;
            self.inner.next_generation();
            state.clear_selection();
            self.stop_polling();
            info!("Greenhouse selection cleared");
            return Ok(());
        };

        validate_greenhouse_id(&greenhouse.greenhouse_id)?;
        let greenhouse_id = greenhouse.greenhouse_id.clone();

        {
            let mut state = self.inner.state.write().await;
            self.inner.next_generation();
            state.selected_greenhouse = Some(greenhouse);
            state.selected_field = None;
            state.selected_field_index = None;
            self.restart_poller(&state);
        }
        info!(greenhouse_id = %greenhouse_id, "Selected greenhouse");

        self.inner
            .storage
            .set_item(keys::SELECTED_GREENHOUSE_ID, &greenhouse_id)
            .await?;
        self.inner
            .storage
            .delete_item(keys::SELECTED_FIELD_INDEX)
            .await?;
        Ok(())
    }

    /// Select a field of the current greenhouse by index
    pub async fn select_field(&self, index: usize) -> Result<Field, GardenError> {
        let field = {
            let mut state = self.inner.state.write().await;
            let greenhouse = state
                .selected_greenhouse
                .as_ref()
                .ok_or(GardenError::NoSelection)?;
            validate_field_index(index, greenhouse.fields.len())?;
            let field = greenhouse.fields[index].clone();

            state.selected_field = Some(field.clone());
            state.selected_field_index = Some(index);
            field
        };
        info!(field_index = index, "Selected field");

        self.inner
            .storage
            .set_item(keys::SELECTED_FIELD_INDEX, &index.to_string())
            .await?;
        Ok(field)
    }

    /// Start polling the selected greenhouse, replacing any running loop
    /// Returns false when nothing is selected
    pub async fn start_polling(&self) -> bool {
        let state = self.inner.state.read().await;
        self.restart_poller(&state)
    }

    /// Replace the running loop with one for the selection in `state`
    /// Callers hold a state lock guard
    fn restart_poller(&self, state: &GardenState) -> bool {
        self.stop_polling();

        let greenhouse_id = match state.selected_id() {
            Some(id) => id.to_string(),
            None => {
                debug!("No greenhouse selected, polling not started");
                return false;
            }
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll_loop(
            Arc::clone(&self.inner),
            greenhouse_id.clone(),
            self.poll_interval,
            cancel.clone(),
        ));

        let previous = self.lock_poller().replace(PollHandle {
            cancel,
            task,
            greenhouse_id: greenhouse_id.clone(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        info!(greenhouse_id = %greenhouse_id, interval_secs = self.poll_interval.as_secs(), "Polling started");
        true
    }

    /// Stop the polling loop; a no-op when none is running
    pub fn stop_polling(&self) {
        if let Some(handle) = self.lock_poller().take() {
            handle.cancel.cancel();
            info!(greenhouse_id = %handle.greenhouse_id, "Polling stopped");
        }
    }

    /// Stop the polling loop only if it polls `greenhouse_id`
    fn stop_polling_for(&self, greenhouse_id: &str) {
        let mut poller = self.lock_poller();
        if poller
            .as_ref()
            .is_some_and(|handle| handle.greenhouse_id == greenhouse_id)
        {
            if let Some(handle) = poller.take() {
                handle.cancel.cancel();
                info!(greenhouse_id = %handle.greenhouse_id, "Polling stopped");
            }
        }
    }

    pub fn is_polling(&self) -> bool {
        self.lock_poller()
            .as_ref()
            .map(|handle| !handle.cancel.is_cancelled() && !handle.task.is_finished())
            .unwrap_or(false)
    }

    /// Id of the greenhouse the running loop polls
    pub fn polling_greenhouse_id(&self) -> Option<String> {
        self.lock_poller()
            .as_ref()
            .map(|handle| handle.greenhouse_id.clone())
    }

    /// Stop polling, clear the selection and forget the persisted selection
    pub async fn clear_selected_options(&self) -> Result<(), GardenError> {
        {
            let mut state = self.inner.state.write().await;
            self.inner.next_generation();
            state.clear_selection();
            self.stop_polling();
        }
        for key in keys::SELECTION {
            self.inner.storage.delete_item(key).await?;
        }
        info!("Selection cleared");
        Ok(())
    }

    /// Run one poll tick now
    /// Returns true when the selection was refreshed
    pub async fn refresh_selected(&self) -> Result<bool, GardenError> {
        let greenhouse_id = self
            .inner
            .state
            .read()
            .await
            .selected_id()
            .map(str::to_string)
            .ok_or(GardenError::NoSelection)?;
        self.inner.poll_tick(&greenhouse_id).await
    }

    /// Re-select the persisted greenhouse and field from the cached list
    /// Returns true when a greenhouse was restored
    pub async fn restore_selection(&self) -> Result<bool, GardenError> {
        let saved_id = self
            .inner
            .storage
            .get_item(keys::SELECTED_GREENHOUSE_ID)
            .await?;
        let saved_index = self
            .inner
            .storage
            .get_item(keys::SELECTED_FIELD_INDEX)
            .await?
            .and_then(|raw| raw.parse::<usize>().ok());

        let Some(saved_id) = saved_id else {
            return Ok(false);
        };

        {
            let mut state = self.inner.state.write().await;
            let Some(greenhouse) = state
                .greenhouses
                .iter()
                .find(|g| g.greenhouse_id == saved_id)
                .cloned()
            else {
                debug!(greenhouse_id = %saved_id, "Saved greenhouse not in the fetched list");
                return Ok(false);
            };

            self.inner.next_generation();
            let field = saved_index.and_then(|i| greenhouse.field(i).cloned().map(|f| (i, f)));
            state.selected_field_index = field.as_ref().map(|(i, _)| *i);
            state.selected_field = field.map(|(_, f)| f);
            state.selected_greenhouse = Some(greenhouse);
            self.restart_poller(&state);
        }
        info!(greenhouse_id = %saved_id, field_index = ?saved_index, "Restored saved selection");
        Ok(true)
    }

    /// Merge a pushed series update into the selected field
    /// Returns true when the update applied
    pub async fn apply_sensor_update(&self, update: &SensorUpdate) -> bool {
        let mut state = self.inner.state.write().await;

        let (Some(selected), Some(index)) =
            (state.selected_greenhouse.as_ref(), state.selected_field_index)
        else {
            return false;
        };
        if update.field_index != index {
            return false;
        }
        if let Some(id) = update.greenhouse_id.as_deref() {
            if id != selected.greenhouse_id {
                return false;
            }
        }
        let Some(series) = Series::from_key(&update.sensor_type) else {
            warn!(sensor_type = %update.sensor_type, "Ignoring update for unknown series");
            return false;
        };

        let mut updated = selected.clone();
        let Some(field) = updated.fields.get_mut(index) else {
            return false;
        };
        *field.series_mut(series) = update.sensor_data.clone();
        let field = field.clone();

        debug!(
            greenhouse_id = %updated.greenhouse_id,
            field_index = index,
            series = %series,
            "Applied pushed sensor update"
        );
        state.selected_field = Some(field);
        state.reconcile(updated);
        true
    }

    fn lock_poller(&self) -> std::sync::MutexGuard<'_, Option<PollHandle>> {
        self.poller.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for GardenStore {
    fn drop(&mut self) {
        if let Some(handle) = self.lock_poller().take() {
            handle.cancel.cancel();
        }
    }
}

async fn poll_loop(
    inner: Arc<GardenInner>,
    greenhouse_id: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => break,
        }

        tokio::select! {
            result = inner.poll_tick(&greenhouse_id) => match result {
                Ok(true) => debug!(greenhouse_id = %greenhouse_id, "Poll tick refreshed selection"),
                Ok(false) => debug!(greenhouse_id = %greenhouse_id, "Poll tick left selection unchanged"),
                Err(err) => warn!(greenhouse_id = %greenhouse_id, error = %err, "Poll tick failed, skipping"),
            },
            _ = cancel.cancelled() => break,
        }
        inner.tick_completed();
    }
    debug!(greenhouse_id = %greenhouse_id, "Polling loop cancelled");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockGreenhouseApi;
    use crate::domain::Reading;
    use crate::storage::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    const INTERVAL: Duration = Duration::from_secs(5);

    fn greenhouse(id: &str, temperature: f64, fields: usize) -> Greenhouse {
        let field = Field {
            temperature_sensor: vec![Reading {
                value: temperature,
                unit: "C".to_string(),
                timestamp: "2025-05-01T10:00:00Z".to_string(),
            }],
            ..Field::default()
        };
        Greenhouse {
            greenhouse_id: id.to_string(),
            name: format!("Greenhouse {}", id),
            location: "Da Lat".to_string(),
            owner: "alice".to_string(),
            fields: vec![field; fields],
            created_at: None,
            updated_at: None,
            metadata: Default::default(),
        }
    }

    fn store_with(api: MockGreenhouseApi) -> (GardenStore, Arc<MemoryStore>) {
        let storage = Arc::new(MemoryStore::new());
        (
            GardenStore::new(Arc::new(api), storage.clone(), INTERVAL),
            storage,
        )
    }

    fn counting_get(api: &mut MockGreenhouseApi, temperature: f64) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        api.expect_get_greenhouse().returning(move |id| {
            counter.fetch_add(1, Ordering::SeqCst);
            let fresh = greenhouse(id, temperature, 2);
            Box::pin(async move { Ok(fresh) })
        });
        calls
    }

    #[tokio::test]
    async fn fetch_greenhouses_replaces_list() {
        let mut api = MockGreenhouseApi::new();
        api.expect_list_greenhouses()
            .withf(|query| query.offset == 0 && query.limit == 10)
            .times(1)
            .returning(|_| Box::pin(async { Ok(vec![greenhouse("gh_1", 20.0, 1), greenhouse("gh_2", 21.0, 1)]) }));

        let (store, _) = store_with(api);
        let list = store.fetch_greenhouses().await.unwrap();
        assert_eq!(list.len(), 2);

        let state = store.state().await;
        assert_eq!(state.greenhouses.len(), 2);
        assert!(!state.is_loading);
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn fetch_greenhouses_failure_sets_error_flag() {
        let mut api = MockGreenhouseApi::new();
        api.expect_list_greenhouses().returning(|_| {
            Box::pin(async {
                Err(ClientError::Status {
                    status: 500,
                    message: "boom".to_string(),
                })
            })
        });

        let (store, _) = store_with(api);
        let err = store.fetch_greenhouses().await.unwrap_err();
        assert_eq!(err.code(), error_codes::HTTP_STATUS);

        let state = store.state().await;
        assert_eq!(state.error.as_deref(), Some(FETCH_FAILED_MESSAGE));
        assert!(!state.is_loading);
        assert!(state.greenhouses.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn select_greenhouse_persists_and_starts_polling() {
        let mut api = MockGreenhouseApi::new();
        counting_get(&mut api, 30.0);
        let (store, storage) = store_with(api);
        storage.set_item(keys::SELECTED_FIELD_INDEX, "1").await.unwrap();

        store
            .select_greenhouse(Some(greenhouse("gh_1", 20.0, 2)))
            .await
            .unwrap();

        assert!(store.is_polling());
        assert_eq!(store.polling_greenhouse_id().as_deref(), Some("gh_1"));
        assert_eq!(
            storage.get_item(keys::SELECTED_GREENHOUSE_ID).await.unwrap().as_deref(),
            Some("gh_1")
        );
        assert_eq!(storage.get_item(keys::SELECTED_FIELD_INDEX).await.unwrap(), None);

        let state = store.state().await;
        assert!(state.selected_field.is_none());
        assert!(state.selected_field_index.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn select_none_stops_polling_and_clears_selection() {
        let mut api = MockGreenhouseApi::new();
        let calls = counting_get(&mut api, 30.0);
        let (store, _) = store_with(api);

        store
            .select_greenhouse(Some(greenhouse("gh_1", 20.0, 2)))
            .await
            .unwrap();
        store.select_field(0).await.unwrap();
        store.select_greenhouse(None).await.unwrap();

        assert!(!store.is_polling());
        let state = store.state().await;
        assert!(state.selected_greenhouse.is_none());
        assert!(state.selected_field.is_none());
        assert!(state.selected_field_index.is_none());

        tokio::time::sleep(INTERVAL * 3).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_polling_twice_keeps_one_timer() {
        let mut api = MockGreenhouseApi::new();
        let calls = counting_get(&mut api, 30.0);
        let (store, _) = store_with(api);

        store
            .select_greenhouse(Some(greenhouse("gh_1", 20.0, 2)))
            .await
            .unwrap();
        assert!(store.start_polling().await);
        assert!(store.start_polling().await);

        tokio::time::sleep(INTERVAL + Duration::from_millis(500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(INTERVAL).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn start_polling_without_selection_does_nothing() {
        let (store, _) = store_with(MockGreenhouseApi::new());
        assert!(!store.start_polling().await);
        assert!(!store.is_polling());
        store.stop_polling();
    }

    #[tokio::test(start_paused = true)]
    async fn poll_tick_refreshes_selected_greenhouse_and_field() {
        let mut api = MockGreenhouseApi::new();
        api.expect_list_greenhouses()
            .returning(|_| Box::pin(async { Ok(vec![greenhouse("gh_1", 20.0, 2), greenhouse("gh_2", 21.0, 2)]) }));
        counting_get(&mut api, 31.5);
        let (store, _) = store_with(api);

        store.fetch_greenhouses().await.unwrap();
        let first = store.state().await.greenhouses[0].clone();
        store.select_greenhouse(Some(first)).await.unwrap();
        store.select_field(1).await.unwrap();

        tokio::time::sleep(INTERVAL + Duration::from_millis(100)).await;

        let state = store.state().await;
        let latest = |g: &Greenhouse| g.fields[1].latest(Series::Temperature).unwrap().value;
        assert_eq!(latest(state.selected_greenhouse.as_ref().unwrap()), 31.5);
        assert_eq!(latest(&state.greenhouses[0]), 31.5);
        assert_eq!(latest(&state.greenhouses[1]), 21.0);
        assert_eq!(
            state.selected_field.unwrap().latest(Series::Temperature).unwrap().value,
            31.5
        );
    }

    #[tokio::test(start_paused = true)]
    async fn tick_notification_arrives_after_state_is_updated() {
        let mut api = MockGreenhouseApi::new();
        counting_get(&mut api, 33.0);
        let (store, _) = store_with(api);
        let mut ticks = store.subscribe_ticks();

        store
            .select_greenhouse(Some(greenhouse("gh_1", 20.0, 2)))
            .await
            .unwrap();
        store.select_field(0).await.unwrap();

        ticks.changed().await.unwrap();
        assert_eq!(*ticks.borrow_and_update(), 1);
        let state = store.state().await;
        assert_eq!(
            state.selected_field.unwrap().latest(Series::Temperature).unwrap().value,
            33.0
        );
        store.stop_polling();
    }

    #[tokio::test]
    async fn overlapping_fetches_stay_loading_until_the_last_finishes() {
        let (first_tx, first_rx) = tokio::sync::oneshot::channel::<()>();
        let (second_tx, second_rx) = tokio::sync::oneshot::channel::<()>();
        let gates = Arc::new(Mutex::new(vec![first_rx, second_rx]));

        let mut api = MockGreenhouseApi::new();
        api.expect_list_greenhouses().times(2).returning(move |_| {
            let gate = gates.lock().unwrap().remove(0);
            Box::pin(async move {
                let _ = gate.await;
                Ok(vec![greenhouse("gh_1", 20.0, 1)])
            })
        });
        let store = Arc::new(store_with(api).0);

        let in_flight = |n: usize| {
            let store = store.clone();
            async move {
                while store.inner.fetches_in_flight.load(Ordering::SeqCst) < n {
                    tokio::task::yield_now().await;
                }
            }
        };

        let first = {
            let store = store.clone();
            tokio::spawn(async move { store.fetch_greenhouses().await })
        };
        in_flight(1).await;
        let second = {
            let store = store.clone();
            tokio::spawn(async move { store.fetch_greenhouses().await })
        };
        in_flight(2).await;

        let _ = first_tx.send(());
        first.await.unwrap().unwrap();
        assert!(store.state().await.is_loading);

        let _ = second_tx.send(());
        second.await.unwrap().unwrap();
        assert!(!store.state().await.is_loading);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_selection_changes_keep_poller_on_the_selection() {
        for _ in 0..200 {
            let mut api = MockGreenhouseApi::new();
            api.expect_get_greenhouse().returning(|id| {
                let fresh = greenhouse(id, 20.0, 1);
                Box::pin(async move { Ok(fresh) })
            });
            let store = Arc::new(store_with(api).0);
            store
                .select_greenhouse(Some(greenhouse("gh_1", 20.0, 1)))
                .await
                .unwrap();

            let clearing = {
                let store = store.clone();
                tokio::spawn(async move { store.select_greenhouse(None).await })
            };
            let selecting = {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .select_greenhouse(Some(greenhouse("gh_2", 21.0, 1)))
                        .await
                })
            };
            clearing.await.unwrap().unwrap();
            selecting.await.unwrap().unwrap();

            let selected = store
                .state()
                .await
                .selected_greenhouse
                .map(|g| g.greenhouse_id);
            assert_eq!(store.polling_greenhouse_id(), selected);
            store.stop_polling();
        }
    }

    #[tokio::test]
    async fn mismatched_poll_response_does_not_touch_selection() {
        let mut api = MockGreenhouseApi::new();
        api.expect_get_greenhouse()
            .returning(|_| Box::pin(async { Ok(greenhouse("gh_other", 99.0, 1)) }));
        let (store, _) = store_with(api);

        let selected = greenhouse("gh_1", 20.0, 2);
        store.select_greenhouse(Some(selected.clone())).await.unwrap();
        store.stop_polling();

        assert!(!store.refresh_selected().await.unwrap());
        assert_eq!(store.state().await.selected_greenhouse, Some(selected));
    }

    #[tokio::test]
    async fn stale_response_after_reselection_is_discarded() {
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

        let mut api = MockGreenhouseApi::new();
        api.expect_get_greenhouse().returning(move |id| {
            let gate = release_rx.clone();
            let fresh = greenhouse(id, 99.0, 2);
            Box::pin(async move {
                if let Some(rx) = gate.lock().await.take() {
                    let _ = rx.await;
                }
                Ok(fresh)
            })
        });
        let store = Arc::new(store_with(api).0);

        store
            .select_greenhouse(Some(greenhouse("gh_1", 20.0, 2)))
            .await
            .unwrap();
        store.stop_polling();

        let in_flight = {
            let store = store.clone();
            tokio::spawn(async move { store.refresh_selected().await })
        };
        tokio::task::yield_now().await;

        store
            .select_greenhouse(Some(greenhouse("gh_2", 25.0, 1)))
            .await
            .unwrap();
        store.stop_polling();
        let _ = release_tx.send(());

        assert!(!in_flight.await.unwrap().unwrap());
        let state = store.state().await;
        assert_eq!(state.selected_greenhouse.unwrap().greenhouse_id, "gh_2");
    }

    #[tokio::test]
    async fn failed_poll_tick_is_reported_and_state_kept() {
        let mut api = MockGreenhouseApi::new();
        api.expect_get_greenhouse().returning(|_| {
            Box::pin(async { Err(ClientError::Http("connection refused".to_string())) })
        });
        let (store, _) = store_with(api);

        let selected = greenhouse("gh_1", 20.0, 2);
        store.select_greenhouse(Some(selected.clone())).await.unwrap();
        store.stop_polling();

        assert!(store.refresh_selected().await.is_err());
        assert_eq!(store.state().await.selected_greenhouse, Some(selected));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_ticks_do_not_stop_the_timer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut api = MockGreenhouseApi::new();
        api.expect_get_greenhouse().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(ClientError::Http("timeout".to_string())) })
        });
        let (store, _) = store_with(api);

        store
            .select_greenhouse(Some(greenhouse("gh_1", 20.0, 1)))
            .await
            .unwrap();
        tokio::time::sleep(INTERVAL * 3 + Duration::from_millis(100)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(store.is_polling());
    }

    #[tokio::test]
    async fn select_field_rejects_out_of_range_and_missing_selection() {
        let (store, storage) = store_with(MockGreenhouseApi::new());

        assert!(matches!(
            store.select_field(0).await,
            Err(GardenError::NoSelection)
        ));

        store
            .select_greenhouse(Some(greenhouse("gh_1", 20.0, 2)))
            .await
            .unwrap();
        store.stop_polling();

        let err = store.select_field(2).await.unwrap_err();
        assert_eq!(err.code(), error_codes::FIELD_OUT_OF_RANGE);
        assert!(store.state().await.selected_field_index.is_none());

        store.select_field(1).await.unwrap();
        assert_eq!(store.state().await.selected_field_index, Some(1));
        assert_eq!(
            storage.get_item(keys::SELECTED_FIELD_INDEX).await.unwrap().as_deref(),
            Some("1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn clear_selected_options_removes_everything() {
        let mut api = MockGreenhouseApi::new();
        counting_get(&mut api, 30.0);
        let (store, storage) = store_with(api);

        store
            .select_greenhouse(Some(greenhouse("gh_1", 20.0, 2)))
            .await
            .unwrap();
        store.select_field(0).await.unwrap();
        storage.set_item(keys::SELECTED_FIELD_ID, "legacy").await.unwrap();

        store.clear_selected_options().await.unwrap();

        assert!(!store.is_polling());
        let state = store.state().await;
        assert!(state.selected_greenhouse.is_none());
        assert!(state.selected_field.is_none());
        for key in keys::SELECTION {
            assert_eq!(storage.get_item(key).await.unwrap(), None, "{key} still stored");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_without_selected_greenhouse_invalidates_selection() {
        let mut api = MockGreenhouseApi::new();
        api.expect_list_greenhouses()
            .returning(|_| Box::pin(async { Ok(vec![greenhouse("gh_2", 21.0, 1)]) }));
        counting_get(&mut api, 30.0);
        let (store, _) = store_with(api);

        store
            .select_greenhouse(Some(greenhouse("gh_1", 20.0, 1)))
            .await
            .unwrap();
        store.fetch_greenhouses().await.unwrap();

        assert!(!store.is_polling());
        assert!(store.state().await.selected_greenhouse.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn restore_selection_reselects_saved_choice() {
        let mut api = MockGreenhouseApi::new();
        api.expect_list_greenhouses()
            .returning(|_| Box::pin(async { Ok(vec![greenhouse("gh_1", 20.0, 1), greenhouse("gh_2", 21.0, 3)]) }));
        counting_get(&mut api, 30.0);
        let (store, storage) = store_with(api);
        storage.set_item(keys::SELECTED_GREENHOUSE_ID, "gh_2").await.unwrap();
        storage.set_item(keys::SELECTED_FIELD_INDEX, "2").await.unwrap();

        assert!(!store.restore_selection().await.unwrap()); // list not fetched yet

        store.fetch_greenhouses().await.unwrap();
        assert!(store.restore_selection().await.unwrap());

        let state = store.state().await;
        assert_eq!(state.selected_greenhouse.unwrap().greenhouse_id, "gh_2");
        assert_eq!(state.selected_field_index, Some(2));
        assert!(store.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn restore_selection_ignores_invalid_saved_index() {
        let mut api = MockGreenhouseApi::new();
        api.expect_list_greenhouses()
            .returning(|_| Box::pin(async { Ok(vec![greenhouse("gh_1", 20.0, 1)]) }));
        counting_get(&mut api, 30.0);
        let (store, storage) = store_with(api);
        storage.set_item(keys::SELECTED_GREENHOUSE_ID, "gh_1").await.unwrap();
        storage.set_item(keys::SELECTED_FIELD_INDEX, "5").await.unwrap();

        store.fetch_greenhouses().await.unwrap();
        assert!(store.restore_selection().await.unwrap());

        let state = store.state().await;
        assert!(state.selected_greenhouse.is_some());
        assert!(state.selected_field_index.is_none());
    }

    #[tokio::test]
    async fn apply_sensor_update_replaces_series() {
        let (store, _) = store_with(MockGreenhouseApi::new());
        store
            .select_greenhouse(Some(greenhouse("gh_1", 20.0, 2)))
            .await
            .unwrap();
        store.stop_polling();
        store.select_field(1).await.unwrap();

        let reading = Reading {
            value: 55.0,
            unit: "%".to_string(),
            timestamp: "2025-05-01T10:05:00Z".to_string(),
        };
        let update = SensorUpdate {
            greenhouse_id: Some("gh_1".to_string()),
            field_index: 1,
            sensor_type: "humidity_sensor".to_string(),
            sensor_data: vec![reading.clone()],
        };
        assert!(store.apply_sensor_update(&update).await);

        let state = store.state().await;
        assert_eq!(state.selected_field.unwrap().humidity_sensor, vec![reading.clone()]);
        assert_eq!(
            state.selected_greenhouse.unwrap().fields[1].humidity_sensor,
            vec![reading]
        );

        let wrong_field = SensorUpdate {
            field_index: 0,
            ..update.clone()
        };
        assert!(!store.apply_sensor_update(&wrong_field).await);

        let unknown_series = SensorUpdate {
            sensor_type: "co2_sensor".to_string(),
            ..update.clone()
        };
        assert!(!store.apply_sensor_update(&unknown_series).await);

        let other_greenhouse = SensorUpdate {
            greenhouse_id: Some("gh_9".to_string()),
            ..update
        };
        assert!(!store.apply_sensor_update(&other_greenhouse).await);
    }
}
