use std::sync::Arc;

use glam::DVec2;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use common::Shared;

use crate::correspondence::{
    Correspondence, CorrespondenceId, CorrespondencePatch, CorrespondenceStore, ImageId,
    StoreError,
};
use crate::gateway::{GatewayError, ReconciliationGateway, Srid, TransformationType};
use crate::layer::{LayerBinding, MarkerRenderer, MarkerSpace};
use crate::residual::{ComputeCallback, ComputePhase, ResidualCoordinator};
use crate::selection::{SelectionStore, SelectionTracker};

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub transformation: TransformationType,
    pub srid: Srid,
}

/// Everything that must stay mutually consistent for one image, guarded by
/// one lock so a mutation's whole round-trip serializes against the next.
#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) store: CorrespondenceStore,
    pub(crate) layers: LayerBinding,
    pub(crate) selection: SelectionTracker,
    pub(crate) persisted_selection: Vec<u32>,
    pub(crate) rmse: Option<f64>,
    pub(crate) phase: ComputePhase,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Duplicate index {index} reported by the backend")]
    DuplicateIndex { index: u32 },
    #[error("Correspondence not found: {0}")]
    NotFound(String),
    #[error("Invalid coordinates: {0}")]
    Validation(String),
    #[error("Backend unreachable: {0}")]
    Transport(String),
}

pub type SessionResult<T> = Result<T, SessionError>;

impl From<GatewayError> for SessionError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Conflict { index } => SessionError::DuplicateIndex { index },
            GatewayError::NotFound(what) => SessionError::NotFound(what),
            GatewayError::Validation(why) => SessionError::Validation(why),
            GatewayError::Transport(why) => SessionError::Transport(why),
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        SessionError::NotFound(err.to_string())
    }
}

fn validate_coords(position: DVec2) -> SessionResult<()> {
    if position.x.is_finite() && position.y.is_finite() {
        Ok(())
    } else {
        Err(SessionError::Validation(format!(
            "non-finite coordinate ({}, {})",
            position.x, position.y
        )))
    }
}

/// Per-image orchestrator over store, layers, selection and residuals. One
/// instance lives exactly as long as its image: constructed when the image
/// loads, discarded on reset or successful rectification. Mutations apply
/// optimistically, reconcile against the gateway echo, and roll back to the
/// last-known-good state on typed failure; residual recomputation is
/// triggered after every successful mutation and superseded by the next.
#[derive(Debug)]
pub struct ImageSession {
    image_id: ImageId,
    config: SessionConfig,
    gateway: Arc<dyn ReconciliationGateway>,
    inner: Shared<SessionState>,
    residuals: ResidualCoordinator,
}

impl ImageSession {
    pub fn open(
        image_id: ImageId,
        config: SessionConfig,
        gateway: Arc<dyn ReconciliationGateway>,
        renderer: Arc<dyn MarkerRenderer>,
        selection_store: Arc<dyn SelectionStore>,
        on_compute: ComputeCallback,
    ) -> Self {
        assert!(!image_id.is_nil());

        let store = CorrespondenceStore::new(image_id);
        let layers = LayerBinding::new(renderer);
        let selection = SelectionTracker::new(image_id, selection_store);
        // read once; the live set to intersect against arrives later
        let persisted_selection = selection.load_persisted();

        info!(%image_id, %config.srid, transformation = %config.transformation, "Opening correspondence session");

        Self {
            image_id,
            config,
            gateway,
            inner: Shared::new(SessionState {
                store,
                layers,
                selection,
                persisted_selection,
                rmse: None,
                phase: ComputePhase::Idle,
            }),
            residuals: ResidualCoordinator::new(on_compute),
        }
    }

    pub fn image_id(&self) -> ImageId {
        self.image_id
    }

    pub fn config(&self) -> SessionConfig {
        self.config
    }

    /// Appends a correspondence. The record lands locally first; the
    /// backend echo supplies its id. A backend index conflict means the
    /// candidate is not kept locally.
    pub async fn add_point(
        &self,
        source: DVec2,
        map: Option<DVec2>,
    ) -> SessionResult<Correspondence> {
        validate_coords(source)?;
        if let Some(map) = map {
            validate_coords(map)?;
        }

        let mut guard = self.inner.lock().await;
        let state = &mut *guard;

        let index = state.store.add(source, map).index;
        let image_marker = state.layers.create_image_marker(source);
        state
            .layers
            .bind(index, image_marker, MarkerSpace::Image)
            .expect("fresh index already bound");
        if let Some(map) = map {
            let map_marker = state.layers.create_map_marker(map);
            state
                .layers
                .bind(index, map_marker, MarkerSpace::Map)
                .expect("fresh index already bound");
        }

        match self.gateway.persist_add(self.image_id, source, map).await {
            Ok(authoritative) => {
                state
                    .store
                    .confirm(index, &authoritative)
                    .expect("optimistic record vanished");
                state.selection.note_added(index, &state.layers);
                self.schedule_residuals(state);
                Ok(state
                    .store
                    .by_index(index)
                    .cloned()
                    .expect("optimistic record vanished"))
            }
            Err(err) => {
                warn!(image_id = %self.image_id, index, "Rolling back optimistic add: {err}");
                state.layers.release(index);
                let (_, mapping) = state
                    .store
                    .remove(index)
                    .expect("optimistic record vanished");
                state.layers.reindex(&mapping);
                Err(err.into())
            }
        }
    }

    /// Edits the correspondence with the given id, preserving its index. A
    /// server-side `NotFound` reconciles by dropping the local entry; other
    /// failures restore the record and marker geometry it had before.
    pub async fn update_point(
        &self,
        id: CorrespondenceId,
        patch: CorrespondencePatch,
    ) -> SessionResult<Correspondence> {
        if let Some(source) = patch.source {
            validate_coords(source)?;
        }
        if let Some(map) = patch.map {
            validate_coords(map)?;
        }

        let mut guard = self.inner.lock().await;
        let state = &mut *guard;

        let prior = state
            .store
            .by_id(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let index = prior.index;

        let updated = state.store.update(id, &patch)?.clone();

        if patch.source.is_some() {
            state
                .layers
                .update_position(index, MarkerSpace::Image, updated.source)
                .expect("image marker missing for live index");
        }
        let mut created_map_marker = false;
        if let Some(map) = patch.map {
            if state.layers.is_bound(index, MarkerSpace::Map) {
                state
                    .layers
                    .update_position(index, MarkerSpace::Map, map)
                    .expect("map marker bound but missing");
            } else {
                let map_marker = state.layers.create_map_marker(map);
                state
                    .layers
                    .bind(index, map_marker, MarkerSpace::Map)
                    .expect("map marker bound but missing");
                created_map_marker = true;
                // the destination appears with the selection state its
                // image-side half already has
                state
                    .layers
                    .set_visibility(index, state.selection.is_selected(index));
            }
        }

        match self.gateway.persist_update(&updated).await {
            Ok(_authoritative) => {
                debug_assert_eq!(_authoritative.id, updated.id);
                self.schedule_residuals(state);
                Ok(updated)
            }
            Err(GatewayError::NotFound(what)) => {
                warn!(image_id = %self.image_id, index, "Record vanished server-side, dropping local entry");
                state.layers.release(index);
                let (_, mapping) = state.store.remove(index).expect("record just found");
                state.layers.reindex(&mapping);
                state
                    .selection
                    .remove_and_remap(index, &mapping, &state.layers);
                self.schedule_residuals(state);
                Err(SessionError::NotFound(what))
            }
            Err(err) => {
                warn!(image_id = %self.image_id, index, "Restoring record after failed update: {err}");
                if created_map_marker {
                    if let Some(handle) = state.layers.unbind(index, MarkerSpace::Map) {
                        state.layers.dispose(handle);
                    }
                }
                if patch.source.is_some() {
                    state
                        .layers
                        .update_position(index, MarkerSpace::Image, prior.source)
                        .expect("image marker missing for live index");
                }
                if let (Some(_), Some(prior_map), false) = (patch.map, prior.map, created_map_marker)
                {
                    state
                        .layers
                        .update_position(index, MarkerSpace::Map, prior_map)
                        .expect("map marker bound but missing");
                }
                state.store.restore(prior).expect("record just found");
                Err(err.into())
            }
        }
    }

    /// Deletes the correspondence at `index`. The backend acknowledges
    /// first; only then are markers disposed, survivors reindexed and the
    /// selection remapped, so a failed round-trip leaves local state
    /// untouched. The echoed authoritative set settles any ordering
    /// divergence.
    pub async fn remove_point(&self, index: u32) -> SessionResult<()> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;

        let record = state
            .store
            .by_index(index)
            .cloned()
            .ok_or(StoreError::IndexNotFound(index))?;

        let authoritative = match record.id {
            Some(id) => match self.gateway.persist_delete(id).await {
                Ok(remaining) => Some(remaining),
                Err(GatewayError::NotFound(_)) => {
                    // already gone server-side; dropping locally settles it
                    warn!(image_id = %self.image_id, index, "Record was already deleted server-side");
                    None
                }
                Err(err) => return Err(err.into()),
            },
            // never confirmed, nothing to delete remotely
            None => None,
        };

        state.layers.release(index);
        let (_, mapping) = state.store.remove(index).expect("record just found");
        state.layers.reindex(&mapping);
        state
            .selection
            .remove_and_remap(index, &mapping, &state.layers);

        if let Some(authoritative) = authoritative {
            if let Some(extra) = state.store.reconcile(&authoritative) {
                state.layers.reindex(&extra);
                state.selection.remap(&extra, &state.layers);
            }
        }

        self.schedule_residuals(state);
        Ok(())
    }

    /// Loads a record set through the backend. With `overwrite` every prior
    /// binding is disposed and the store rebuilt from the authoritative
    /// echo; otherwise the echoed tail is appended. Loaded records start
    /// out selected, like any other fresh correspondence.
    pub async fn bulk_load(
        &self,
        records: Vec<Correspondence>,
        overwrite: bool,
    ) -> SessionResult<Vec<Correspondence>> {
        for record in &records {
            validate_coords(record.source)?;
            if let Some(map) = record.map {
                validate_coords(map)?;
            }
        }

        let mut guard = self.inner.lock().await;
        let state = &mut *guard;

        let authoritative = self
            .gateway
            .persist_bulk_load(self.image_id, &records, overwrite)
            .await?;

        let fresh: Vec<Correspondence> = if overwrite {
            state.layers.dispose_all();
            state.selection.clear(&state.layers);
            state.store.bulk_replace(authoritative, true);
            state.store.snapshot()
        } else {
            let prior_count = state.store.len() as u32;
            let tail: Vec<Correspondence> = authoritative
                .into_iter()
                .filter(|r| r.index > prior_count)
                .collect();
            state.store.bulk_replace(tail.clone(), false);
            tail
        };

        for record in &fresh {
            let image_marker = state.layers.create_image_marker(record.source);
            state
                .layers
                .bind(record.index, image_marker, MarkerSpace::Image)
                .expect("index freshly assigned");
            if let Some(map) = record.map {
                let map_marker = state.layers.create_map_marker(map);
                state
                    .layers
                    .bind(record.index, map_marker, MarkerSpace::Map)
                    .expect("index freshly assigned");
            }
            state.selection.note_added(record.index, &state.layers);
        }

        self.schedule_residuals(state);
        Ok(state.store.snapshot())
    }

    /// Local discard for an image reset: markers disposed, store and
    /// selection emptied, metric cleared, any in-flight computation
    /// superseded.
    pub async fn clear(&self) {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;

        state.layers.dispose_all();
        state.store.clear();
        state.selection.clear(&state.layers);
        state.rmse = None;
        state.phase = ComputePhase::Idle;
        self.residuals.invalidate();
    }

    /// Narrows the selection to the persisted set read when the session
    /// opened, intersected with what actually survived loading. Stale
    /// indices are dropped, never resurrected.
    pub async fn restore_selection(&self) {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;

        let live = state.store.live_indices();
        let persisted = state.persisted_selection.clone();
        state.selection.restore(&persisted, &live, &state.layers);
    }

    pub async fn select(&self, index: u32) -> SessionResult<()> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        if state.store.by_index(index).is_none() {
            return Err(StoreError::IndexNotFound(index).into());
        }
        state.selection.select(index, &state.layers);
        Ok(())
    }

    pub async fn deselect(&self, index: u32) -> SessionResult<()> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        if state.store.by_index(index).is_none() {
            return Err(StoreError::IndexNotFound(index).into());
        }
        state.selection.deselect(index, &state.layers);
        Ok(())
    }

    pub async fn toggle_selection(&self, index: u32) -> SessionResult<()> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        if state.store.by_index(index).is_none() {
            return Err(StoreError::IndexNotFound(index).into());
        }
        state.selection.toggle(index, &state.layers);
        Ok(())
    }

    pub async fn select_all(&self) {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let live: Vec<u32> = state.store.points().iter().map(|p| p.index).collect();
        state.selection.select_all(live, &state.layers);
    }

    pub async fn clear_selection(&self) {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        state.selection.clear(&state.layers);
    }

    pub async fn snapshot(&self) -> Vec<Correspondence> {
        self.inner.lock().await.store.snapshot()
    }

    pub async fn subscribe(&self) -> watch::Receiver<Vec<Correspondence>> {
        self.inner.lock().await.store.subscribe()
    }

    pub async fn selected(&self) -> Vec<u32> {
        self.inner.lock().await.selection.selected()
    }

    pub async fn rmse(&self) -> Option<f64> {
        self.inner.lock().await.rmse
    }

    pub async fn compute_phase(&self) -> ComputePhase {
        self.inner.lock().await.phase
    }

    pub async fn export_yaml(&self) -> String {
        self.inner.lock().await.store.to_yaml()
    }

    /// Cross-component invariant check: contiguous indices, image marker
    /// per record, map marker iff the destination is set, no orphaned
    /// bindings, selection a subset of live indices.
    pub async fn validate(&self) -> anyhow::Result<()> {
        let guard = self.inner.lock().await;
        let state = &*guard;

        state.store.validate()?;

        let live = state.store.live_indices();
        for point in state.store.points() {
            if !state.layers.is_bound(point.index, MarkerSpace::Image) {
                return Err(anyhow::anyhow!(
                    "Index {} is missing its image marker",
                    point.index
                ));
            }
            if state.layers.is_bound(point.index, MarkerSpace::Map) != point.is_complete() {
                return Err(anyhow::anyhow!(
                    "Index {} map marker does not match its destination state",
                    point.index
                ));
            }
        }
        for space in [MarkerSpace::Image, MarkerSpace::Map] {
            for index in state.layers.bound_indices(space) {
                if !live.contains(&index) {
                    return Err(anyhow::anyhow!("Orphaned {} binding at index {}", space, index));
                }
            }
        }
        for index in state.selection.selected() {
            if !live.contains(&index) {
                return Err(anyhow::anyhow!("Selected index {} is not live", index));
            }
        }
        Ok(())
    }

    fn schedule_residuals(&self, state: &mut SessionState) {
        self.residuals.schedule(
            state,
            self.inner.clone(),
            self.gateway.clone(),
            self.config,
        );
    }
}
