use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use glam::{dvec2, DVec2};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tokio::sync::Notify;

use common::Shared;

use crate::correspondence::{Correspondence, CorrespondenceId, CorrespondenceStore, ImageId};
use crate::gateway::{
    GatewayError, GatewayResult, PointResidual, ReconciliationGateway, ResidualReport, Srid,
    TransformationType,
};
use crate::layer::{LayerBinding, MarkerHandle, MarkerId, MarkerRenderer, MarkerSpace};
use crate::residual::{ComputePhase, MIN_POINTS};
use crate::selection::{MemorySelectionStore, SelectionTracker};
use crate::session::SessionState;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MarkerOp {
    Created {
        id: MarkerId,
        space: MarkerSpace,
        position: DVec2,
    },
    Moved {
        id: MarkerId,
        position: DVec2,
    },
    Visibility {
        id: MarkerId,
        visible: bool,
    },
    Disposed {
        id: MarkerId,
    },
}

/// Captures every renderer call so tests can assert on marker lifecycles,
/// and tracks live handles to catch leaks and double disposal.
#[derive(Debug, Default)]
pub(crate) struct RecordingRenderer {
    ops: Mutex<Vec<MarkerOp>>,
    live: Mutex<HashSet<MarkerId>>,
}

impl RecordingRenderer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn take_ops(&self) -> Vec<MarkerOp> {
        std::mem::take(&mut self.ops.lock())
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live.lock().len()
    }
}

impl MarkerRenderer for RecordingRenderer {
    fn create(&self, space: MarkerSpace, position: DVec2) -> MarkerHandle {
        let handle = MarkerHandle::allocate(space);
        self.live.lock().insert(handle.id());
        self.ops.lock().push(MarkerOp::Created {
            id: handle.id(),
            space,
            position,
        });
        handle
    }

    fn move_to(&self, handle: &MarkerHandle, position: DVec2) {
        self.ops.lock().push(MarkerOp::Moved {
            id: handle.id(),
            position,
        });
    }

    fn set_visible(&self, handle: &MarkerHandle, visible: bool) {
        self.ops.lock().push(MarkerOp::Visibility {
            id: handle.id(),
            visible,
        });
    }

    fn dispose(&self, handle: MarkerHandle) {
        assert!(
            self.live.lock().remove(&handle.id()),
            "marker {} disposed twice",
            handle.id()
        );
        self.ops.lock().push(MarkerOp::Disposed { id: handle.id() });
    }
}

/// Scripted behavior for one `compute_residuals` call. A gated script parks
/// at the mock until the gate is notified, which lets tests deliver
/// responses out of order.
#[derive(Debug)]
pub(crate) enum ComputeScript {
    Report {
        result: GatewayResult<ResidualReport>,
        gate: Option<Arc<Notify>>,
    },
    /// Synthesize a success report from the mock's own backend state, with
    /// per-point residuals equal to `rmse`, in reversed point order.
    FromBackend {
        rmse: f64,
        gate: Option<Arc<Notify>>,
    },
}

impl ComputeScript {
    pub(crate) fn report(report: ResidualReport) -> Self {
        Self::Report {
            result: Ok(report),
            gate: None,
        }
    }

    pub(crate) fn report_gated(report: ResidualReport) -> (Arc<Notify>, Self) {
        let gate = Arc::new(Notify::new());
        (
            gate.clone(),
            Self::Report {
                result: Ok(report),
                gate: Some(gate),
            },
        )
    }

    pub(crate) fn error(err: GatewayError) -> Self {
        Self::Report {
            result: Err(err),
            gate: None,
        }
    }

    pub(crate) fn from_backend(rmse: f64) -> Self {
        Self::FromBackend { rmse, gate: None }
    }

    pub(crate) fn from_backend_gated(rmse: f64) -> (Arc<Notify>, Self) {
        let gate = Arc::new(Notify::new());
        (
            gate.clone(),
            Self::FromBackend {
                rmse,
                gate: Some(gate),
            },
        )
    }
}

/// In-memory stand-in for the persistence/computation service: assigns ids
/// and indices server-side, echoes authoritative records, and replays
/// scripted compute reports. An unscripted compute call synthesizes a
/// success report with `rmse = 0.1`.
#[derive(Debug, Default)]
pub(crate) struct MockGateway {
    images: Mutex<HashMap<ImageId, Vec<Correspondence>>>,
    compute_scripts: Mutex<VecDeque<ComputeScript>>,
    fail_next: Mutex<Option<GatewayError>>,
    completed_computes: Mutex<usize>,
}

impl MockGateway {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn script_compute(&self, script: ComputeScript) {
        self.compute_scripts.lock().push_back(script);
    }

    /// The next persist_* call fails with `err` instead of applying.
    pub(crate) fn fail_next(&self, err: GatewayError) {
        *self.fail_next.lock() = Some(err);
    }

    pub(crate) fn completed_computes(&self) -> usize {
        *self.completed_computes.lock()
    }

    pub(crate) fn server_points(&self, image_id: ImageId) -> Vec<Correspondence> {
        self.images.lock().get(&image_id).cloned().unwrap_or_default()
    }

    fn take_failure(&self) -> Option<GatewayError> {
        self.fail_next.lock().take()
    }

    fn reindex(points: &mut [Correspondence]) {
        for (position, point) in points.iter_mut().enumerate() {
            point.index = position as u32 + 1;
        }
    }
}

#[async_trait]
impl ReconciliationGateway for MockGateway {
    async fn persist_add(
        &self,
        image_id: ImageId,
        source: DVec2,
        map: Option<DVec2>,
    ) -> GatewayResult<Correspondence> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }

        let mut images = self.images.lock();
        let points = images.entry(image_id).or_default();
        let record = Correspondence {
            id: Some(CorrespondenceId::unique()),
            image_id,
            index: points.len() as u32 + 1,
            source,
            map,
            residual: None,
        };
        points.push(record.clone());
        Ok(record)
    }

    async fn persist_update(&self, record: &Correspondence) -> GatewayResult<Correspondence> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }

        let mut images = self.images.lock();
        let points = images
            .get_mut(&record.image_id)
            .ok_or_else(|| GatewayError::NotFound(record.image_id.to_string()))?;
        let point = points
            .iter_mut()
            .find(|p| p.id == record.id)
            .ok_or_else(|| GatewayError::NotFound(format!("{:?}", record.id)))?;

        point.source = record.source;
        point.map = record.map;
        Ok(point.clone())
    }

    async fn persist_delete(&self, id: CorrespondenceId) -> GatewayResult<Vec<Correspondence>> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }

        let mut images = self.images.lock();
        for points in images.values_mut() {
            if let Some(position) = points.iter().position(|p| p.id == Some(id)) {
                points.remove(position);
                Self::reindex(points);
                return Ok(points.clone());
            }
        }
        Err(GatewayError::NotFound(id.to_string()))
    }

    async fn persist_bulk_load(
        &self,
        image_id: ImageId,
        records: &[Correspondence],
        overwrite: bool,
    ) -> GatewayResult<Vec<Correspondence>> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }

        let mut images = self.images.lock();
        let points = images.entry(image_id).or_default();
        if overwrite {
            points.clear();
        }
        for record in records {
            let mut record = record.clone();
            record.id = record.id.or_else(|| Some(CorrespondenceId::unique()));
            record.image_id = image_id;
            record.index = points.len() as u32 + 1;
            points.push(record);
        }
        Ok(points.clone())
    }

    async fn compute_residuals(
        &self,
        image_id: ImageId,
        _transformation: TransformationType,
        _srid: Srid,
    ) -> GatewayResult<ResidualReport> {
        let script = self
            .compute_scripts
            .lock()
            .pop_front()
            .unwrap_or(ComputeScript::FromBackend {
                rmse: 0.1,
                gate: None,
            });

        let result = match script {
            ComputeScript::Report { result, gate } => {
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                result
            }
            ComputeScript::FromBackend { rmse, gate } => {
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                let mut residuals: Vec<PointResidual> = self
                    .server_points(image_id)
                    .iter()
                    .filter_map(|p| p.id.map(|id| PointResidual { id, residual: rmse }))
                    .collect();
                residuals.reverse();
                Ok(ResidualReport {
                    success: true,
                    residuals,
                    rmse: Some(rmse),
                    min_points_required: MIN_POINTS as u32,
                })
            }
        };

        *self.completed_computes.lock() += 1;
        result
    }
}

/// Yields until `condition` holds, then a few extra times so tasks woken by
/// it can run to completion. Panics if the condition never holds.
pub(crate) async fn drain_pending(condition: impl Fn() -> bool) {
    let mut satisfied = false;
    for _ in 0..1000 {
        if condition() {
            satisfied = true;
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(satisfied, "drain_pending condition never became true");
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// A session state with `points` confirmed, complete correspondences and
/// markers bound in both spaces. The ids are local only; the mock gateway
/// knows nothing about them.
pub(crate) fn session_state(points: usize) -> Shared<SessionState> {
    let image_id = ImageId::unique();
    let mut store = CorrespondenceStore::new(image_id);
    let mut layers = LayerBinding::new(RecordingRenderer::new());
    let selection = SelectionTracker::new(image_id, MemorySelectionStore::new());

    for n in 0..points {
        let source = dvec2(n as f64 * 10.0, n as f64 * 5.0);
        let map = Some(dvec2(n as f64, -(n as f64)));
        let index = store.add(source, map).index;
        let echo = Correspondence {
            id: Some(CorrespondenceId::unique()),
            image_id,
            index,
            source,
            map,
            residual: None,
        };
        store.confirm(index, &echo).unwrap();

        let image_marker = layers.create_image_marker(source);
        layers.bind(index, image_marker, MarkerSpace::Image).unwrap();
        let map_marker = layers.create_map_marker(map.unwrap());
        layers.bind(index, map_marker, MarkerSpace::Map).unwrap();
    }

    Shared::new(SessionState {
        store,
        layers,
        selection,
        persisted_selection: Vec::new(),
        rmse: None,
        phase: ComputePhase::Idle,
    })
}
