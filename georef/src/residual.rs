use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use strum_macros::Display;
use tracing::{debug, warn};

use common::Shared;

use crate::correspondence::CorrespondenceId;
use crate::gateway::ReconciliationGateway;
use crate::session::{SessionConfig, SessionState};

/// Fewer correspondences than this cannot constrain any transform; the
/// computation service is not consulted below it.
pub const MIN_POINTS: usize = 3;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Display)]
pub enum ComputePhase {
    #[default]
    Idle,
    Computing,
    Applied,
    Cleared,
    Failed,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ComputeOutcome {
    Applied { rmse: Option<f64> },
    Cleared,
    Failed { message: String },
}

pub type ComputeCallback = Arc<dyn Fn(ComputeOutcome) + Send + Sync>;

/// Decides when a residual recomputation is warranted, issues it, and
/// merges the response back into the store by stable id. At most one
/// computation per image is of interest at any time: scheduling bumps a
/// monotonically increasing token, and the spawned task re-checks that
/// token under the state lock before applying, so a superseded response is
/// ignored no matter when it arrives. No timers anywhere.
pub struct ResidualCoordinator {
    token: Arc<AtomicU64>,
    callback: ComputeCallback,
}

impl std::fmt::Debug for ResidualCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResidualCoordinator")
            .field("token", &self.token.load(Ordering::SeqCst))
            .finish()
    }
}

impl ResidualCoordinator {
    pub fn new(callback: ComputeCallback) -> Self {
        Self {
            token: Arc::new(AtomicU64::new(0)),
            callback,
        }
    }

    /// Cancels interest in any in-flight response.
    pub(crate) fn invalidate(&self) {
        self.token.fetch_add(1, Ordering::SeqCst);
    }

    /// Called after every successful store mutation, with the session lock
    /// held. Below `MIN_POINTS` the metric is cleared without a round-trip;
    /// otherwise a computation is spawned that supersedes any earlier one.
    pub(crate) fn schedule(
        &self,
        state: &mut SessionState,
        shared: Shared<SessionState>,
        gateway: Arc<dyn ReconciliationGateway>,
        config: SessionConfig,
    ) {
        if state.store.len() < MIN_POINTS {
            self.invalidate();
            state.store.clear_residuals();
            state.rmse = None;
            state.phase = ComputePhase::Cleared;
            (self.callback)(ComputeOutcome::Cleared);
            return;
        }

        let token = self.token.fetch_add(1, Ordering::SeqCst) + 1;
        state.phase = ComputePhase::Computing;

        let image_id = state.store.image_id();
        let latest = self.token.clone();
        let callback = self.callback.clone();
        tokio::spawn(async move {
            let result = gateway
                .compute_residuals(image_id, config.transformation, config.srid)
                .await;

            let mut state = shared.lock().await;
            if latest.load(Ordering::SeqCst) != token {
                debug!(%image_id, token, "Dropping superseded residual response");
                return;
            }

            match result {
                Ok(report) if report.success => {
                    let by_id: HashMap<CorrespondenceId, f64> = report
                        .residuals
                        .iter()
                        .map(|r| (r.id, r.residual))
                        .collect();
                    let matched = state.store.apply_residuals(&by_id);
                    if matched < state.store.len() {
                        warn!(
                            %image_id,
                            matched,
                            count = state.store.len(),
                            "Residual report left records unmatched"
                        );
                    }
                    state.rmse = report.rmse;
                    state.phase = ComputePhase::Applied;
                    (callback)(ComputeOutcome::Applied { rmse: report.rmse });
                }
                Ok(report) => {
                    // degenerate configuration: the fit itself failed
                    debug!(%image_id, min = report.min_points_required, "Computation reported no success");
                    state.store.clear_residuals();
                    state.rmse = None;
                    state.phase = ComputePhase::Cleared;
                    (callback)(ComputeOutcome::Cleared);
                }
                Err(e) => {
                    // transient failure must not erase a previously valid
                    // reading; values stay at last-known
                    warn!(%image_id, "Residual computation failed: {e}");
                    state.phase = ComputePhase::Failed;
                    (callback)(ComputeOutcome::Failed {
                        message: e.to_string(),
                    });
                }
            }
        });
    }
}
