use std::fmt::Debug;

use async_trait::async_trait;
use glam::DVec2;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::correspondence::{Correspondence, CorrespondenceId, ImageId};

/// Transform families the computation service can fit to a correspondence set.
#[derive(
    Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize, Display, EnumString,
)]
pub enum TransformationType {
    #[default]
    Polynomial1,
    Polynomial2,
    Polynomial3,
    ThinPlateSpline,
    Projective,
}

/// Spatial reference system identifier for map-space coordinates.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Srid(pub u32);

impl Default for Srid {
    fn default() -> Self {
        // web mercator
        Srid(3857)
    }
}

impl std::fmt::Display for Srid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EPSG:{}", self.0)
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Index {index} already taken for this image")]
    Conflict { index: u32 },
    #[error("Not found on the server: {0}")]
    NotFound(String),
    #[error("Rejected by the server: {0}")]
    Validation(String),
    #[error("Backend unreachable: {0}")]
    Transport(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointResidual {
    pub id: CorrespondenceId,
    pub residual: f64,
}

/// Outcome of a residual computation round-trip. `residuals` are keyed by
/// correspondence id; their ordering carries no meaning.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResidualReport {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub residuals: Vec<PointResidual>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rmse: Option<f64>,
    pub min_points_required: u32,
}

/// Boundary to the remote persistence/computation service. Mutating calls
/// echo back the authoritative record(s) with server-assigned ids and
/// indices; local state is not final until reconciled against that echo.
#[async_trait]
pub trait ReconciliationGateway: Debug + Send + Sync {
    async fn persist_add(
        &self,
        image_id: ImageId,
        source: DVec2,
        map: Option<DVec2>,
    ) -> GatewayResult<Correspondence>;

    async fn persist_update(&self, record: &Correspondence) -> GatewayResult<Correspondence>;

    /// Returns the authoritative remaining, re-indexed set.
    async fn persist_delete(&self, id: CorrespondenceId) -> GatewayResult<Vec<Correspondence>>;

    async fn persist_bulk_load(
        &self,
        image_id: ImageId,
        records: &[Correspondence],
        overwrite: bool,
    ) -> GatewayResult<Vec<Correspondence>>;

    async fn compute_residuals(
        &self,
        image_id: ImageId,
        transformation: TransformationType,
        srid: Srid,
    ) -> GatewayResult<ResidualReport>;
}
