use glam::DVec2;
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use common::id_type;
use common::normalize_string::NormalizeString;

id_type!(CorrespondenceId);
id_type!(ImageId);

/// A ground control point: a source pixel paired with an optional map-space
/// destination. `id` stays `None` until the backend confirms the record;
/// `index` always equals the record's 1-based position in store order and is
/// never a stable identity across reindexing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrespondenceId>,
    pub image_id: ImageId,
    pub index: u32,
    pub source: DVec2,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<DVec2>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub residual: Option<f64>,
}

impl Correspondence {
    /// A correspondence is complete once the operator has placed the
    /// destination point.
    pub fn is_complete(&self) -> bool {
        self.map.is_some()
    }
}

/// Partial edit applied by `CorrespondenceStore::update`. `None` fields are
/// left untouched.
#[derive(Clone, Copy, Default, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorrespondencePatch {
    pub source: Option<DVec2>,
    pub map: Option<DVec2>,
}

/// Old index to new index, total over the surviving records. Indices absent
/// from the mapping did not survive the mutation that produced it.
pub type ReindexMapping = HashMap<u32, u32>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    #[error("No correspondence with id {0}")]
    IdNotFound(CorrespondenceId),
    #[error("No correspondence at index {0}")]
    IndexNotFound(u32),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Ordered set of correspondences for one image; the single source of truth
/// for index assignment. Every mutation publishes the full ordered sequence
/// to watch subscribers.
#[derive(Debug)]
pub struct CorrespondenceStore {
    image_id: ImageId,
    points: Vec<Correspondence>,
    changes: watch::Sender<Vec<Correspondence>>,
}

impl CorrespondenceStore {
    pub fn new(image_id: ImageId) -> Self {
        assert!(!image_id.is_nil());
        let (changes, _) = watch::channel(Vec::new());
        Self {
            image_id,
            points: Vec::new(),
            changes,
        }
    }

    pub fn image_id(&self) -> ImageId {
        self.image_id
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Correspondence] {
        self.points.as_slice()
    }

    pub fn by_index(&self, index: u32) -> Option<&Correspondence> {
        self.points.iter().find(|p| p.index == index)
    }

    pub fn by_id(&self, id: CorrespondenceId) -> Option<&Correspondence> {
        assert!(!id.is_nil());
        self.points.iter().find(|p| p.id == Some(id))
    }

    pub fn live_indices(&self) -> HashSet<u32> {
        self.points.iter().map(|p| p.index).collect()
    }

    pub fn snapshot(&self) -> Vec<Correspondence> {
        self.points.clone()
    }

    /// Subscribers receive the full ordered sequence after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Correspondence>> {
        self.changes.subscribe()
    }

    /// Appends an unconfirmed record with `index = len + 1`. The id stays
    /// `None` until `confirm` adopts the backend echo.
    pub fn add(&mut self, source: DVec2, map: Option<DVec2>) -> &Correspondence {
        let index = self.points.len() as u32 + 1;
        self.points.push(Correspondence {
            id: None,
            image_id: self.image_id,
            index,
            source,
            map,
            residual: None,
        });
        self.notify();
        self.points.last().expect("point just pushed")
    }

    /// Adopts the server-assigned identity for an optimistically added record.
    pub fn confirm(&mut self, index: u32, authoritative: &Correspondence) -> StoreResult<()> {
        let point = self
            .points
            .iter_mut()
            .find(|p| p.index == index)
            .ok_or(StoreError::IndexNotFound(index))?;

        debug_assert_eq!(point.index, authoritative.index, "backend echoed a different index");
        point.id = authoritative.id;
        self.notify();
        Ok(())
    }

    /// Patches the record with the given id in place, preserving its index.
    /// The record's residual becomes stale and is cleared.
    pub fn update(&mut self, id: CorrespondenceId, patch: &CorrespondencePatch) -> StoreResult<&Correspondence> {
        assert!(!id.is_nil());
        let position = self
            .points
            .iter()
            .position(|p| p.id == Some(id))
            .ok_or(StoreError::IdNotFound(id))?;

        let point = &mut self.points[position];
        if let Some(source) = patch.source {
            point.source = source;
        }
        if let Some(map) = patch.map {
            point.map = Some(map);
        }
        point.residual = None;

        self.notify();
        Ok(&self.points[position])
    }

    /// Writes a previously captured record back over the entry that shares
    /// its index. Used to roll a failed optimistic mutation back.
    pub fn restore(&mut self, record: Correspondence) -> StoreResult<()> {
        let position = self
            .points
            .iter()
            .position(|p| p.index == record.index)
            .ok_or(StoreError::IndexNotFound(record.index))?;

        self.points[position] = record;
        self.notify();
        Ok(())
    }

    /// Removes the record at `index` and reindexes the remainder to `1..=N`.
    /// Returns the removed record and the old-to-new mapping, total over the
    /// survivors, to re-key layer bindings and the selection with.
    pub fn remove(&mut self, index: u32) -> StoreResult<(Correspondence, ReindexMapping)> {
        let position = self
            .points
            .iter()
            .position(|p| p.index == index)
            .ok_or(StoreError::IndexNotFound(index))?;

        let removed = self.points.remove(position);
        let mapping = self.reindex();
        self.notify();
        Ok((removed, mapping))
    }

    fn reindex(&mut self) -> ReindexMapping {
        let mut mapping = ReindexMapping::with_capacity(self.points.len());
        for (position, point) in self.points.iter_mut().enumerate() {
            let new_index = position as u32 + 1;
            mapping.insert(point.index, new_index);
            point.index = new_index;
        }
        assert_eq!(mapping.len(), self.points.len(), "duplicate index before reindexing");
        mapping
    }

    /// With `overwrite` the current sequence is discarded and `records` take
    /// indices `1..=N`; otherwise `records` are appended, continuing the
    /// sequence. Returns the resulting full ordered sequence.
    pub fn bulk_replace(&mut self, records: Vec<Correspondence>, overwrite: bool) -> &[Correspondence] {
        if overwrite {
            self.points.clear();
        }

        let start = self.points.len() as u32;
        for (offset, mut record) in records.into_iter().enumerate() {
            record.image_id = self.image_id;
            record.index = start + offset as u32 + 1;
            self.points.push(record);
        }

        self.notify();
        self.points.as_slice()
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.notify();
    }

    /// Adopts an authoritative re-indexed set (e.g. the `persist_delete`
    /// echo), joining by id. Returns the old-to-new mapping when the local
    /// order had diverged from the server's, `None` when nothing moved.
    pub fn reconcile(&mut self, authoritative: &[Correspondence]) -> Option<ReindexMapping> {
        let server_index_by_id: HashMap<CorrespondenceId, u32> = authoritative
            .iter()
            .filter_map(|p| p.id.map(|id| (id, p.index)))
            .collect();

        let joinable = self
            .points
            .iter()
            .all(|p| p.id.is_some_and(|id| server_index_by_id.contains_key(&id)));
        if !joinable || self.points.len() != authoritative.len() {
            tracing::warn!(
                image_id = %self.image_id,
                local = self.points.len(),
                server = authoritative.len(),
                "authoritative set does not join against local records, skipping reconcile"
            );
            return None;
        }

        let mut mapping = ReindexMapping::with_capacity(self.points.len());
        let mut moved = false;
        for point in self.points.iter_mut() {
            let id = point.id.expect("joinability checked above");
            let new_index = server_index_by_id[&id];
            mapping.insert(point.index, new_index);
            moved |= point.index != new_index;
            point.index = new_index;
        }
        self.points.sort_by_key(|p| p.index);
        self.notify();

        moved.then_some(mapping)
    }

    /// Merges per-point residuals by stable id, never by position. Records
    /// the report does not mention lose their (now stale) residual. Returns
    /// the number of records matched.
    pub fn apply_residuals(&mut self, by_id: &HashMap<CorrespondenceId, f64>) -> usize {
        let mut matched = 0;
        for point in self.points.iter_mut() {
            point.residual = point.id.and_then(|id| by_id.get(&id)).copied();
            matched += point.residual.is_some() as usize;
        }
        self.notify();
        matched
    }

    pub fn clear_residuals(&mut self) {
        for point in self.points.iter_mut() {
            point.residual = None;
        }
        self.notify();
    }

    pub fn to_yaml(&self) -> String {
        serde_yml::to_string(&self.points)
            .expect("Failed to serialize correspondences to YAML")
            .normalize()
    }

    pub fn records_from_yaml(yaml: &str) -> anyhow::Result<Vec<Correspondence>> {
        let records: Vec<Correspondence> = serde_yml::from_str(yaml)?;
        Ok(records)
    }

    pub fn records_from_yaml_file(path: &str) -> anyhow::Result<Vec<Correspondence>> {
        let yaml = std::fs::read_to_string(path)?;
        Self::records_from_yaml(&yaml)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen_ids: HashSet<CorrespondenceId> = HashSet::with_capacity(self.points.len());
        for (position, point) in self.points.iter().enumerate() {
            if point.index != position as u32 + 1 {
                return Err(anyhow::anyhow!(
                    "Index {} at position {} breaks contiguity",
                    point.index,
                    position
                ));
            }
            if point.image_id != self.image_id {
                return Err(anyhow::anyhow!("Record owned by a foreign image"));
            }
            if let Some(id) = point.id {
                if id.is_nil() {
                    return Err(anyhow::anyhow!("Confirmed record has a nil id"));
                }
                if !seen_ids.insert(id) {
                    return Err(anyhow::anyhow!("Duplicate correspondence id {}", id));
                }
            }
        }
        Ok(())
    }

    fn notify(&self) {
        self.changes.send_replace(self.points.clone());
    }
}
