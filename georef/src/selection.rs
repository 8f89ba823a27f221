use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tracing::warn;

use common::{deserialize, serialize, FileFormat};

use crate::correspondence::{ImageId, ReindexMapping};
use crate::layer::LayerBinding;

/// Durable key-value surface for `{ image -> selected indices }`. Read once
/// when a session opens, written on every selection mutation. Load/save are
/// best-effort: a missing or unreadable backing store yields an empty set.
pub trait SelectionStore: Debug + Send + Sync {
    fn load(&self, image_id: ImageId) -> Vec<u32>;
    fn save(&self, image_id: ImageId, indices: &[u32]);
}

#[derive(Debug, Default)]
pub struct MemorySelectionStore {
    entries: Mutex<HashMap<ImageId, Vec<u32>>>,
}

impl MemorySelectionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl SelectionStore for MemorySelectionStore {
    fn load(&self, image_id: ImageId) -> Vec<u32> {
        self.entries.lock().get(&image_id).cloned().unwrap_or_default()
    }

    fn save(&self, image_id: ImageId, indices: &[u32]) {
        self.entries.lock().insert(image_id, indices.to_vec());
    }
}

/// Single JSON file holding the selection sets of every image.
#[derive(Debug)]
pub struct FileSelectionStore {
    path: PathBuf,
}

impl FileSelectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self { path: path.into() })
    }

    fn read_all(&self) -> HashMap<ImageId, Vec<u32>> {
        let Ok(text) = std::fs::read_to_string(&self.path) else {
            return HashMap::new();
        };
        match deserialize(&text, FileFormat::Json) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %self.path.display(), "Unreadable selection file, starting empty: {e}");
                HashMap::new()
            }
        }
    }
}

impl SelectionStore for FileSelectionStore {
    fn load(&self, image_id: ImageId) -> Vec<u32> {
        self.read_all().get(&image_id).cloned().unwrap_or_default()
    }

    fn save(&self, image_id: ImageId, indices: &[u32]) {
        let mut entries = self.read_all();
        entries.insert(image_id, indices.to_vec());
        let text = serialize(&entries, FileFormat::Json);
        if let Err(e) = std::fs::write(&self.path, text) {
            warn!(path = %self.path.display(), "Failed to persist selection: {e}");
        }
    }
}

/// Which indices are currently active, i.e. visible in both layer
/// collections. Always a subset of the live store indices; every mutation
/// drives `LayerBinding` visibility and writes through the selection store.
#[derive(Debug)]
pub struct SelectionTracker {
    image_id: ImageId,
    selected: HashSet<u32>,
    store: Arc<dyn SelectionStore>,
}

impl SelectionTracker {
    pub fn new(image_id: ImageId, store: Arc<dyn SelectionStore>) -> Self {
        Self {
            image_id,
            selected: HashSet::new(),
            store,
        }
    }

    pub fn is_selected(&self, index: u32) -> bool {
        self.selected.contains(&index)
    }

    pub fn selected(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.selected.iter().copied().collect();
        indices.sort_unstable();
        indices
    }

    pub fn len(&self) -> usize {
        self.selected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    pub fn load_persisted(&self) -> Vec<u32> {
        self.store.load(self.image_id)
    }

    pub fn select(&mut self, index: u32, layers: &LayerBinding) {
        if self.selected.insert(index) {
            layers.set_visibility(index, true);
            self.persist();
        }
    }

    pub fn deselect(&mut self, index: u32, layers: &LayerBinding) {
        if self.selected.remove(&index) {
            layers.set_visibility(index, false);
            self.persist();
        }
    }

    pub fn toggle(&mut self, index: u32, layers: &LayerBinding) {
        if self.selected.contains(&index) {
            self.deselect(index, layers);
        } else {
            self.select(index, layers);
        }
    }

    pub fn select_all<I: IntoIterator<Item = u32>>(&mut self, live: I, layers: &LayerBinding) {
        self.selected = live.into_iter().collect();
        for &index in self.selected.iter() {
            layers.set_visibility(index, true);
        }
        self.persist();
    }

    pub fn clear(&mut self, layers: &LayerBinding) {
        for &index in self.selected.iter() {
            layers.set_visibility(index, false);
        }
        self.selected.clear();
        self.persist();
    }

    /// A fresh correspondence starts out selected; nothing else changes.
    pub fn note_added(&mut self, index: u32, layers: &LayerBinding) {
        self.select(index, layers);
    }

    /// Drops the deleted index and re-keys the survivors through the same
    /// mapping the store reindexed with, in one operation: there is no
    /// intermediate state where a deleted index counts as selected.
    pub fn remove_and_remap(&mut self, index: u32, mapping: &ReindexMapping, layers: &LayerBinding) {
        self.selected.remove(&index);
        self.remap(mapping, layers);
    }

    /// Re-keys the selection through an old-to-new index mapping. Indices
    /// absent from the mapping did not survive and are dropped.
    pub fn remap(&mut self, mapping: &ReindexMapping, _layers: &LayerBinding) {
        self.selected = self
            .selected
            .iter()
            .filter_map(|index| mapping.get(index).copied())
            .collect();
        self.persist();
    }

    /// Intersects a persisted set with the live indices: survivors become
    /// selected, stale indices are silently dropped, and visibility is
    /// materialized for every live index.
    pub fn restore(&mut self, persisted: &[u32], live: &HashSet<u32>, layers: &LayerBinding) {
        self.selected = persisted.iter().copied().filter(|i| live.contains(i)).collect();
        for &index in live.iter() {
            layers.set_visibility(index, self.selected.contains(&index));
        }
        self.persist();
    }

    fn persist(&self) {
        self.store.save(self.image_id, &self.selected());
    }
}
