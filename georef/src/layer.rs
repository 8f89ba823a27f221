use std::fmt::Debug;
use std::sync::Arc;

use glam::DVec2;
use hashbrown::{HashMap, HashSet};
use strum_macros::Display;

use common::id_type;

use crate::correspondence::ReindexMapping;

id_type!(MarkerId);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display)]
pub enum MarkerSpace {
    Image,
    Map,
}

/// Opaque handle to a rendered marker. Only `LayerBinding` creates and
/// disposes these; the renderer attaches whatever resources it wants to the
/// id. Deliberately not `Clone`: a handle moves through bind/unbind/dispose
/// exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct MarkerHandle {
    id: MarkerId,
    space: MarkerSpace,
}

impl MarkerHandle {
    /// For renderer implementations building the handle they return from
    /// `create`.
    pub fn allocate(space: MarkerSpace) -> Self {
        Self {
            id: MarkerId::unique(),
            space,
        }
    }

    pub fn id(&self) -> MarkerId {
        self.id
    }

    pub fn space(&self) -> MarkerSpace {
        self.space
    }
}

/// Rendering collaborator. The core never inspects what a marker looks
/// like; it only routes geometry, visibility and disposal through this seam.
pub trait MarkerRenderer: Debug + Send + Sync {
    fn create(&self, space: MarkerSpace, position: DVec2) -> MarkerHandle;
    fn move_to(&self, handle: &MarkerHandle, position: DVec2);
    fn set_visible(&self, handle: &MarkerHandle, visible: bool);
    fn dispose(&self, handle: MarkerHandle);
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum LayerError {
    #[error("Index {index} already has a {space} marker bound")]
    AlreadyBound { index: u32, space: MarkerSpace },
    #[error("Index {index} has no {space} marker bound")]
    NotBound { index: u32, space: MarkerSpace },
}

pub type LayerResult<T> = Result<T, LayerError>;

/// Two index-keyed marker collections, one per space, kept in lockstep with
/// `CorrespondenceStore` order. The maps share a key space but are
/// independent: a correspondence legitimately has an image marker with no
/// map marker until its destination is placed.
#[derive(Debug)]
pub struct LayerBinding {
    renderer: Arc<dyn MarkerRenderer>,
    image_markers: HashMap<u32, MarkerHandle>,
    map_markers: HashMap<u32, MarkerHandle>,
}

impl LayerBinding {
    pub fn new(renderer: Arc<dyn MarkerRenderer>) -> Self {
        Self {
            renderer,
            image_markers: HashMap::new(),
            map_markers: HashMap::new(),
        }
    }

    /// Pure factory; no binding is mutated.
    pub fn create_image_marker(&self, position: DVec2) -> MarkerHandle {
        self.renderer.create(MarkerSpace::Image, position)
    }

    /// Pure factory; no binding is mutated.
    pub fn create_map_marker(&self, position: DVec2) -> MarkerHandle {
        self.renderer.create(MarkerSpace::Map, position)
    }

    pub fn bind(&mut self, index: u32, handle: MarkerHandle, space: MarkerSpace) -> LayerResult<()> {
        assert_eq!(
            handle.space(),
            space,
            "handle created for {} bound into {}",
            handle.space(),
            space
        );

        let markers = self.markers_mut(space);
        if markers.contains_key(&index) {
            return Err(LayerError::AlreadyBound { index, space });
        }
        markers.insert(index, handle);
        Ok(())
    }

    /// Removes and returns the handle; the caller must route it to
    /// `dispose` once any external consumers are done with it.
    pub fn unbind(&mut self, index: u32, space: MarkerSpace) -> Option<MarkerHandle> {
        self.markers_mut(space).remove(&index)
    }

    /// Releases the renderer resource behind the handle.
    pub fn dispose(&self, handle: MarkerHandle) {
        self.renderer.dispose(handle);
    }

    /// Unbinds and disposes both spaces for `index`. Used on every path
    /// that removes a correspondence.
    pub fn release(&mut self, index: u32) {
        if let Some(handle) = self.image_markers.remove(&index) {
            self.renderer.dispose(handle);
        }
        if let Some(handle) = self.map_markers.remove(&index) {
            self.renderer.dispose(handle);
        }
    }

    /// Re-keys both maps atomically. The mapping must be injective; a bound
    /// index absent from the mapping did not survive the owning mutation,
    /// so its handle is disposed rather than leaked (callers normally
    /// `release` removed indices beforehand).
    pub fn reindex(&mut self, mapping: &ReindexMapping) {
        let targets: HashSet<u32> = mapping.values().copied().collect();
        assert_eq!(targets.len(), mapping.len(), "reindex mapping is not injective");

        for space in [MarkerSpace::Image, MarkerSpace::Map] {
            let old: Vec<(u32, MarkerHandle)> = self.markers_mut(space).drain().collect();
            for (index, handle) in old {
                match mapping.get(&index) {
                    Some(&new_index) => {
                        let previous = self.markers_mut(space).insert(new_index, handle);
                        assert!(previous.is_none(), "reindex mapping collides at {}", new_index);
                    }
                    None => self.renderer.dispose(handle),
                }
            }
        }
    }

    /// Moves the marker without changing its identity or style.
    pub fn update_position(&self, index: u32, space: MarkerSpace, position: DVec2) -> LayerResult<()> {
        let handle = self
            .markers(space)
            .get(&index)
            .ok_or(LayerError::NotBound { index, space })?;
        self.renderer.move_to(handle, position);
        Ok(())
    }

    /// Toggles rendering visibility in both spaces without destroying the
    /// handles. A missing map marker (incomplete correspondence) is fine.
    pub fn set_visibility(&self, index: u32, visible: bool) {
        if let Some(handle) = self.image_markers.get(&index) {
            self.renderer.set_visible(handle, visible);
        }
        if let Some(handle) = self.map_markers.get(&index) {
            self.renderer.set_visible(handle, visible);
        }
    }

    pub fn is_bound(&self, index: u32, space: MarkerSpace) -> bool {
        self.markers(space).contains_key(&index)
    }

    pub fn bound_count(&self, space: MarkerSpace) -> usize {
        self.markers(space).len()
    }

    pub fn bound_indices(&self, space: MarkerSpace) -> HashSet<u32> {
        self.markers(space).keys().copied().collect()
    }

    pub fn dispose_all(&mut self) {
        for (_, handle) in self.image_markers.drain() {
            self.renderer.dispose(handle);
        }
        for (_, handle) in self.map_markers.drain() {
            self.renderer.dispose(handle);
        }
    }

    fn markers(&self, space: MarkerSpace) -> &HashMap<u32, MarkerHandle> {
        match space {
            MarkerSpace::Image => &self.image_markers,
            MarkerSpace::Map => &self.map_markers,
        }
    }

    fn markers_mut(&mut self, space: MarkerSpace) -> &mut HashMap<u32, MarkerHandle> {
        match space {
            MarkerSpace::Image => &mut self.image_markers,
            MarkerSpace::Map => &mut self.map_markers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MarkerOp, RecordingRenderer};
    use glam::dvec2;

    fn layers() -> (Arc<RecordingRenderer>, LayerBinding) {
        let renderer = RecordingRenderer::new();
        let layers = LayerBinding::new(renderer.clone());
        (renderer, layers)
    }

    #[test]
    fn bind_rejects_double_binding_per_space() {
        let (_, mut layers) = layers();

        let first = layers.create_image_marker(dvec2(1.0, 1.0));
        layers.bind(1, first, MarkerSpace::Image).unwrap();

        let second = layers.create_image_marker(dvec2(2.0, 2.0));
        let err = layers.bind(1, second, MarkerSpace::Image).unwrap_err();
        assert!(matches!(err, LayerError::AlreadyBound { index: 1, space: MarkerSpace::Image }));

        // the other space is an independent map
        let map_marker = layers.create_map_marker(dvec2(3.0, 3.0));
        layers.bind(1, map_marker, MarkerSpace::Map).unwrap();
    }

    #[test]
    fn unbind_returns_handle_for_disposal() {
        let (renderer, mut layers) = layers();

        let handle = layers.create_image_marker(dvec2(1.0, 1.0));
        let id = handle.id();
        layers.bind(1, handle, MarkerSpace::Image).unwrap();

        let taken = layers.unbind(1, MarkerSpace::Image).unwrap();
        assert_eq!(taken.id(), id);
        assert_eq!(renderer.live_count(), 1);

        layers.dispose(taken);
        assert_eq!(renderer.live_count(), 0);
    }

    #[test]
    fn reindex_rekeys_both_spaces() {
        let (_, mut layers) = layers();

        for index in 1..=3u32 {
            let image = layers.create_image_marker(dvec2(index as f64, 0.0));
            layers.bind(index, image, MarkerSpace::Image).unwrap();
        }
        let map_marker = layers.create_map_marker(dvec2(0.0, 3.0));
        layers.bind(3, map_marker, MarkerSpace::Map).unwrap();

        // index 2 deleted, survivors shift down
        layers.release(2);
        let mapping = ReindexMapping::from_iter([(1, 1), (3, 2)]);
        layers.reindex(&mapping);

        assert_eq!(layers.bound_indices(MarkerSpace::Image), HashSet::from_iter([1, 2]));
        assert_eq!(layers.bound_indices(MarkerSpace::Map), HashSet::from_iter([2]));
    }

    #[test]
    fn reindex_disposes_unmapped_survivors() {
        let (renderer, mut layers) = layers();

        for index in 1..=2u32 {
            let image = layers.create_image_marker(dvec2(index as f64, 0.0));
            layers.bind(index, image, MarkerSpace::Image).unwrap();
        }

        layers.reindex(&ReindexMapping::from_iter([(1, 1)]));
        assert_eq!(layers.bound_count(MarkerSpace::Image), 1);
        assert_eq!(renderer.live_count(), 1);
    }

    #[test]
    #[should_panic(expected = "not injective")]
    fn reindex_rejects_non_injective_mapping() {
        let (_, mut layers) = layers();
        layers.reindex(&ReindexMapping::from_iter([(1, 1), (2, 1)]));
    }

    #[test]
    fn update_position_keeps_identity() {
        let (renderer, mut layers) = layers();

        let handle = layers.create_map_marker(dvec2(1.0, 1.0));
        let id = handle.id();
        layers.bind(1, handle, MarkerSpace::Map).unwrap();
        renderer.take_ops();

        layers.update_position(1, MarkerSpace::Map, dvec2(5.0, 6.0)).unwrap();
        assert_eq!(
            renderer.take_ops(),
            vec![MarkerOp::Moved { id, position: dvec2(5.0, 6.0) }]
        );

        let err = layers.update_position(2, MarkerSpace::Map, dvec2(0.0, 0.0)).unwrap_err();
        assert!(matches!(err, LayerError::NotBound { index: 2, space: MarkerSpace::Map }));
    }

    #[test]
    fn visibility_tolerates_missing_map_marker() {
        let (renderer, mut layers) = layers();

        let image = layers.create_image_marker(dvec2(1.0, 1.0));
        let id = image.id();
        layers.bind(1, image, MarkerSpace::Image).unwrap();
        renderer.take_ops();

        layers.set_visibility(1, false);
        assert_eq!(renderer.take_ops(), vec![MarkerOp::Visibility { id, visible: false }]);
    }

    #[test]
    fn dispose_all_releases_everything() {
        let (renderer, mut layers) = layers();

        for index in 1..=3u32 {
            let image = layers.create_image_marker(dvec2(index as f64, 0.0));
            layers.bind(index, image, MarkerSpace::Image).unwrap();
            let map_marker = layers.create_map_marker(dvec2(0.0, index as f64));
            layers.bind(index, map_marker, MarkerSpace::Map).unwrap();
        }
        assert_eq!(renderer.live_count(), 6);

        layers.dispose_all();
        assert_eq!(renderer.live_count(), 0);
        assert_eq!(layers.bound_count(MarkerSpace::Image), 0);
        assert_eq!(layers.bound_count(MarkerSpace::Map), 0);
    }
}
