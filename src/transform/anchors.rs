//! Anchor registry: keyed screen geometry shared between the views that draw
//! items and the animation that morphs between them.
//!
//! Writers swap whole records in under a single lock, so a reader never sees a
//! record with geometry from one update and content from another.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::geometry::{Point, Size};

/// Position and size of an item on screen.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AnchorGeometry {
    pub position: Point,
    pub size: Size,
}

impl AnchorGeometry {
    pub const fn new(position: Point, size: Size) -> Self {
        Self { position, size }
    }
}

/// Decides from the current geometry whether an item is eligible for lookup.
///
/// Runs while the registry is locked and must not call back into it.
pub type InBoundsPredicate = Arc<dyn Fn(&AnchorGeometry) -> bool + Send + Sync>;

/// One registered item. Records are immutable; updates swap in a new record.
#[derive(Clone)]
pub struct AnchorRecord<C> {
    pub geometry: AnchorGeometry,
    /// Natural size of the content, when known.
    pub intrinsic_size: Option<(f32, f32)>,
    pub content: C,
    in_bounds: Option<InBoundsPredicate>,
}

impl<C> AnchorRecord<C> {
    pub fn new(geometry: AnchorGeometry, content: C) -> Self {
        Self {
            geometry,
            intrinsic_size: None,
            content,
            in_bounds: None,
        }
    }

    pub fn with_intrinsic_size(mut self, width: f32, height: f32) -> Self {
        self.intrinsic_size = Some((width, height));
        self
    }

    /// Make the record conditional: it is only visible while `predicate` holds.
    pub fn with_in_bounds<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&AnchorGeometry) -> bool + Send + Sync + 'static,
    {
        self.in_bounds = Some(Arc::new(predicate));
        self
    }

    pub fn is_conditional(&self) -> bool {
        self.in_bounds.is_some()
    }

    /// Unconditional records are always eligible.
    pub fn is_eligible(&self) -> bool {
        self.in_bounds
            .as_ref()
            .map_or(true, |predicate| predicate(&self.geometry))
    }
}

impl<C: Clone> AnchorRecord<C> {
    fn moved_to(&self, geometry: AnchorGeometry) -> Self {
        Self {
            geometry,
            ..self.clone()
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for AnchorRecord<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnchorRecord")
            .field("geometry", &self.geometry)
            .field("intrinsic_size", &self.intrinsic_size)
            .field("content", &self.content)
            .field("conditional", &self.is_conditional())
            .finish()
    }
}

/// What a geometry update did to a record's visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorUpdate {
    /// Geometry changed, eligibility did not.
    Moved,
    /// The record became eligible and is visible again.
    Registered,
    /// The record became ineligible and was parked.
    Unregistered,
    /// No record exists for the key.
    Unknown,
}

/// Every key lives in at most one of the two maps.
struct Inner<K, C> {
    /// Records returned by lookups.
    visible: HashMap<K, Arc<AnchorRecord<C>>>,
    /// Conditional records whose predicate is currently false.
    parked: HashMap<K, Arc<AnchorRecord<C>>>,
}

/// Keyed store of on-screen anchors shared by many writers and readers.
///
/// - A key maps to at most one record; the last write wins
/// - Every mutation, including predicate re-evaluation, happens under one write lock
/// - Readers get `Arc` snapshots of whole records, never a half-applied update
pub struct AnchorRegistry<K, C> {
    inner: RwLock<Inner<K, C>>,
}

impl<K, C> AnchorRegistry<K, C>
where
    K: Eq + Hash + Clone + fmt::Debug,
    C: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                visible: HashMap::new(),
                parked: HashMap::new(),
            }),
        }
    }

    /// Insert or replace the record for `key`.
    ///
    /// Returns whether the record is visible; an ineligible conditional record
    /// is parked until a later update makes it eligible.
    pub fn register(&self, key: K, record: AnchorRecord<C>) -> bool {
        let eligible = record.is_eligible();
        let record = Arc::new(record);
        let mut inner = self.inner.write();
        if eligible {
            inner.parked.remove(&key);
            inner.visible.insert(key.clone(), record);
        } else {
            inner.visible.remove(&key);
            inner.parked.insert(key.clone(), record);
        }
        trace!(?key, eligible, "Registered anchor");
        eligible
    }

    /// Remove `key`, visible or parked. No-op if absent.
    pub fn unregister(&self, key: &K) -> Option<Arc<AnchorRecord<C>>> {
        let mut inner = self.inner.write();
        let removed = inner
            .visible
            .remove(key)
            .or_else(|| inner.parked.remove(key));
        if removed.is_some() {
            trace!(?key, "Unregistered anchor");
        }
        removed
    }

    /// Move `key` to a new position and size, then re-check its predicate.
    pub fn update_geometry(&self, key: &K, position: Point, size: Size) -> AnchorUpdate {
        let geometry = AnchorGeometry::new(position, size);
        let mut inner = self.inner.write();
        let (current, was_visible) = match inner.visible.get(key) {
            Some(record) => (Arc::clone(record), true),
            None => match inner.parked.get(key) {
                Some(record) => (Arc::clone(record), false),
                None => return AnchorUpdate::Unknown,
            },
        };
        let updated = current.moved_to(geometry);
        Self::place(&mut inner, key, updated, was_visible)
    }

    /// Re-evaluate the predicate of `key` against its current geometry.
    pub fn refresh(&self, key: &K) -> AnchorUpdate {
        let mut inner = self.inner.write();
        let (current, was_visible) = match inner.visible.get(key) {
            Some(record) => (Arc::clone(record), true),
            None => match inner.parked.get(key) {
                Some(record) => (Arc::clone(record), false),
                None => return AnchorUpdate::Unknown,
            },
        };
        if current.is_eligible() == was_visible {
            return AnchorUpdate::Moved;
        }
        let record = AnchorRecord::clone(&current);
        Self::place(&mut inner, key, record, was_visible)
    }

    fn place(
        inner: &mut Inner<K, C>,
        key: &K,
        record: AnchorRecord<C>,
        was_visible: bool,
    ) -> AnchorUpdate {
        let eligible = record.is_eligible();
        let record = Arc::new(record);
        let update = match (was_visible, eligible) {
            (true, true) => {
                inner.visible.insert(key.clone(), record);
                AnchorUpdate::Moved
            }
            (false, false) => {
                inner.parked.insert(key.clone(), record);
                AnchorUpdate::Moved
            }
            (false, true) => {
                inner.parked.remove(key);
                inner.visible.insert(key.clone(), record);
                AnchorUpdate::Registered
            }
            (true, false) => {
                inner.visible.remove(key);
                inner.parked.insert(key.clone(), record);
                AnchorUpdate::Unregistered
            }
        };
        if update != AnchorUpdate::Moved {
            trace!(?key, ?update, "Anchor eligibility changed");
        }
        update
    }

    /// The visible record for `key`, if any.
    pub fn lookup(&self, key: &K) -> Option<Arc<AnchorRecord<C>>> {
        self.inner.read().visible.get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.read().visible.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().visible.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.read().visible.keys().cloned().collect()
    }

    /// All visible records at one instant.
    pub fn snapshot(&self) -> Vec<(K, Arc<AnchorRecord<C>>)> {
        self.inner
            .read()
            .visible
            .iter()
            .map(|(key, record)| (key.clone(), Arc::clone(record)))
            .collect()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.visible.clear();
        inner.parked.clear();
    }
}

impl<K, C> Default for AnchorRegistry<K, C>
where
    K: Eq + Hash + Clone + fmt::Debug,
    C: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
