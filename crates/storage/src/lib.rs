//! The content store interface consumed by the overlay engine, plus an in-memory reference
//! implementation used in tests. Durable stores live with the embedding application; the engine
//! only relies on this trait.

pub mod error;

use std::{collections::HashMap, marker::PhantomData};

use discv5::enr::NodeId;
use error::ContentStoreError;
use portal_api::{
    types::distance::{Distance, Metric, XorMetric},
    OverlayContentKey, RawContentValue,
};

/// An enum which tells us if we should store or not store content, and if not why for better
/// errors.
#[derive(Debug, PartialEq)]
pub enum ShouldWeStoreContent {
    Store,
    NotWithinRadius,
    AlreadyStored,
}

/// A data store for Portal Network content.
pub trait ContentStore {
    type Key;

    /// Looks up a piece of content by `key`.
    fn get(&self, key: &Self::Key) -> Result<Option<RawContentValue>, ContentStoreError>;

    /// Puts a piece of content into the store.
    ///
    /// Returns a list of keys that were evicted from the store, which should be gossiped back
    /// into the network.
    #[allow(clippy::type_complexity)]
    fn put<V: AsRef<[u8]>>(
        &mut self,
        key: Self::Key,
        value: V,
    ) -> Result<Vec<(Self::Key, RawContentValue)>, ContentStoreError>;

    /// Returns whether the content denoted by `key` is within the radius of the data store and
    /// not already stored within the data store.
    fn should_we_store(&self, key: &Self::Key) -> Result<ShouldWeStoreContent, ContentStoreError>;

    /// Returns the radius of the data store.
    fn radius(&self) -> Distance;
}

/// An in-memory `ContentStore`.
pub struct MemoryContentStore<TKey, TMetric: Metric = XorMetric> {
    /// The content store, keyed by content id.
    store: HashMap<[u8; 32], RawContentValue>,
    /// The `NodeId` of the local node.
    node_id: NodeId,
    /// The radius of the store.
    radius: Distance,
    _key: PhantomData<TKey>,
    _metric: PhantomData<TMetric>,
}

impl<TKey: OverlayContentKey, TMetric: Metric> MemoryContentStore<TKey, TMetric> {
    /// Constructs a new `MemoryContentStore`.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            store: HashMap::new(),
            node_id,
            radius: Distance::MAX,
            _key: PhantomData,
            _metric: PhantomData,
        }
    }

    /// Sets the radius of the store to `radius`.
    pub fn set_radius(&mut self, radius: Distance) {
        self.radius = radius;
    }

    /// Returns the distance to `key` from the local `NodeId` according to the distance function.
    fn distance_to_key(&self, key: &TKey) -> Distance {
        TMetric::distance(&self.node_id.raw(), &key.content_id())
    }

    /// Returns `true` if the content store contains data for `key`.
    fn contains_key(&self, key: &TKey) -> bool {
        self.store.contains_key(&key.content_id())
    }
}

impl<TKey: OverlayContentKey, TMetric: Metric> ContentStore for MemoryContentStore<TKey, TMetric> {
    type Key = TKey;

    fn get(&self, key: &Self::Key) -> Result<Option<RawContentValue>, ContentStoreError> {
        Ok(self.store.get(&key.content_id()).cloned())
    }

    fn put<V: AsRef<[u8]>>(
        &mut self,
        key: Self::Key,
        value: V,
    ) -> Result<Vec<(Self::Key, RawContentValue)>, ContentStoreError> {
        self.store.insert(key.content_id(), value.as_ref().to_vec());
        Ok(vec![])
    }

    fn should_we_store(&self, key: &Self::Key) -> Result<ShouldWeStoreContent, ContentStoreError> {
        if key.affected_by_radius() && self.distance_to_key(key) > self.radius {
            return Ok(ShouldWeStoreContent::NotWithinRadius);
        }
        if self.contains_key(key) {
            return Ok(ShouldWeStoreContent::AlreadyStored);
        }
        Ok(ShouldWeStoreContent::Store)
    }

    fn radius(&self) -> Distance {
        self.radius
    }
}
