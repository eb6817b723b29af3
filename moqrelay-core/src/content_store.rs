//! Content store contract and an in-memory implementation
//!
//! The subscription engine only reads through [`ContentStore`]. Implementations
//! must tolerate concurrent readers from every worker thread.

use crate::error::MoqtError;
use crate::moqt::{
    GroupId, GroupObject, ObjectId, ObjectIdentifier, TrackAlias, TrackIdentifier, TrackNamespace,
};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Result of an object lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectLookup {
    /// Object payload
    Available(Bytes),
    /// Not published yet, may appear later
    NotFound,
    /// Will never exist
    DoesNotExist,
}

/// Read access to published tracks
pub trait ContentStore: Send + Sync {
    /// Look up one object
    fn get_object(&self, id: &ObjectIdentifier) -> ObjectLookup;

    /// Move `id` to the next object of its track, `false` if the track is exhausted
    fn advance(&self, id: &mut ObjectIdentifier) -> bool;

    /// First group of a track
    fn first_group(&self, track: TrackIdentifier) -> Option<GroupId>;

    /// First object of a group
    fn first_object(&self, track: TrackIdentifier, group: GroupId) -> Option<ObjectId>;

    /// Track registered under a subscriber alias
    fn resolve_alias(&self, alias: TrackAlias) -> Option<TrackIdentifier>;

    /// Track registered under a full name
    fn resolve_track(&self, _namespace: &TrackNamespace, _name: &str) -> Option<TrackIdentifier> {
        None
    }

    /// Largest published position of a track
    fn latest_object(&self, _track: TrackIdentifier) -> Option<GroupObject> {
        None
    }

    /// Whether a track will receive no more objects
    fn is_finished(&self, _track: TrackIdentifier) -> bool {
        false
    }
}

#[derive(Debug, Default)]
struct TrackData {
    groups: BTreeMap<GroupId, BTreeMap<ObjectId, Bytes>>,
    finished: bool,
}

impl TrackData {
    fn next_after(&self, group: GroupId, object: ObjectId) -> Option<(GroupId, ObjectId)> {
        if let Some(objects) = self.groups.get(&group) {
            if let Some((&next, _)) = objects.range(object + 1..).next() {
                return Some((group, next));
            }
        }
        self.groups
            .range(group + 1..)
            .find_map(|(&g, objects)| objects.keys().next().map(|&o| (g, o)))
    }

    fn latest(&self) -> Option<GroupObject> {
        self.groups.iter().rev().find_map(|(&group, objects)| {
            objects
                .keys()
                .next_back()
                .map(|&object| GroupObject { group, object })
        })
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    tracks: HashMap<TrackIdentifier, TrackData>,
    names: HashMap<(TrackNamespace, String), TrackIdentifier>,
    aliases: HashMap<TrackAlias, TrackIdentifier>,
    next_track: TrackIdentifier,
}

/// In-memory track storage
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    inner: RwLock<StoreInner>,
}

impl MemoryContentStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a track by full name, returning its identifier
    ///
    /// Registering the same name twice returns the existing identifier.
    pub fn register_track(&self, namespace: TrackNamespace, name: &str) -> TrackIdentifier {
        let mut inner = self.inner.write();
        let key = (namespace, name.to_string());
        if let Some(&track) = inner.names.get(&key) {
            return track;
        }

        let track = inner.next_track;
        inner.next_track += 1;
        inner.tracks.insert(track, TrackData::default());
        debug!("Registered track {} as {}/{}", track, key.0, key.1);
        inner.names.insert(key, track);
        track
    }

    /// Map a subscriber alias to a track
    pub fn register_alias(&self, alias: TrackAlias, track: TrackIdentifier) -> Result<(), MoqtError> {
        let mut inner = self.inner.write();
        if !inner.tracks.contains_key(&track) {
            return Err(Self::unknown_track(track));
        }
        inner.aliases.insert(alias, track);
        Ok(())
    }

    /// Store an object
    pub fn publish(
        &self,
        track: TrackIdentifier,
        group: GroupId,
        object: ObjectId,
        payload: impl Into<Bytes>,
    ) -> Result<(), MoqtError> {
        let mut inner = self.inner.write();
        let data = inner
            .tracks
            .get_mut(&track)
            .ok_or_else(|| Self::unknown_track(track))?;
        if data.finished {
            return Err(MoqtError::InvalidState {
                expected: "live track".to_string(),
                actual: format!("track {} is finished", track),
            });
        }
        data.groups
            .entry(group)
            .or_default()
            .insert(object, payload.into());
        Ok(())
    }

    /// Mark a track as complete
    pub fn finish_track(&self, track: TrackIdentifier) -> Result<(), MoqtError> {
        let mut inner = self.inner.write();
        let data = inner
            .tracks
            .get_mut(&track)
            .ok_or_else(|| Self::unknown_track(track))?;
        data.finished = true;
        Ok(())
    }

    fn unknown_track(track: TrackIdentifier) -> MoqtError {
        MoqtError::InvalidData {
            reason: format!("Unknown track {}", track),
        }
    }
}

impl ContentStore for MemoryContentStore {
    fn get_object(&self, id: &ObjectIdentifier) -> ObjectLookup {
        let inner = self.inner.read();
        let Some(data) = inner.tracks.get(&id.track) else {
            return ObjectLookup::DoesNotExist;
        };

        match data.groups.get(&id.group).and_then(|g| g.get(&id.object)) {
            Some(payload) => ObjectLookup::Available(payload.clone()),
            None if data.finished => ObjectLookup::DoesNotExist,
            None => ObjectLookup::NotFound,
        }
    }

    fn advance(&self, id: &mut ObjectIdentifier) -> bool {
        let inner = self.inner.read();
        let Some(data) = inner.tracks.get(&id.track) else {
            return false;
        };

        match data.next_after(id.group, id.object) {
            Some((group, object)) => {
                id.group = group;
                id.object = object;
                true
            }
            None if data.finished => false,
            None => {
                // Live tail: wait for the next object of the current group
                id.object += 1;
                true
            }
        }
    }

    fn first_group(&self, track: TrackIdentifier) -> Option<GroupId> {
        let inner = self.inner.read();
        inner.tracks.get(&track)?.groups.keys().next().copied()
    }

    fn first_object(&self, track: TrackIdentifier, group: GroupId) -> Option<ObjectId> {
        let inner = self.inner.read();
        inner
            .tracks
            .get(&track)?
            .groups
            .get(&group)?
            .keys()
            .next()
            .copied()
    }

    fn resolve_alias(&self, alias: TrackAlias) -> Option<TrackIdentifier> {
        self.inner.read().aliases.get(&alias).copied()
    }

    fn resolve_track(&self, namespace: &TrackNamespace, name: &str) -> Option<TrackIdentifier> {
        self.inner
            .read()
            .names
            .get(&(namespace.clone(), name.to_string()))
            .copied()
    }

    fn latest_object(&self, track: TrackIdentifier) -> Option<GroupObject> {
        self.inner.read().tracks.get(&track)?.latest()
    }

    fn is_finished(&self, track: TrackIdentifier) -> bool {
        self.inner
            .read()
            .tracks
            .get(&track)
            .is_some_and(|data| data.finished)
    }
}
