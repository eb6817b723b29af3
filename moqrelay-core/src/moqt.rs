//! Media over QUIC Transport (MoQT) protocol types
//!
//! Identifiers shared by the codec, the connection layer and the subscription
//! engine. The wire messages themselves live in [`messages`].

use std::fmt;

pub mod messages;
pub mod reassembler;
pub mod wire_format;

pub use messages::{
    ClientSetupMessage, GroupObject, Message, MessageHandler, MessageType, ObjectStreamMessage,
    Parameter, Role, ServerSetupMessage, SubscribeErrorCode, SubscribeErrorMessage,
    SubscribeMessage, SubscribeOkMessage, SubscriptionFilter, TrackStatusCode,
    TrackStatusMessage, TrackStatusRequestMessage, UnsubscribeMessage,
};
pub use reassembler::{Reassembler, ReassemblerConfig};
pub use wire_format::{Endianness, FixedWidth, QuicVarInt, WireFormat, WireMessage, MAX_VARINT};

/// Internal track identifier assigned by the content store
pub type TrackIdentifier = u64;

/// Group identifier within a track
pub type GroupId = u64;

/// Object identifier within a group
pub type ObjectId = u64;

/// Track alias chosen by the subscriber in SUBSCRIBE
pub type TrackAlias = u64;

/// Subscription identifier chosen by the subscriber
pub type SubscribeId = u64;

/// MoQT version number
pub type Version = u64;

/// Fully qualified object address
///
/// Ordering is lexicographic on `(track, group, object)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectIdentifier {
    /// Track the object belongs to
    pub track: TrackIdentifier,
    /// Group within the track
    pub group: GroupId,
    /// Object within the group
    pub object: ObjectId,
}

impl ObjectIdentifier {
    /// Create a new object identifier
    pub fn new(track: TrackIdentifier, group: GroupId, object: ObjectId) -> Self {
        Self {
            track,
            group,
            object,
        }
    }

    /// The `(group, object)` part of the identifier
    pub fn group_object(&self) -> GroupObject {
        GroupObject {
            group: self.group,
            object: self.object,
        }
    }
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.track, self.group, self.object)
    }
}

/// Track namespace tuple
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TrackNamespace(pub Vec<String>);

impl TrackNamespace {
    /// Create a namespace from its elements
    pub fn new(elements: Vec<String>) -> Self {
        Self(elements)
    }

    /// Namespace elements
    pub fn elements(&self) -> &[String] {
        &self.0
    }
}

impl<const N: usize> From<[&str; N]> for TrackNamespace {
    fn from(elements: [&str; N]) -> Self {
        Self(elements.iter().map(|e| e.to_string()).collect())
    }
}

impl fmt::Display for TrackNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_identifier_ordering() {
        let a = ObjectIdentifier::new(1, 2, 9);
        let b = ObjectIdentifier::new(1, 3, 0);
        let c = ObjectIdentifier::new(2, 0, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.group_object(), GroupObject { group: 2, object: 9 });
    }

    #[test]
    fn test_namespace_display() {
        let ns = TrackNamespace::from(["example.com", "live"]);
        assert_eq!(ns.to_string(), "example.com/live");
        assert_eq!(ns.elements().len(), 2);
    }
}
