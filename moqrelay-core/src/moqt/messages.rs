//! MoQT control and data messages
//!
//! Every message implements [`WireMessage`]; [`Message`] is the tagged union used
//! by the decoder and by [`MessageHandler`] dispatch.

use super::wire_format::{Endianness, WireFormat, WireMessage};
use super::{GroupId, ObjectId, SubscribeId, TrackAlias, TrackNamespace, Version};
use crate::error::MoqtError;
use bytes::{Buf, Bytes, BytesMut};

/// Message type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum MessageType {
    /// OBJECT_STREAM
    ObjectStream = 0x00,
    /// SUBSCRIBE
    Subscribe = 0x03,
    /// SUBSCRIBE_OK
    SubscribeOk = 0x04,
    /// SUBSCRIBE_ERROR
    SubscribeError = 0x05,
    /// UNSUBSCRIBE
    Unsubscribe = 0x0A,
    /// TRACK_STATUS_REQUEST
    TrackStatusRequest = 0x0D,
    /// TRACK_STATUS
    TrackStatus = 0x0E,
    /// CLIENT_SETUP
    ClientSetup = 0x40,
    /// SERVER_SETUP
    ServerSetup = 0x41,
}

impl TryFrom<u64> for MessageType {
    type Error = MoqtError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => MessageType::ObjectStream,
            0x03 => MessageType::Subscribe,
            0x04 => MessageType::SubscribeOk,
            0x05 => MessageType::SubscribeError,
            0x0A => MessageType::Unsubscribe,
            0x0D => MessageType::TrackStatusRequest,
            0x0E => MessageType::TrackStatus,
            0x40 => MessageType::ClientSetup,
            0x41 => MessageType::ServerSetup,
            message_type => return Err(MoqtError::UnknownMessageType { message_type }),
        })
    }
}

/// Key-value parameter carried by setup and subscribe messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    /// Parameter key
    pub parameter_type: u64,
    /// Raw parameter value
    pub value: Bytes,
}

impl Parameter {
    /// ROLE setup parameter key
    pub const ROLE: u64 = 0x00;
    /// PATH setup parameter key
    pub const PATH: u64 = 0x01;

    /// Create a parameter from raw bytes
    pub fn new(parameter_type: u64, value: impl Into<Bytes>) -> Self {
        Self {
            parameter_type,
            value: value.into(),
        }
    }

    /// ROLE parameter, value is the varint-encoded role
    pub fn role(role: Role) -> Self {
        let mut value = BytesMut::with_capacity(1);
        WireFormat::serialize_varint(&mut value, (role as u32).into());
        Self::new(Self::ROLE, value.freeze())
    }

    /// PATH parameter
    pub fn path(path: &str) -> Self {
        Self::new(Self::PATH, Bytes::copy_from_slice(path.as_bytes()))
    }

    /// Interpret this parameter as a role
    pub fn as_role(&self) -> Option<Role> {
        if self.parameter_type != Self::ROLE {
            return None;
        }
        let mut value = self.value.clone();
        let role = WireFormat::get_varint(&mut value).ok()?;
        Role::try_from(role).ok()
    }

    /// Interpret this parameter as a path
    pub fn as_path(&self) -> Option<&str> {
        if self.parameter_type != Self::PATH {
            return None;
        }
        std::str::from_utf8(&self.value).ok()
    }
}

/// Endpoint role negotiated during setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Only publishes
    Publisher = 0x01,
    /// Only subscribes
    Subscriber = 0x02,
    /// Both
    PubSub = 0x03,
}

impl TryFrom<u64> for Role {
    type Error = MoqtError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Role::Publisher),
            0x02 => Ok(Role::Subscriber),
            0x03 => Ok(Role::PubSub),
            other => Err(MoqtError::InvalidData {
                reason: format!("Unknown role {other}"),
            }),
        }
    }
}

/// `(group, object)` position used by filters and SUBSCRIBE_OK
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupObject {
    /// Group id
    pub group: GroupId,
    /// Object id
    pub object: ObjectId,
}

impl GroupObject {
    /// Create a position
    pub fn new(group: GroupId, object: ObjectId) -> Self {
        Self { group, object }
    }
}

/// Which objects a subscription delivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionFilter {
    /// From the start of the current group
    LatestGroup,
    /// From the current object
    LatestObject,
    /// From `start` onward, unbounded
    AbsoluteStart {
        /// First object delivered
        start: GroupObject,
    },
    /// From `start` to `end`, both inclusive
    AbsoluteRange {
        /// First object delivered
        start: GroupObject,
        /// Last object delivered
        end: GroupObject,
    },
}

impl SubscriptionFilter {
    /// Wire value of the filter type
    pub fn filter_type(&self) -> u64 {
        match self {
            SubscriptionFilter::LatestGroup => 0x01,
            SubscriptionFilter::LatestObject => 0x02,
            SubscriptionFilter::AbsoluteStart { .. } => 0x03,
            SubscriptionFilter::AbsoluteRange { .. } => 0x04,
        }
    }
}

/// SUBSCRIBE_ERROR codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeErrorCode {
    /// Internal failure on the relay
    InternalError = 0x00,
    /// AbsoluteRange with start after end
    InvalidRange = 0x01,
    /// Track alias already in use
    RetryTrackAlias = 0x02,
    /// Track or requested object does not exist
    TrackDoesNotExist = 0x03,
    /// Object did not arrive before the live-tail deadline
    Timeout = 0x04,
}

impl SubscribeErrorCode {
    /// Wire value
    pub fn code(self) -> u64 {
        self as u64
    }
}

/// TRACK_STATUS status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatusCode {
    /// Track is live, last ids are the latest published object
    InProgress = 0x00,
    /// Track is unknown
    DoesNotExist = 0x01,
    /// Track exists but nothing is published yet
    NotYetBegun = 0x02,
    /// Track is finished, last ids are the final object
    Finished = 0x03,
}

impl TrackStatusCode {
    /// Wire value
    pub fn code(self) -> u64 {
        self as u64
    }
}

/// Parameter list helpers
impl WireFormat {
    /// Encoded size of a parameter list including its count
    pub fn params_len(parameters: &[Parameter]) -> Result<usize, MoqtError> {
        parameters
            .iter()
            .try_fold(Self::varint_len(parameters.len() as u64)?, |acc, p| {
                Ok(acc + Self::varint_len(p.parameter_type)? + Self::bytes_len(&p.value)?)
            })
    }

    /// Write a parameter list including its count
    pub fn put_params(buf: &mut BytesMut, parameters: &[Parameter]) -> Result<usize, MoqtError> {
        let mut written = Self::put_varint(buf, parameters.len() as u64)?;
        for parameter in parameters {
            written += Self::put_varint(buf, parameter.parameter_type)?;
            written += Self::put_bytes(buf, &parameter.value)?;
        }
        Ok(written)
    }

    /// Read a parameter list including its count
    pub fn get_params(buf: &mut Bytes) -> Result<Vec<Parameter>, MoqtError> {
        let count = Self::bounded_count(buf)?;
        let mut parameters = Vec::with_capacity(count);
        for _ in 0..count {
            let parameter_type = Self::get_varint(buf)?;
            let value = Self::get_bytes(buf)?;
            parameters.push(Parameter {
                parameter_type,
                value,
            });
        }
        Ok(parameters)
    }

    // Element counts are bounded by the bytes left since every element takes at least one
    fn bounded_count(buf: &mut Bytes) -> Result<usize, MoqtError> {
        let count = Self::get_varint(buf)?;
        if count > buf.remaining() as u64 {
            return Err(MoqtError::Truncated {
                needed: usize::try_from(count).unwrap_or(usize::MAX),
                available: buf.remaining(),
            });
        }
        Ok(count as usize)
    }

    fn get_group_object(buf: &mut Bytes) -> Result<GroupObject, MoqtError> {
        Ok(GroupObject {
            group: Self::get_varint(buf)?,
            object: Self::get_varint(buf)?,
        })
    }

    fn group_object_len(position: &GroupObject) -> Result<usize, MoqtError> {
        Ok(Self::varint_len(position.group)? + Self::varint_len(position.object)?)
    }

    fn put_group_object(buf: &mut BytesMut, position: &GroupObject) -> Result<(), MoqtError> {
        Self::put_varint(buf, position.group)?;
        Self::put_varint(buf, position.object)?;
        Ok(())
    }
}

/// CLIENT_SETUP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSetupMessage {
    /// Versions the client supports, in preference order
    pub supported_versions: Vec<Version>,
    /// Setup parameters
    pub parameters: Vec<Parameter>,
}

impl WireMessage for ClientSetupMessage {
    const MESSAGE_TYPE: u64 = MessageType::ClientSetup as u64;

    fn body_len(&self) -> Result<usize, MoqtError> {
        let mut len = WireFormat::varint_len(self.supported_versions.len() as u64)?;
        for version in &self.supported_versions {
            len += WireFormat::varint_len(*version)?;
        }
        Ok(len + WireFormat::params_len(&self.parameters)?)
    }

    fn write_body(&self, buf: &mut BytesMut) -> Result<(), MoqtError> {
        WireFormat::put_varint(buf, self.supported_versions.len() as u64)?;
        for version in &self.supported_versions {
            WireFormat::put_varint(buf, *version)?;
        }
        WireFormat::put_params(buf, &self.parameters)?;
        Ok(())
    }

    fn read_body(body: &mut Bytes) -> Result<Self, MoqtError> {
        let count = WireFormat::bounded_count(body)?;
        let mut supported_versions = Vec::with_capacity(count);
        for _ in 0..count {
            supported_versions.push(WireFormat::get_varint(body)?);
        }
        Ok(Self {
            supported_versions,
            parameters: WireFormat::get_params(body)?,
        })
    }
}

impl ClientSetupMessage {
    /// Role parameter, if present
    pub fn role(&self) -> Option<Role> {
        self.parameters.iter().find_map(Parameter::as_role)
    }

    /// Path parameter, if present
    pub fn path(&self) -> Option<&str> {
        self.parameters.iter().find_map(Parameter::as_path)
    }
}

/// SERVER_SETUP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSetupMessage {
    /// Version selected from the client's list
    pub selected_version: Version,
    /// Setup parameters
    pub parameters: Vec<Parameter>,
}

impl WireMessage for ServerSetupMessage {
    const MESSAGE_TYPE: u64 = MessageType::ServerSetup as u64;

    fn body_len(&self) -> Result<usize, MoqtError> {
        Ok(WireFormat::varint_len(self.selected_version)?
            + WireFormat::params_len(&self.parameters)?)
    }

    fn write_body(&self, buf: &mut BytesMut) -> Result<(), MoqtError> {
        WireFormat::put_varint(buf, self.selected_version)?;
        WireFormat::put_params(buf, &self.parameters)?;
        Ok(())
    }

    fn read_body(body: &mut Bytes) -> Result<Self, MoqtError> {
        Ok(Self {
            selected_version: WireFormat::get_varint(body)?,
            parameters: WireFormat::get_params(body)?,
        })
    }
}

impl ServerSetupMessage {
    /// Role parameter, if present
    pub fn role(&self) -> Option<Role> {
        self.parameters.iter().find_map(Parameter::as_role)
    }
}

/// SUBSCRIBE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeMessage {
    /// Subscriber-chosen subscription id
    pub subscribe_id: SubscribeId,
    /// Subscriber-chosen track alias
    pub track_alias: TrackAlias,
    /// Track namespace
    pub track_namespace: TrackNamespace,
    /// Track name
    pub track_name: String,
    /// Object selection
    pub filter: SubscriptionFilter,
    /// Subscribe parameters
    pub parameters: Vec<Parameter>,
}

impl WireMessage for SubscribeMessage {
    const MESSAGE_TYPE: u64 = MessageType::Subscribe as u64;

    fn body_len(&self) -> Result<usize, MoqtError> {
        let mut len = WireFormat::varint_len(self.subscribe_id)?
            + WireFormat::varint_len(self.track_alias)?
            + WireFormat::namespace_len(&self.track_namespace)?
            + WireFormat::bytes_len(self.track_name.as_bytes())?
            + WireFormat::varint_len(self.filter.filter_type())?;
        match &self.filter {
            SubscriptionFilter::LatestGroup | SubscriptionFilter::LatestObject => {}
            SubscriptionFilter::AbsoluteStart { start } => {
                len += WireFormat::group_object_len(start)?;
            }
            SubscriptionFilter::AbsoluteRange { start, end } => {
                len += WireFormat::group_object_len(start)? + WireFormat::group_object_len(end)?;
            }
        }
        Ok(len + WireFormat::params_len(&self.parameters)?)
    }

    fn write_body(&self, buf: &mut BytesMut) -> Result<(), MoqtError> {
        WireFormat::put_varint(buf, self.subscribe_id)?;
        WireFormat::put_varint(buf, self.track_alias)?;
        WireFormat::put_namespace(buf, &self.track_namespace)?;
        WireFormat::put_bytes(buf, self.track_name.as_bytes())?;
        WireFormat::put_varint(buf, self.filter.filter_type())?;
        match &self.filter {
            SubscriptionFilter::LatestGroup | SubscriptionFilter::LatestObject => {}
            SubscriptionFilter::AbsoluteStart { start } => {
                WireFormat::put_group_object(buf, start)?;
            }
            SubscriptionFilter::AbsoluteRange { start, end } => {
                WireFormat::put_group_object(buf, start)?;
                WireFormat::put_group_object(buf, end)?;
            }
        }
        WireFormat::put_params(buf, &self.parameters)?;
        Ok(())
    }

    fn read_body(body: &mut Bytes) -> Result<Self, MoqtError> {
        let subscribe_id = WireFormat::get_varint(body)?;
        let track_alias = WireFormat::get_varint(body)?;
        let track_namespace = WireFormat::get_namespace(body)?;
        let track_name = WireFormat::get_string(body)?;
        let filter = match WireFormat::get_varint(body)? {
            0x01 => SubscriptionFilter::LatestGroup,
            0x02 => SubscriptionFilter::LatestObject,
            0x03 => SubscriptionFilter::AbsoluteStart {
                start: WireFormat::get_group_object(body)?,
            },
            0x04 => SubscriptionFilter::AbsoluteRange {
                start: WireFormat::get_group_object(body)?,
                end: WireFormat::get_group_object(body)?,
            },
            filter_type => return Err(MoqtError::UnknownFilterType { filter_type }),
        };
        Ok(Self {
            subscribe_id,
            track_alias,
            track_namespace,
            track_name,
            filter,
            parameters: WireFormat::get_params(body)?,
        })
    }
}

/// SUBSCRIBE_OK
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOkMessage {
    /// Subscription being acknowledged
    pub subscribe_id: SubscribeId,
    /// Subscription lifetime in milliseconds, zero for no expiry
    pub expires_ms: u64,
    /// Largest published position, if the track has content
    pub largest: Option<GroupObject>,
}

impl WireMessage for SubscribeOkMessage {
    const MESSAGE_TYPE: u64 = MessageType::SubscribeOk as u64;

    fn body_len(&self) -> Result<usize, MoqtError> {
        let mut len = WireFormat::varint_len(self.subscribe_id)?
            + WireFormat::varint_len(self.expires_ms)?
            + 1;
        if let Some(largest) = &self.largest {
            len += WireFormat::group_object_len(largest)?;
        }
        Ok(len)
    }

    fn write_body(&self, buf: &mut BytesMut) -> Result<(), MoqtError> {
        WireFormat::put_varint(buf, self.subscribe_id)?;
        WireFormat::put_varint(buf, self.expires_ms)?;
        WireFormat::serialize_fixed(buf, self.largest.is_some() as u8, Endianness::NETWORK);
        if let Some(largest) = &self.largest {
            WireFormat::put_group_object(buf, largest)?;
        }
        Ok(())
    }

    fn read_body(body: &mut Bytes) -> Result<Self, MoqtError> {
        let subscribe_id = WireFormat::get_varint(body)?;
        let expires_ms = WireFormat::get_varint(body)?;
        let largest = match WireFormat::deserialize_fixed::<u8, _>(body, Endianness::NETWORK)? {
            0 => None,
            1 => Some(WireFormat::get_group_object(body)?),
            other => {
                return Err(MoqtError::InvalidData {
                    reason: format!("content_exists must be 0 or 1, got {other}"),
                })
            }
        };
        Ok(Self {
            subscribe_id,
            expires_ms,
            largest,
        })
    }
}

/// SUBSCRIBE_ERROR
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeErrorMessage {
    /// Failed subscription
    pub subscribe_id: SubscribeId,
    /// See [`SubscribeErrorCode`]
    pub error_code: u64,
    /// Human readable reason
    pub reason: String,
    /// Track alias from the SUBSCRIBE
    pub track_alias: TrackAlias,
}

impl WireMessage for SubscribeErrorMessage {
    const MESSAGE_TYPE: u64 = MessageType::SubscribeError as u64;

    fn body_len(&self) -> Result<usize, MoqtError> {
        Ok(WireFormat::varint_len(self.subscribe_id)?
            + WireFormat::varint_len(self.error_code)?
            + WireFormat::bytes_len(self.reason.as_bytes())?
            + WireFormat::varint_len(self.track_alias)?)
    }

    fn write_body(&self, buf: &mut BytesMut) -> Result<(), MoqtError> {
        WireFormat::put_varint(buf, self.subscribe_id)?;
        WireFormat::put_varint(buf, self.error_code)?;
        WireFormat::put_bytes(buf, self.reason.as_bytes())?;
        WireFormat::put_varint(buf, self.track_alias)?;
        Ok(())
    }

    fn read_body(body: &mut Bytes) -> Result<Self, MoqtError> {
        Ok(Self {
            subscribe_id: WireFormat::get_varint(body)?,
            error_code: WireFormat::get_varint(body)?,
            reason: WireFormat::get_string(body)?,
            track_alias: WireFormat::get_varint(body)?,
        })
    }
}

/// UNSUBSCRIBE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeMessage {
    /// Subscription to cancel
    pub subscribe_id: SubscribeId,
}

impl WireMessage for UnsubscribeMessage {
    const MESSAGE_TYPE: u64 = MessageType::Unsubscribe as u64;

    fn body_len(&self) -> Result<usize, MoqtError> {
        WireFormat::varint_len(self.subscribe_id)
    }

    fn write_body(&self, buf: &mut BytesMut) -> Result<(), MoqtError> {
        WireFormat::put_varint(buf, self.subscribe_id)?;
        Ok(())
    }

    fn read_body(body: &mut Bytes) -> Result<Self, MoqtError> {
        Ok(Self {
            subscribe_id: WireFormat::get_varint(body)?,
        })
    }
}

/// TRACK_STATUS_REQUEST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackStatusRequestMessage {
    /// Track namespace
    pub track_namespace: TrackNamespace,
    /// Track name
    pub track_name: String,
}

impl WireMessage for TrackStatusRequestMessage {
    const MESSAGE_TYPE: u64 = MessageType::TrackStatusRequest as u64;

    fn body_len(&self) -> Result<usize, MoqtError> {
        Ok(WireFormat::namespace_len(&self.track_namespace)?
            + WireFormat::bytes_len(self.track_name.as_bytes())?)
    }

    fn write_body(&self, buf: &mut BytesMut) -> Result<(), MoqtError> {
        WireFormat::put_namespace(buf, &self.track_namespace)?;
        WireFormat::put_bytes(buf, self.track_name.as_bytes())?;
        Ok(())
    }

    fn read_body(body: &mut Bytes) -> Result<Self, MoqtError> {
        Ok(Self {
            track_namespace: WireFormat::get_namespace(body)?,
            track_name: WireFormat::get_string(body)?,
        })
    }
}

/// TRACK_STATUS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackStatusMessage {
    /// Track namespace
    pub track_namespace: TrackNamespace,
    /// Track name
    pub track_name: String,
    /// See [`TrackStatusCode`]
    pub status_code: u64,
    /// Last group id
    pub last_group_id: GroupId,
    /// Last object id
    pub last_object_id: ObjectId,
}

impl WireMessage for TrackStatusMessage {
    const MESSAGE_TYPE: u64 = MessageType::TrackStatus as u64;

    fn body_len(&self) -> Result<usize, MoqtError> {
        Ok(WireFormat::namespace_len(&self.track_namespace)?
            + WireFormat::bytes_len(self.track_name.as_bytes())?
            + WireFormat::varint_len(self.status_code)?
            + WireFormat::varint_len(self.last_group_id)?
            + WireFormat::varint_len(self.last_object_id)?)
    }

    fn write_body(&self, buf: &mut BytesMut) -> Result<(), MoqtError> {
        WireFormat::put_namespace(buf, &self.track_namespace)?;
        WireFormat::put_bytes(buf, self.track_name.as_bytes())?;
        WireFormat::put_varint(buf, self.status_code)?;
        WireFormat::put_varint(buf, self.last_group_id)?;
        WireFormat::put_varint(buf, self.last_object_id)?;
        Ok(())
    }

    fn read_body(body: &mut Bytes) -> Result<Self, MoqtError> {
        Ok(Self {
            track_namespace: WireFormat::get_namespace(body)?,
            track_name: WireFormat::get_string(body)?,
            status_code: WireFormat::get_varint(body)?,
            last_group_id: WireFormat::get_varint(body)?,
            last_object_id: WireFormat::get_varint(body)?,
        })
    }
}

/// OBJECT_STREAM, one object per data stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStreamMessage {
    /// Subscription the object is delivered for
    pub subscribe_id: SubscribeId,
    /// Track alias from the SUBSCRIBE
    pub track_alias: TrackAlias,
    /// Group id
    pub group_id: GroupId,
    /// Object id
    pub object_id: ObjectId,
    /// Publisher priority, lower is more urgent
    pub publisher_priority: u8,
    /// Object payload, the remainder of the body
    pub payload: Bytes,
}

impl WireMessage for ObjectStreamMessage {
    const MESSAGE_TYPE: u64 = MessageType::ObjectStream as u64;

    fn body_len(&self) -> Result<usize, MoqtError> {
        Ok(WireFormat::varint_len(self.subscribe_id)?
            + WireFormat::varint_len(self.track_alias)?
            + WireFormat::varint_len(self.group_id)?
            + WireFormat::varint_len(self.object_id)?
            + 1
            + self.payload.len())
    }

    fn write_body(&self, buf: &mut BytesMut) -> Result<(), MoqtError> {
        WireFormat::put_varint(buf, self.subscribe_id)?;
        WireFormat::put_varint(buf, self.track_alias)?;
        WireFormat::put_varint(buf, self.group_id)?;
        WireFormat::put_varint(buf, self.object_id)?;
        WireFormat::serialize_fixed(buf, self.publisher_priority, Endianness::NETWORK);
        buf.extend_from_slice(&self.payload);
        Ok(())
    }

    fn read_body(body: &mut Bytes) -> Result<Self, MoqtError> {
        let subscribe_id = WireFormat::get_varint(body)?;
        let track_alias = WireFormat::get_varint(body)?;
        let group_id = WireFormat::get_varint(body)?;
        let object_id = WireFormat::get_varint(body)?;
        let publisher_priority = WireFormat::deserialize_fixed::<u8, _>(body, Endianness::NETWORK)?;
        let payload = body.split_to(body.len());
        Ok(Self {
            subscribe_id,
            track_alias,
            group_id,
            object_id,
            publisher_priority,
            payload,
        })
    }
}

/// Any decoded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// OBJECT_STREAM
    ObjectStream(ObjectStreamMessage),
    /// SUBSCRIBE
    Subscribe(SubscribeMessage),
    /// SUBSCRIBE_OK
    SubscribeOk(SubscribeOkMessage),
    /// SUBSCRIBE_ERROR
    SubscribeError(SubscribeErrorMessage),
    /// UNSUBSCRIBE
    Unsubscribe(UnsubscribeMessage),
    /// TRACK_STATUS_REQUEST
    TrackStatusRequest(TrackStatusRequestMessage),
    /// TRACK_STATUS
    TrackStatus(TrackStatusMessage),
    /// CLIENT_SETUP
    ClientSetup(ClientSetupMessage),
    /// SERVER_SETUP
    ServerSetup(ServerSetupMessage),
}

impl Message {
    /// Type tag of the contained message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::ObjectStream(_) => MessageType::ObjectStream,
            Message::Subscribe(_) => MessageType::Subscribe,
            Message::SubscribeOk(_) => MessageType::SubscribeOk,
            Message::SubscribeError(_) => MessageType::SubscribeError,
            Message::Unsubscribe(_) => MessageType::Unsubscribe,
            Message::TrackStatusRequest(_) => MessageType::TrackStatusRequest,
            Message::TrackStatus(_) => MessageType::TrackStatus,
            Message::ClientSetup(_) => MessageType::ClientSetup,
            Message::ServerSetup(_) => MessageType::ServerSetup,
        }
    }

    /// Serialize with framing header, returns bytes written
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<usize, MoqtError> {
        match self {
            Message::ObjectStream(m) => WireFormat::serialize_message(buf, m),
            Message::Subscribe(m) => WireFormat::serialize_message(buf, m),
            Message::SubscribeOk(m) => WireFormat::serialize_message(buf, m),
            Message::SubscribeError(m) => WireFormat::serialize_message(buf, m),
            Message::Unsubscribe(m) => WireFormat::serialize_message(buf, m),
            Message::TrackStatusRequest(m) => WireFormat::serialize_message(buf, m),
            Message::TrackStatus(m) => WireFormat::serialize_message(buf, m),
            Message::ClientSetup(m) => WireFormat::serialize_message(buf, m),
            Message::ServerSetup(m) => WireFormat::serialize_message(buf, m),
        }
    }

    /// Decode a complete body for the given type tag
    pub fn decode(message_type: u64, body: Bytes) -> Result<Self, MoqtError> {
        Ok(match MessageType::try_from(message_type)? {
            MessageType::ObjectStream => Message::ObjectStream(WireFormat::read_exact(body)?),
            MessageType::Subscribe => Message::Subscribe(WireFormat::read_exact(body)?),
            MessageType::SubscribeOk => Message::SubscribeOk(WireFormat::read_exact(body)?),
            MessageType::SubscribeError => Message::SubscribeError(WireFormat::read_exact(body)?),
            MessageType::Unsubscribe => Message::Unsubscribe(WireFormat::read_exact(body)?),
            MessageType::TrackStatusRequest => {
                Message::TrackStatusRequest(WireFormat::read_exact(body)?)
            }
            MessageType::TrackStatus => Message::TrackStatus(WireFormat::read_exact(body)?),
            MessageType::ClientSetup => Message::ClientSetup(WireFormat::read_exact(body)?),
            MessageType::ServerSetup => Message::ServerSetup(WireFormat::read_exact(body)?),
        })
    }

    /// Hand the message to the matching handler method
    pub fn dispatch<H: MessageHandler + ?Sized>(self, handler: &mut H) -> Result<(), MoqtError> {
        match self {
            Message::ObjectStream(m) => handler.on_object_stream(m),
            Message::Subscribe(m) => handler.on_subscribe(m),
            Message::SubscribeOk(m) => handler.on_subscribe_ok(m),
            Message::SubscribeError(m) => handler.on_subscribe_error(m),
            Message::Unsubscribe(m) => handler.on_unsubscribe(m),
            Message::TrackStatusRequest(m) => handler.on_track_status_request(m),
            Message::TrackStatus(m) => handler.on_track_status(m),
            Message::ClientSetup(m) => handler.on_client_setup(m),
            Message::ServerSetup(m) => handler.on_server_setup(m),
        }
    }
}

impl WireFormat {
    /// Deserialize one framed message from the front of `buf`
    pub fn deserialize_message(buf: &mut Bytes) -> Result<Message, MoqtError> {
        let (message_type, body_len) = Self::deserialize_header(buf)?;
        if buf.remaining() < body_len {
            return Err(MoqtError::Truncated {
                needed: body_len,
                available: buf.remaining(),
            });
        }
        Message::decode(message_type, buf.split_to(body_len))
    }
}

/// Receiver of decoded messages, one method per message type
///
/// Every method defaults to [`MessageHandler::on_unexpected`], so a handler only
/// implements the messages valid for the stream it is bound to.
pub trait MessageHandler {
    /// OBJECT_STREAM received
    fn on_object_stream(&mut self, _message: ObjectStreamMessage) -> Result<(), MoqtError> {
        self.on_unexpected(MessageType::ObjectStream)
    }

    /// SUBSCRIBE received
    fn on_subscribe(&mut self, _message: SubscribeMessage) -> Result<(), MoqtError> {
        self.on_unexpected(MessageType::Subscribe)
    }

    /// SUBSCRIBE_OK received
    fn on_subscribe_ok(&mut self, _message: SubscribeOkMessage) -> Result<(), MoqtError> {
        self.on_unexpected(MessageType::SubscribeOk)
    }

    /// SUBSCRIBE_ERROR received
    fn on_subscribe_error(&mut self, _message: SubscribeErrorMessage) -> Result<(), MoqtError> {
        self.on_unexpected(MessageType::SubscribeError)
    }

    /// UNSUBSCRIBE received
    fn on_unsubscribe(&mut self, _message: UnsubscribeMessage) -> Result<(), MoqtError> {
        self.on_unexpected(MessageType::Unsubscribe)
    }

    /// TRACK_STATUS_REQUEST received
    fn on_track_status_request(
        &mut self,
        _message: TrackStatusRequestMessage,
    ) -> Result<(), MoqtError> {
        self.on_unexpected(MessageType::TrackStatusRequest)
    }

    /// TRACK_STATUS received
    fn on_track_status(&mut self, _message: TrackStatusMessage) -> Result<(), MoqtError> {
        self.on_unexpected(MessageType::TrackStatus)
    }

    /// CLIENT_SETUP received
    fn on_client_setup(&mut self, _message: ClientSetupMessage) -> Result<(), MoqtError> {
        self.on_unexpected(MessageType::ClientSetup)
    }

    /// SERVER_SETUP received
    fn on_server_setup(&mut self, _message: ServerSetupMessage) -> Result<(), MoqtError> {
        self.on_unexpected(MessageType::ServerSetup)
    }

    /// A message this handler does not accept
    fn on_unexpected(&mut self, message_type: MessageType) -> Result<(), MoqtError> {
        Err(MoqtError::ProtocolViolation {
            reason: format!("Unexpected {message_type:?} message"),
        })
    }
}
