//! Message types for both wire directions, decoded into tagged variants.
//!
//! The client-facing protocol frames are `u16 msgtype; payload`. Internal
//! bus messages arrive behind the MD envelope; by the time they reach a
//! session the recipients have been consumed, leaving
//! `u64 sender; u16 msgtype; payload`.
//!
//! Field payloads stay opaque at this layer: a `SetField` carries the raw
//! bytes after the header, because unpacking needs class metadata the
//! session resolves first.

use bytes::Bytes;

use gate_core::{Channel, DoId, Zone};

use crate::datagram::{Datagram, DatagramIter, WireError};

// ============================================================================
// Message type space
// ============================================================================

/// Client-facing message types.
pub mod client {
    pub const HELLO: u16 = 1;
    pub const HELLO_RESP: u16 = 2;
    pub const EJECT: u16 = 4;

    pub const OBJECT_SET_FIELD: u16 = 120;
    pub const OBJECT_LEAVING: u16 = 132;
    pub const OBJECT_LEAVING_OWNER: u16 = 133;
    pub const OBJECT_LOCATION: u16 = 140;
    pub const ENTER_OBJECT_REQUIRED: u16 = 142;
    pub const ENTER_OBJECT_REQUIRED_OTHER: u16 = 143;
    pub const ENTER_OBJECT_REQUIRED_OTHER_OWNER: u16 = 173;

    pub const ADD_INTEREST: u16 = 200;
    pub const ADD_INTEREST_MULTIPLE: u16 = 201;
    pub const REMOVE_INTEREST: u16 = 203;
    pub const DONE_INTEREST_RESP: u16 = 204;
}

/// Internal bus message types.
pub mod internal {
    pub const CLIENTAGENT_SET_STATE: u16 = 1000;
    pub const CLIENTAGENT_SET_CLIENT_ID: u16 = 1001;
    pub const CLIENTAGENT_SEND_DATAGRAM: u16 = 1002;
    pub const CLIENTAGENT_EJECT: u16 = 1004;
    pub const CLIENTAGENT_DROP: u16 = 1005;
    pub const CLIENTAGENT_OPEN_CHANNEL: u16 = 1100;
    pub const CLIENTAGENT_CLOSE_CHANNEL: u16 = 1101;
    pub const CLIENTAGENT_ADD_POST_REMOVE: u16 = 1110;
    pub const CLIENTAGENT_CLEAR_POST_REMOVES: u16 = 1111;

    pub const STATESERVER_OBJECT_SET_FIELD: u16 = 2020;
    pub const STATESERVER_OBJECT_SET_LOCATION: u16 = 2040;
    pub const STATESERVER_OBJECT_DELETE_RAM: u16 = 2060;
    pub const STATESERVER_OBJECT_ENTER_LOCATION_WITH_REQUIRED: u16 = 2065;
    pub const STATESERVER_OBJECT_ENTER_LOCATION_WITH_REQUIRED_OTHER: u16 = 2066;
    pub const STATESERVER_OBJECT_ENTER_OWNER_WITH_REQUIRED_OTHER: u16 = 2071;
    pub const STATESERVER_OBJECT_CHANGING_LOCATION: u16 = 2100;
    pub const STATESERVER_OBJECT_GET_ZONES_OBJECTS: u16 = 2110;
    pub const STATESERVER_OBJECT_GET_ZONES_COUNT_RESP: u16 = 2111;
}

// ============================================================================
// Disconnect reasons
// ============================================================================

/// Why a client was ejected. Codes are part of the wire protocol and stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Generic,
    NoHello,
    BadDcHash,
    BadVersion,
    InvalidMsgtype,
    TruncatedDatagram,
    OversizedDatagram,
    AnonymousViolation,
    MissingObject,
    ForbiddenField,
    ForbiddenRelocate,
}

impl DisconnectReason {
    /// Stable numeric code sent in the CLIENT_EJECT frame.
    pub fn code(self) -> u16 {
        match self {
            Self::Generic => 1,
            Self::NoHello => 101,
            Self::BadDcHash => 102,
            Self::BadVersion => 103,
            Self::InvalidMsgtype => 104,
            Self::TruncatedDatagram => 105,
            Self::OversizedDatagram => 106,
            Self::AnonymousViolation => 110,
            Self::MissingObject => 111,
            Self::ForbiddenField => 112,
            Self::ForbiddenRelocate => 113,
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Generic => "generic",
            Self::NoHello => "no-hello",
            Self::BadDcHash => "bad-dc-hash",
            Self::BadVersion => "bad-version",
            Self::InvalidMsgtype => "invalid-msgtype",
            Self::TruncatedDatagram => "truncated-datagram",
            Self::OversizedDatagram => "oversized-datagram",
            Self::AnonymousViolation => "anonymous-violation",
            Self::MissingObject => "missing-object",
            Self::ForbiddenField => "forbidden-field",
            Self::ForbiddenRelocate => "forbidden-relocate",
        };
        write!(f, "{name}")
    }
}

// ============================================================================
// Client -> agent
// ============================================================================

/// A decoded client frame.
///
/// `AddInterest` covers both the single-zone and multiple-zone wire forms.
/// Unrecognized message types decode to `Unknown`; the session decides the
/// eject reason based on its state.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Hello {
        dc_hash: u32,
        version: String,
    },
    SetField {
        do_id: DoId,
        field_id: u16,
        /// Field payload, unpacked by the session once the class is known.
        payload: Bytes,
    },
    ObjectLocation {
        do_id: DoId,
        parent: DoId,
        zone: Zone,
    },
    AddInterest {
        context: u32,
        interest_id: u16,
        parent: DoId,
        zones: Vec<Zone>,
    },
    RemoveInterest {
        context: u32,
        interest_id: u16,
    },
    Unknown {
        msgtype: u16,
    },
}

impl ClientMessage {
    /// Decodes one client frame body (message type onward).
    pub fn decode(iter: &mut DatagramIter) -> Result<Self, WireError> {
        let msgtype = iter.read_u16()?;
        match msgtype {
            client::HELLO => Ok(Self::Hello {
                dc_hash: iter.read_u32()?,
                version: iter.read_string()?,
            }),
            client::OBJECT_SET_FIELD => Ok(Self::SetField {
                do_id: iter.read_u32()?,
                field_id: iter.read_u16()?,
                payload: iter.read_remainder(),
            }),
            client::OBJECT_LOCATION => Ok(Self::ObjectLocation {
                do_id: iter.read_u32()?,
                parent: iter.read_u32()?,
                zone: iter.read_u32()?,
            }),
            client::ADD_INTEREST => Ok(Self::AddInterest {
                context: iter.read_u32()?,
                interest_id: iter.read_u16()?,
                parent: iter.read_u32()?,
                zones: vec![iter.read_u32()?],
            }),
            client::ADD_INTEREST_MULTIPLE => {
                let context = iter.read_u32()?;
                let interest_id = iter.read_u16()?;
                let parent = iter.read_u32()?;
                let count = iter.read_u16()?;
                let mut zones = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    zones.push(iter.read_u32()?);
                }
                Ok(Self::AddInterest {
                    context,
                    interest_id,
                    parent,
                    zones,
                })
            }
            client::REMOVE_INTEREST => Ok(Self::RemoveInterest {
                context: iter.read_u32()?,
                interest_id: iter.read_u16()?,
            }),
            other => Ok(Self::Unknown { msgtype: other }),
        }
    }
}

// ============================================================================
// Bus -> session
// ============================================================================

/// A decoded internal message, sender already stripped.
#[derive(Debug, Clone)]
pub enum InternalMessage {
    Eject {
        reason: u16,
        message: String,
    },
    Drop,
    SetState {
        state: u16,
    },
    SetClientId {
        channel: Channel,
    },
    SendDatagram {
        data: Bytes,
    },
    OpenChannel {
        channel: Channel,
    },
    CloseChannel {
        channel: Channel,
    },
    AddPostRemove {
        datagram: Bytes,
    },
    ClearPostRemoves,
    SetField {
        do_id: DoId,
        /// `u16 field_id; packed value`, forwarded verbatim.
        payload: Bytes,
    },
    DeleteRam {
        do_id: DoId,
    },
    EnterOwner {
        do_id: DoId,
        parent: DoId,
        zone: Zone,
        dc_id: u16,
        payload: Bytes,
    },
    EnterLocation {
        do_id: DoId,
        parent: DoId,
        zone: Zone,
        dc_id: u16,
        payload: Bytes,
        /// Whether the snapshot includes OTHER fields.
        other: bool,
    },
    ZonesCountResp {
        context: u32,
        count: u32,
    },
    ChangingLocation {
        do_id: DoId,
        new_parent: DoId,
        new_zone: Zone,
    },
    Unknown {
        msgtype: u16,
    },
}

impl InternalMessage {
    /// Decodes one internal message (message type onward).
    pub fn decode(iter: &mut DatagramIter) -> Result<Self, WireError> {
        let msgtype = iter.read_u16()?;
        match msgtype {
            internal::CLIENTAGENT_EJECT => Ok(Self::Eject {
                reason: iter.read_u16()?,
                message: iter.read_string()?,
            }),
            internal::CLIENTAGENT_DROP => Ok(Self::Drop),
            internal::CLIENTAGENT_SET_STATE => Ok(Self::SetState {
                state: iter.read_u16()?,
            }),
            internal::CLIENTAGENT_SET_CLIENT_ID => Ok(Self::SetClientId {
                channel: iter.read_u64()?,
            }),
            internal::CLIENTAGENT_SEND_DATAGRAM => Ok(Self::SendDatagram {
                data: iter.read_blob()?,
            }),
            internal::CLIENTAGENT_OPEN_CHANNEL => Ok(Self::OpenChannel {
                channel: iter.read_u64()?,
            }),
            internal::CLIENTAGENT_CLOSE_CHANNEL => Ok(Self::CloseChannel {
                channel: iter.read_u64()?,
            }),
            internal::CLIENTAGENT_ADD_POST_REMOVE => Ok(Self::AddPostRemove {
                datagram: iter.read_blob()?,
            }),
            internal::CLIENTAGENT_CLEAR_POST_REMOVES => Ok(Self::ClearPostRemoves),
            internal::STATESERVER_OBJECT_SET_FIELD => Ok(Self::SetField {
                do_id: iter.read_u32()?,
                payload: iter.read_remainder(),
            }),
            internal::STATESERVER_OBJECT_DELETE_RAM => Ok(Self::DeleteRam {
                do_id: iter.read_u32()?,
            }),
            internal::STATESERVER_OBJECT_ENTER_OWNER_WITH_REQUIRED_OTHER => Ok(Self::EnterOwner {
                do_id: iter.read_u32()?,
                parent: iter.read_u32()?,
                zone: iter.read_u32()?,
                dc_id: iter.read_u16()?,
                payload: iter.read_remainder(),
            }),
            internal::STATESERVER_OBJECT_ENTER_LOCATION_WITH_REQUIRED
            | internal::STATESERVER_OBJECT_ENTER_LOCATION_WITH_REQUIRED_OTHER => {
                Ok(Self::EnterLocation {
                    do_id: iter.read_u32()?,
                    parent: iter.read_u32()?,
                    zone: iter.read_u32()?,
                    dc_id: iter.read_u16()?,
                    payload: iter.read_remainder(),
                    other: msgtype
                        == internal::STATESERVER_OBJECT_ENTER_LOCATION_WITH_REQUIRED_OTHER,
                })
            }
            internal::STATESERVER_OBJECT_GET_ZONES_COUNT_RESP => Ok(Self::ZonesCountResp {
                context: iter.read_u32()?,
                count: iter.read_u32()?,
            }),
            internal::STATESERVER_OBJECT_CHANGING_LOCATION => {
                let do_id = iter.read_u32()?;
                let new_parent = iter.read_u32()?;
                let new_zone = iter.read_u32()?;
                let _old_parent = iter.read_u32()?;
                let _old_zone = iter.read_u32()?;
                Ok(Self::ChangingLocation {
                    do_id,
                    new_parent,
                    new_zone,
                })
            }
            other => Ok(Self::Unknown { msgtype: other }),
        }
    }
}

// ============================================================================
// Client-bound frame builders
// ============================================================================

/// Constructors for the frames the agent sends to clients.
pub mod frames {
    use super::*;

    pub fn hello_resp() -> Datagram {
        Datagram::with_msgtype(client::HELLO_RESP)
    }

    pub fn eject(reason: DisconnectReason, message: &str) -> Result<Datagram, WireError> {
        eject_code(reason.code(), message)
    }

    /// Eject with a raw code, for reasons specified by internal roles.
    pub fn eject_code(code: u16, message: &str) -> Result<Datagram, WireError> {
        let mut dg = Datagram::with_msgtype(client::EJECT);
        dg.add_u16(code);
        dg.add_string(message)?;
        Ok(dg)
    }

    pub fn object_set_field(do_id: DoId, payload: &[u8]) -> Datagram {
        let mut dg = Datagram::with_msgtype(client::OBJECT_SET_FIELD);
        dg.add_u32(do_id);
        dg.add_data(payload);
        dg
    }

    pub fn object_leaving(do_id: DoId) -> Datagram {
        let mut dg = Datagram::with_msgtype(client::OBJECT_LEAVING);
        dg.add_u32(do_id);
        dg
    }

    pub fn object_leaving_owner(do_id: DoId) -> Datagram {
        let mut dg = Datagram::with_msgtype(client::OBJECT_LEAVING_OWNER);
        dg.add_u32(do_id);
        dg
    }

    pub fn object_location(do_id: DoId, parent: DoId, zone: Zone) -> Datagram {
        let mut dg = Datagram::with_msgtype(client::OBJECT_LOCATION);
        dg.add_u32(do_id);
        dg.add_u32(parent);
        dg.add_u32(zone);
        dg
    }

    pub fn enter_object(
        do_id: DoId,
        parent: DoId,
        zone: Zone,
        dc_id: u16,
        payload: &[u8],
        msgtype: u16,
    ) -> Datagram {
        let mut dg = Datagram::with_msgtype(msgtype);
        dg.add_u32(do_id);
        dg.add_u32(parent);
        dg.add_u32(zone);
        dg.add_u16(dc_id);
        dg.add_data(payload);
        dg
    }

    pub fn done_interest_resp(context: u32, interest_id: u16) -> Datagram {
        let mut dg = Datagram::with_msgtype(client::DONE_INTEREST_RESP);
        dg.add_u32(context);
        dg.add_u16(interest_id);
        dg
    }
}
