//! Routing header attached to multiplexed messages.
//!
//! The header carries the `(group_id, member_id)` key used to demultiplex
//! inbound traffic. Both fields may be absent while a message travels down a
//! private pipeline; the group is filled in by the group's bottom stage and
//! the member by the sending channel handle.

use std::fmt;

use bytes::{Buf, BufMut};

use crate::error::Result;
use crate::wire;

/// Header id reserved for the routing header.
pub const ROUTING_HEADER_ID: u16 = 57;

/// Two-part routing key: group (fork stack) and member (fork channel).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RoutingHeader {
    group_id: Option<String>,
    member_id: Option<String>,
}

impl RoutingHeader {
    pub fn new(group_id: impl Into<String>, member_id: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id.into()),
            member_id: Some(member_id.into()),
        }
    }

    /// Header with only the member set; the group is tagged further down.
    pub fn for_member(member_id: impl Into<String>) -> Self {
        Self {
            group_id: None,
            member_id: Some(member_id.into()),
        }
    }

    /// Header with only the group set.
    pub fn for_group(group_id: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id.into()),
            member_id: None,
        }
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    pub fn member_id(&self) -> Option<&str> {
        self.member_id.as_deref()
    }

    pub fn set_group_id(&mut self, group_id: impl Into<String>) {
        self.group_id = Some(group_id.into());
    }

    pub fn set_member_id(&mut self, member_id: impl Into<String>) {
        self.member_id = Some(member_id.into());
    }

    /// Sum of the encoded sizes of both fields.
    pub fn encoded_len(&self) -> usize {
        wire::string_len(self.group_id.as_deref()) + wire::string_len(self.member_id.as_deref())
    }

    pub fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        wire::put_string(buf, self.group_id.as_deref())?;
        wire::put_string(buf, self.member_id.as_deref())
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        let group_id = wire::get_string(buf)?;
        let member_id = wire::get_string(buf)?;
        Ok(Self {
            group_id,
            member_id,
        })
    }
}

impl fmt::Display for RoutingHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.group_id.as_deref().unwrap_or("null"),
            self.member_id.as_deref().unwrap_or("null")
        )
    }
}
