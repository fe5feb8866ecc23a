//! Messages, typed header sets and message batches.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::header::{ROUTING_HEADER_ID, RoutingHeader};
use crate::types::Address;

/// A typed header attached to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    /// Multiplexing key, always stored under [`ROUTING_HEADER_ID`].
    Routing(RoutingHeader),
    /// Header owned by some other stage; carried through untouched.
    Opaque { id: u16, data: Bytes },
}

impl Header {
    pub const fn id(&self) -> u16 {
        match self {
            Self::Routing(_) => ROUTING_HEADER_ID,
            Self::Opaque { id, .. } => *id,
        }
    }
}

/// Header set keyed by header id. At most one header per id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: BTreeMap<u16, Header>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing any header with the same id.
    pub fn put(&mut self, header: Header) -> Option<Header> {
        self.entries.insert(header.id(), header)
    }

    pub fn get(&self, id: u16) -> Option<&Header> {
        self.entries.get(&id)
    }

    pub fn remove(&mut self, id: u16) -> Option<Header> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.entries.values()
    }
}

/// An opaque payload plus headers, optionally addressed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Destination; `None` means every member.
    pub dest: Option<Address>,
    /// Sender, filled in by the transport.
    pub src: Option<Address>,
    pub payload: Bytes,
    pub headers: Headers,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Address the message to a single member.
    #[must_use]
    pub const fn to(mut self, dest: Address) -> Self {
        self.dest = Some(dest);
        self
    }

    #[must_use]
    pub fn with_header(mut self, header: Header) -> Self {
        self.headers.put(header);
        self
    }

    pub fn routing(&self) -> Option<&RoutingHeader> {
        match self.headers.get(ROUTING_HEADER_ID) {
            Some(Header::Routing(hdr)) => Some(hdr),
            _ => None,
        }
    }

    pub fn routing_mut(&mut self) -> Option<&mut RoutingHeader> {
        match self.headers.entries.get_mut(&ROUTING_HEADER_ID) {
            Some(Header::Routing(hdr)) => Some(hdr),
            _ => None,
        }
    }

    /// Attach a routing header, replacing an existing one.
    pub fn put_routing(&mut self, header: RoutingHeader) {
        self.headers.put(Header::Routing(header));
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Messages received together from one sender, sharing batch-level metadata.
#[derive(Debug, Clone)]
pub struct MessageBatch {
    dest: Option<Address>,
    sender: Address,
    cluster_name: Arc<str>,
    multicast: bool,
    messages: Vec<Message>,
}

impl MessageBatch {
    pub fn new(
        dest: Option<Address>,
        sender: Address,
        cluster_name: impl Into<Arc<str>>,
        multicast: bool,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            dest,
            sender,
            cluster_name: cluster_name.into(),
            multicast,
            messages,
        }
    }

    /// New batch carrying the same metadata as `self` but different messages.
    pub fn derive(&self, messages: Vec<Message>) -> Self {
        Self {
            dest: self.dest,
            sender: self.sender,
            cluster_name: Arc::clone(&self.cluster_name),
            multicast: self.multicast,
            messages,
        }
    }

    /// Remove every message matching `pred`, returning them in their original
    /// order. Messages left behind also keep their relative order.
    pub fn extract<F>(&mut self, mut pred: F) -> Vec<Message>
    where
        F: FnMut(&Message) -> bool,
    {
        let (taken, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.messages).into_iter().partition(|m| pred(m));
        self.messages = kept;
        taken
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub const fn dest(&self) -> Option<Address> {
        self.dest
    }

    pub const fn sender(&self) -> Address {
        self.sender
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub const fn multicast(&self) -> bool {
        self.multicast
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

impl IntoIterator for MessageBatch {
    type Item = Message;
    type IntoIter = std::vec::IntoIter<Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

impl<'a> IntoIterator for &'a MessageBatch {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tagged(payload: &'static str, group: &str) -> Message {
        let mut msg = Message::new(payload);
        msg.put_routing(RoutingHeader::new(group, "m"));
        msg
    }

    fn payloads(msgs: &[Message]) -> Vec<String> {
        msgs.iter()
            .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
            .collect()
    }

    #[test]
    fn routing_header_accessors() {
        let mut msg = Message::new("x");
        assert!(msg.routing().is_none());
        assert!(msg.routing_mut().is_none());

        msg.put_routing(RoutingHeader::for_member("m1"));
        msg.routing_mut().unwrap().set_group_id("g1");
        assert_eq!(msg.routing().unwrap().to_string(), "g1:m1");
        assert_eq!(msg.headers.len(), 1);
    }

    #[test]
    fn opaque_header_does_not_shadow_routing() {
        let msg = Message::new("x").with_header(Header::Opaque {
            id: 3,
            data: Bytes::from_static(b"abc"),
        });
        assert!(msg.routing().is_none());
        assert_eq!(msg.headers.get(3).map(Header::id), Some(3));
    }

    #[test]
    fn extract_preserves_order_on_both_sides() {
        let addr = Address::random();
        let mut batch = MessageBatch::new(
            None,
            addr,
            "cluster",
            true,
            vec![
                Message::new("a"),
                tagged("b", "g1"),
                Message::new("c"),
                tagged("d", "g2"),
                tagged("e", "g1"),
            ],
        );

        let taken = batch.extract(|m| m.routing().is_some());
        assert_eq!(payloads(&taken), vec!["b", "d", "e"]);
        assert_eq!(payloads(batch.messages()), vec!["a", "c"]);
    }

    #[test]
    fn derive_shares_metadata() {
        let sender = Address::random();
        let dest = Address::random();
        let batch = MessageBatch::new(Some(dest), sender, "c1", false, vec![Message::new("a")]);
        let derived = batch.derive(vec![Message::new("x"), Message::new("y")]);

        assert_eq!(derived.dest(), Some(dest));
        assert_eq!(derived.sender(), sender);
        assert_eq!(derived.cluster_name(), "c1");
        assert!(!derived.multicast());
        assert_eq!(derived.len(), 2);
        assert_eq!(batch.len(), 1);
    }
}
