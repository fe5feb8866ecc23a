//! In-process shared channels joined through a [`MemoryNetwork`].
//!
//! Messages leaving the bottom of a channel's pipeline are encoded with the
//! wire codec and a decoded copy is delivered to the bottom of every target's
//! pipeline, in line on the sending thread. Views are installed on every
//! member whenever a channel joins or leaves a cluster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tracing::{debug, info, trace, warn};

use forkline_core::{Address, Event, Message, MessageBatch, View, wire};

use super::{ChannelListener, ChannelStats, ChannelStatus, ListenerId, SharedChannel};
use crate::error::StageError;
use crate::stack::{DownHandler, Pipeline, StageRef, UpHandler};

#[derive(Clone)]
struct Member {
    address: Address,
    name: String,
    channel: Weak<LocalChannel>,
}

#[derive(Default)]
struct Cluster {
    members: Vec<Member>,
    last_view_id: u64,
}

impl Cluster {
    fn view(&mut self) -> View {
        self.last_view_id += 1;
        let members: Vec<Address> = self.members.iter().map(|m| m.address).collect();
        View::new(members[0], self.last_view_id, members)
    }

    fn live(&self) -> Vec<Arc<LocalChannel>> {
        self.members.iter().filter_map(|m| m.channel.upgrade()).collect()
    }
}

/// Registry of in-process clusters.
#[derive(Default)]
pub struct MemoryNetwork {
    clusters: RwLock<HashMap<String, Cluster>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current members of `cluster`, oldest first.
    pub fn members(&self, cluster: &str) -> Vec<Address> {
        self.clusters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(cluster)
            .map(|c| c.members.iter().map(|m| m.address).collect())
            .unwrap_or_default()
    }

    fn join(&self, cluster: &str, channel: &Arc<LocalChannel>) -> (View, Vec<Arc<LocalChannel>>) {
        let mut clusters = self.clusters.write().unwrap_or_else(|e| e.into_inner());
        let state = clusters.entry(cluster.to_string()).or_default();
        state.members.push(Member {
            address: channel.address,
            name: channel.name.clone(),
            channel: Arc::downgrade(channel),
        });
        (state.view(), state.live())
    }

    fn leave(&self, cluster: &str, address: Address) -> Option<(View, Vec<Arc<LocalChannel>>)> {
        let mut clusters = self.clusters.write().unwrap_or_else(|e| e.into_inner());
        let state = clusters.get_mut(cluster)?;
        state.members.retain(|m| m.address != address);
        if state.members.is_empty() {
            clusters.remove(cluster);
            return None;
        }
        Some((state.view(), state.live()))
    }

    fn targets(&self, cluster: &str, dest: Option<Address>) -> Vec<Arc<LocalChannel>> {
        let clusters = self.clusters.read().unwrap_or_else(|e| e.into_inner());
        let Some(state) = clusters.get(cluster) else {
            return Vec::new();
        };
        state
            .members
            .iter()
            .filter(|m| dest.is_none_or(|d| d == m.address))
            .filter_map(|m| m.channel.upgrade())
            .collect()
    }

    fn name_of(&self, address: &Address) -> Option<String> {
        self.clusters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .flat_map(|c| c.members.iter())
            .find(|m| m.address == *address)
            .map(|m| m.name.clone())
    }
}

struct LocalState {
    status: ChannelStatus,
    cluster: Option<String>,
    view: Option<View>,
}

#[derive(Default)]
struct Counters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// A shared channel living in this process.
pub struct LocalChannel {
    name: String,
    address: Address,
    network: Arc<MemoryNetwork>,
    pipeline: Arc<Pipeline>,
    state: RwLock<LocalState>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ChannelListener>)>>,
    next_listener: AtomicU64,
    counters: Counters,
}

impl LocalChannel {
    /// Create an open (not yet connected) channel whose shared pipeline holds
    /// `stages`, bottom to top.
    pub fn new(
        name: impl Into<String>,
        network: &Arc<MemoryNetwork>,
        stages: Vec<StageRef>,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let pipeline = Arc::new(Pipeline::new(format!("shared:{name}"), stages));
            pipeline.set_bottom_sink(Arc::new(LocalTransport {
                channel: weak.clone(),
            }));
            Self {
                name,
                address: Address::random(),
                network: Arc::clone(network),
                pipeline,
                state: RwLock::new(LocalState {
                    status: ChannelStatus::Open,
                    cluster: None,
                    view: None,
                }),
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                counters: Counters::default(),
            }
        })
    }

    /// Set the consumer of events leaving the top of the shared pipeline.
    pub fn set_receiver(&self, handler: Arc<dyn UpHandler>) {
        self.pipeline.set_top_handler(handler);
    }

    /// Join `cluster`, installing a new view on every member.
    pub fn connect(self: &Arc<Self>, cluster: &str) -> Result<(), StageError> {
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            match state.status {
                ChannelStatus::Closed => {
                    return Err(StageError::Transport(format!("channel {} is closed", self.name)));
                }
                ChannelStatus::Connected | ChannelStatus::Connecting => {
                    if state.cluster.as_deref() == Some(cluster) {
                        return Ok(());
                    }
                    return Err(StageError::Transport(format!(
                        "channel {} is already connected to {}",
                        self.name,
                        state.cluster.as_deref().unwrap_or_default()
                    )));
                }
                ChannelStatus::Open => {}
            }
            state.status = ChannelStatus::Connecting;
            state.cluster = Some(cluster.to_string());
        }

        let (view, members) = self.network.join(cluster, self);
        self.state.write().unwrap_or_else(|e| e.into_inner()).status = ChannelStatus::Connected;
        info!(channel = %self.name, address = %self.address, cluster, view = %view, "Connected");

        install_view(&view, &members);
        self.notify(ChannelStatus::Connected);
        Ok(())
    }

    /// Leave the current cluster. No-op unless connected.
    pub fn disconnect(&self) {
        let cluster = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            if state.status != ChannelStatus::Connected {
                return;
            }
            state.status = ChannelStatus::Open;
            state.view = None;
            state.cluster.take()
        };
        if let Some(cluster) = cluster {
            if let Some((view, members)) = self.network.leave(&cluster, self.address) {
                install_view(&view, &members);
            }
            info!(channel = %self.name, cluster, "Disconnected");
        }
        self.notify(ChannelStatus::Open);
    }

    pub fn close(&self) {
        self.disconnect();
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            if state.status == ChannelStatus::Closed {
                return;
            }
            state.status = ChannelStatus::Closed;
        }
        info!(channel = %self.name, "Closed");
        self.notify(ChannelStatus::Closed);
    }

    /// Deliver an inbound message at the bottom of the shared pipeline.
    pub fn receive(&self, msg: Message) -> Result<(), StageError> {
        self.count_received(1, msg.len());
        self.pipeline.up(Event::Message(msg))
    }

    /// Deliver an inbound batch at the bottom of the shared pipeline.
    pub fn receive_batch(&self, batch: MessageBatch) -> Result<(), StageError> {
        let bytes = batch.iter().map(Message::len).sum();
        self.count_received(batch.len(), bytes);
        self.pipeline.up_batch(batch)
    }

    fn count_received(&self, messages: usize, bytes: usize) {
        self.counters
            .messages_received
            .fetch_add(messages as u64, Ordering::Relaxed);
        self.counters
            .bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn install(&self, view: View) -> Result<(), StageError> {
        self.state.write().unwrap_or_else(|e| e.into_inner()).view = Some(view.clone());
        self.pipeline.up(Event::ViewChange(view))
    }

    fn transmit(&self, mut msg: Message) -> Result<(), StageError> {
        let cluster = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if state.status != ChannelStatus::Connected {
                return Err(StageError::Transport(format!(
                    "channel {} is {}",
                    self.name, state.status
                )));
            }
            state.cluster.clone().unwrap_or_default()
        };

        msg.src = Some(self.address);
        let encoded =
            wire::encode_message(&msg).map_err(|e| StageError::Transport(e.to_string()))?;
        self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_sent
            .fetch_add(msg.payload.len() as u64, Ordering::Relaxed);

        let targets = self.network.targets(&cluster, msg.dest);
        if targets.is_empty() {
            debug!(channel = %self.name, dest = ?msg.dest, "No receivers for message");
        }
        for target in targets {
            let copy = wire::decode_message(encoded.clone())
                .map_err(|e| StageError::Transport(e.to_string()))?;
            if let Err(e) = target.receive(copy) {
                warn!(
                    from = %self.name,
                    to = %target.name,
                    error = %e,
                    "Delivery failed at receiver"
                );
            }
        }
        Ok(())
    }

    fn notify(&self, status: ChannelStatus) {
        let listeners: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener.status_changed(self, status);
        }
    }
}

fn install_view(view: &View, members: &[Arc<LocalChannel>]) {
    for member in members {
        if let Err(e) = member.install(view.clone()) {
            warn!(channel = %member.name, view = %view, error = %e, "View installation failed");
        }
    }
}

impl SharedChannel for LocalChannel {
    fn address(&self) -> Option<Address> {
        Some(self.address)
    }

    fn name(&self) -> Option<String> {
        Some(self.name.clone())
    }

    fn name_of(&self, member: &Address) -> Option<String> {
        self.network.name_of(member)
    }

    fn cluster_name(&self) -> Option<String> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).cluster.clone()
    }

    fn view(&self) -> Option<View> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).view.clone()
    }

    fn status(&self) -> ChannelStatus {
        self.state.read().unwrap_or_else(|e| e.into_inner()).status
    }

    fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    fn send(&self, msg: Message) -> Result<(), StageError> {
        self.pipeline.down(Event::Message(msg))
    }

    fn stats(&self) -> ChannelStats {
        ChannelStats {
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
        }
    }

    fn subscribe(&self, listener: Arc<dyn ChannelListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        id
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }
}

/// Bottom sink of a local channel's shared pipeline.
struct LocalTransport {
    channel: Weak<LocalChannel>,
}

impl DownHandler for LocalTransport {
    fn down(&self, event: Event) -> Result<(), StageError> {
        let channel = self
            .channel
            .upgrade()
            .ok_or_else(|| StageError::Transport("channel dropped".into()))?;
        match event {
            Event::Message(msg) => channel.transmit(msg),
            other => {
                trace!(
                    channel = %channel.name,
                    kind = other.kind(),
                    "Ignoring non-message event at transport"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::testing::{Recorder, payload_strings};

    #[derive(Default)]
    struct StatusLog(Mutex<Vec<ChannelStatus>>);

    impl ChannelListener for StatusLog {
        fn status_changed(&self, _channel: &dyn SharedChannel, status: ChannelStatus) {
            self.0.lock().unwrap().push(status);
        }
    }

    fn node(name: &str, net: &Arc<MemoryNetwork>) -> (Arc<LocalChannel>, Arc<Recorder>) {
        let ch = LocalChannel::new(name, net, Vec::new());
        let rec = Arc::new(Recorder::default());
        ch.set_receiver(rec.clone());
        (ch, rec)
    }

    #[test]
    fn connect_installs_views_on_all_members() {
        let net = MemoryNetwork::new();
        let (a, rec_a) = node("a", &net);
        let (b, rec_b) = node("b", &net);

        a.connect("c").unwrap();
        b.connect("c").unwrap();

        let view = b.view().unwrap();
        assert_eq!(view.members, vec![a.address().unwrap(), b.address().unwrap()]);
        assert_eq!(a.view().unwrap(), view);
        assert_eq!(rec_a.views().len(), 2);
        assert_eq!(rec_b.views().len(), 1);
        assert_eq!(net.members("c").len(), 2);
        assert_eq!(a.name_of(&b.address().unwrap()).as_deref(), Some("b"));
    }

    #[test]
    fn multicast_reaches_every_member_including_sender() {
        let net = MemoryNetwork::new();
        let (a, rec_a) = node("a", &net);
        let (b, rec_b) = node("b", &net);
        a.connect("c").unwrap();
        b.connect("c").unwrap();

        a.send(Message::new("hello")).unwrap();

        assert_eq!(payload_strings(&rec_a.messages()), vec!["hello"]);
        assert_eq!(payload_strings(&rec_b.messages()), vec!["hello"]);
        assert_eq!(rec_b.messages()[0].src, a.address());
        assert_eq!(a.stats().messages_sent, 1);
        assert_eq!(b.stats().messages_received, 1);
    }

    #[test]
    fn unicast_reaches_only_destination() {
        let net = MemoryNetwork::new();
        let (a, rec_a) = node("a", &net);
        let (b, rec_b) = node("b", &net);
        a.connect("c").unwrap();
        b.connect("c").unwrap();

        a.send(Message::new("direct").to(b.address().unwrap())).unwrap();

        assert!(rec_a.messages().is_empty());
        assert_eq!(payload_strings(&rec_b.messages()), vec!["direct"]);
    }

    #[test]
    fn send_requires_connection() {
        let net = MemoryNetwork::new();
        let (a, _) = node("a", &net);
        assert!(matches!(
            a.send(Message::new("x")),
            Err(StageError::Transport(_))
        ));
    }

    #[test]
    fn listeners_follow_lifecycle() {
        let net = MemoryNetwork::new();
        let (a, _) = node("a", &net);
        let log = Arc::new(StatusLog::default());
        let id = a.subscribe(log.clone());

        a.connect("c").unwrap();
        a.disconnect();
        a.close();
        assert_eq!(
            *log.0.lock().unwrap(),
            vec![ChannelStatus::Connected, ChannelStatus::Open, ChannelStatus::Closed]
        );
        assert!(a.unsubscribe(id));
        assert!(!a.unsubscribe(id));
        assert!(a.connect("c").is_err());
    }

    #[test]
    fn leaving_installs_smaller_view() {
        let net = MemoryNetwork::new();
        let (a, rec_a) = node("a", &net);
        let (b, _) = node("b", &net);
        a.connect("c").unwrap();
        b.connect("c").unwrap();

        b.disconnect();

        let views = rec_a.views();
        assert_eq!(views.last().unwrap().members, vec![a.address().unwrap()]);
        assert!(b.view().is_none());
        assert!(b.cluster_name().is_none());
    }
}
