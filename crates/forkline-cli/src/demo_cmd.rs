//! Demo subcommand: fork channels over an in-memory cluster.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Write};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use forkline_core::config::{MuxConfig, StagePosition};
use forkline_core::{Event, Message};
use forkline_mux::{
    EventSink, ForkChannelBuilder, LocalChannel, MemoryNetwork, SharedChannel, Stage, StageRef,
};

/// Names of the pass-through stages every demo node's shared pipeline holds,
/// bottom to top. Usable as `--neighbor` values.
const SHARED_STAGES: [&str; 3] = ["transport", "reliability", "membership"];

#[derive(clap::Args, Debug)]
pub struct DemoArgs {
    /// Number of in-memory nodes.
    #[arg(long, default_value_t = 2)]
    nodes: usize,

    /// Fork groups per node.
    #[arg(long, default_value_t = 2)]
    groups: usize,

    /// Fork channels per group.
    #[arg(long, default_value_t = 2)]
    members: usize,

    /// Messages sent by every fork channel.
    #[arg(long, default_value_t = 3)]
    messages: usize,

    /// Cluster the nodes join.
    #[arg(long, default_value = "forkline-demo")]
    cluster: String,

    /// Shared-pipeline stage the demultiplexer is placed next to.
    #[arg(long)]
    neighbor: Option<String>,

    /// Demultiplexer position relative to the neighbor: above or below.
    #[arg(long)]
    position: Option<StagePosition>,
}

/// Pass-through stage standing in for a real protocol layer.
struct Layer(&'static str);

impl Stage for Layer {
    fn name(&self) -> &str {
        self.0
    }
}

struct Node {
    name: String,
    shared: Arc<LocalChannel>,
    unforked: JoinHandle<(String, usize)>,
}

/// Execute the demo.
pub async fn run(args: DemoArgs, mut config: MuxConfig) -> anyhow::Result<()> {
    anyhow::ensure!(
        args.nodes > 0 && args.groups > 0 && args.members > 0,
        "--nodes, --groups and --members must be positive"
    );
    if let Some(neighbor) = args.neighbor {
        config.neighbor = Some(neighbor);
    }
    if let Some(position) = args.position {
        config.position = position;
    }

    let net = MemoryNetwork::new();
    let mut nodes = Vec::with_capacity(args.nodes);
    let mut forks = Vec::new();
    let mut consumers = Vec::new();

    for n in 0..args.nodes {
        let name = format!("node-{n}");
        let shared = LocalChannel::new(
            name.as_str(),
            &net,
            SHARED_STAGES
                .into_iter()
                .map(|s| Arc::new(Layer(s)) as StageRef)
                .collect(),
        );
        let (sink, rx) = EventSink::channel();
        shared.set_receiver(sink);
        let unforked = tokio::spawn(count_messages(format!("{name}/shared"), rx));

        for g in 0..args.groups {
            for m in 0..args.members {
                let (sink, rx) = EventSink::channel();
                let channel = ForkChannelBuilder::from_config(&config)
                    .shared(shared.clone())
                    .group_id(format!("group-{g}"))
                    .member_id(format!("member-{m}"))
                    .up_handler(sink)
                    .build()?;
                let label = format!("{name}/group-{g}:member-{m}");
                consumers.push(tokio::spawn(count_messages(label, rx)));
                forks.push(channel);
            }
        }
        info!(node = %name, stages = ?shared.pipeline().stage_names(), "Node ready");
        nodes.push(Node {
            name,
            shared,
            unforked,
        });
    }

    for node in &nodes {
        node.shared.connect(&args.cluster)?;
    }

    for fork in &forks {
        for i in 0..args.messages {
            let payload = format!("{}:{} #{i}", fork.group_id(), fork.member_id());
            fork.send(Message::new(payload))?;
        }
    }
    for node in &nodes {
        node.shared.send(Message::new(format!("plain from {}", node.name)))?;
    }

    let node_stats: Vec<_> = nodes.iter().map(node_report).collect();
    debug!(forks = forks.len(), "Dropping fork channels");
    drop(forks);

    let expected = args.messages * args.nodes;
    let mut deliveries = Vec::with_capacity(consumers.len());
    let mut short = 0usize;
    for consumer in consumers {
        let (label, received) = consumer.await?;
        if received != expected {
            short += 1;
            warn!(channel = %label, received, expected, "Unexpected delivery count");
        }
        deliveries.push(json!({ "channel": label, "received": received }));
    }

    let mut unforked = Vec::with_capacity(nodes.len());
    for node in nodes {
        let Node {
            name,
            shared,
            unforked: handle,
        } = node;
        shared.close();
        drop(shared);
        let (_, received) = handle.await?;
        unforked.push(json!({ "node": name, "received": received }));
    }

    let report = json!({
        "expected_per_channel": expected,
        "nodes": node_stats,
        "deliveries": deliveries,
        "unforked": unforked,
    });
    writeln!(io::stdout(), "{}", serde_json::to_string_pretty(&report)?)?;

    anyhow::ensure!(short == 0, "{short} fork channel(s) received an unexpected message count");
    info!("Demo complete");
    Ok(())
}

fn node_report(node: &Node) -> serde_json::Value {
    let demux = node
        .shared
        .pipeline()
        .find_demux()
        .and_then(|d| d.as_demux().map(|demux| (demux.stats(), demux.groups())));
    let (stats, groups) = demux.unzip();
    json!({
        "node": node.name,
        "groups": groups,
        "demux": stats,
        "channel": node.shared.stats(),
    })
}

/// Count messages arriving on `rx` until every sender is gone.
async fn count_messages(label: String, mut rx: mpsc::UnboundedReceiver<Event>) -> (String, usize) {
    let mut received = 0usize;
    while let Some(event) = rx.recv().await {
        match event {
            Event::Message(msg) => {
                received += 1;
                debug!(
                    channel = %label,
                    src = ?msg.src,
                    payload = %String::from_utf8_lossy(&msg.payload),
                    "Delivered"
                );
            }
            other => debug!(channel = %label, kind = other.kind(), "Event"),
        }
    }
    (label, received)
}
