// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dispatch of node events to a [`NodeHandler`]
//!
//! Events for the same node are always handled one at a time and in the
//! order they arrived. Events for different nodes may be handled
//! concurrently.

use crate::node::Node;
use async_trait::async_trait;
use futures::Stream;
use futures::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Interval;
use tokio::time::MissedTickBehavior;

// Work items buffered per worker before dispatch waits on it.
const WORKER_QUEUE_DEPTH: usize = 64;

enum Work {
    Event(NodeEvent),
    Resync(String),
}

impl Work {
    fn node_name(&self) -> &str {
        match self {
            Work::Event(event) => event.node_name(),
            Work::Resync(name) => name,
        }
    }
}

/// A change to the set of cluster nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    Add(Node),
    Update { old: Node, new: Node },
    Delete(Node),
}

impl NodeEvent {
    pub fn node_name(&self) -> &str {
        match self {
            NodeEvent::Add(node)
            | NodeEvent::Update { new: node, .. }
            | NodeEvent::Delete(node) => &node.name,
        }
    }
}

/// Reacts to node events.
///
/// Handlers report their own failures; a failed event is retried when
/// another event for the same node arrives or the node is resynced.
#[async_trait]
pub trait NodeHandler: Send + Sync + 'static {
    async fn add(&self, node: &Node);
    async fn update(&self, old: &Node, new: &Node);
    async fn delete(&self, node: &Node);
    /// Handle node `name` again from its current state, which may be newer
    /// than any event delivered so far.
    async fn resync(&self, name: &str);
    /// Called once with every node that exists at startup, before any
    /// event.
    async fn sync(&self, nodes: &[Node]);
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Number of workers handling events concurrently.
    pub workers: usize,
    /// If set, every known node is resynced this often.
    pub resync_period_secs: Option<u64>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { workers: 4, resync_period_secs: None }
    }
}

/// Feeds node events to a [`NodeHandler`] through a fixed set of workers,
/// each owning the nodes whose names hash to it.
pub struct NodeWatcher<H> {
    log: Logger,
    handler: Arc<H>,
    config: WatchConfig,
}

impl<H: NodeHandler> NodeWatcher<H> {
    pub fn new(log: &Logger, handler: Arc<H>, config: WatchConfig) -> Self {
        Self { log: log.new(o!("component" => "NodeWatcher")), handler, config }
    }

    /// Sync `initial` nodes, then handle `events` until the stream ends and
    /// every queued event has been handled.
    pub async fn run<S>(self, initial: Vec<Node>, mut events: S)
    where
        S: Stream<Item = NodeEvent> + Unpin,
    {
        self.handler.sync(&initial).await;

        let mut known: BTreeSet<String> =
            initial.into_iter().map(|node| node.name).collect();

        let nworkers = self.config.workers.max(1);
        let mut queues = Vec::with_capacity(nworkers);
        let mut workers = JoinSet::new();
        for id in 0..nworkers {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
            queues.push(tx);
            workers.spawn(run_worker(Arc::clone(&self.handler), rx));
            debug!(self.log, "started node worker"; "worker" => id);
        }

        let mut resync = self.config.resync_period_secs.map(|secs| {
            let period = Duration::from_secs(secs);
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                event = events.next() => {
                    let Some(event) = event else {
                        break;
                    };
                    match &event {
                        NodeEvent::Add(node)
                        | NodeEvent::Update { new: node, .. } => {
                            known.insert(node.name.clone());
                        }
                        NodeEvent::Delete(node) => {
                            known.remove(&node.name);
                        }
                    }
                    self.dispatch(&queues, Work::Event(event)).await;
                }
                _ = next_tick(&mut resync) => {
                    debug!(self.log, "resyncing nodes"; "nodes" => known.len());
                    for name in &known {
                        let work = Work::Resync(name.clone());
                        self.dispatch(&queues, work).await;
                    }
                }
            }
        }

        info!(self.log, "node event stream ended, draining workers");
        drop(queues);
        while let Some(result) = workers.join_next().await {
            if let Err(err) = result {
                error!(self.log, "node worker failed"; "error" => %err);
            }
        }
    }

    async fn dispatch(
        &self,
        queues: &[mpsc::Sender<Work>],
        work: Work,
    ) {
        let index = worker_index(work.node_name(), queues.len());
        if let Err(mpsc::error::SendError(work)) =
            queues[index].send(work).await
        {
            warn!(
                self.log,
                "dropping node work for exited worker";
                "node" => work.node_name(),
                "worker" => index,
            );
        }
    }
}

fn worker_index(node_name: &str, nworkers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    node_name.hash(&mut hasher);
    (hasher.finish() % nworkers as u64) as usize
}

async fn next_tick(resync: &mut Option<Interval>) {
    match resync {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_worker<H: NodeHandler>(
    handler: Arc<H>,
    mut rx: mpsc::Receiver<Work>,
) {
    while let Some(work) = rx.recv().await {
        match work {
            Work::Event(NodeEvent::Add(node)) => handler.add(&node).await,
            Work::Event(NodeEvent::Update { old, new }) => {
                handler.update(&old, &new).await
            }
            Work::Event(NodeEvent::Delete(node)) => {
                handler.delete(&node).await
            }
            Work::Resync(name) => handler.resync(&name).await,
        }
    }
}
