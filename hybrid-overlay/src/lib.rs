// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Master-side controller for a hybrid overlay network
//!
//! Nodes that cannot join the cluster's native overlay are given a host
//! subnet from a set of configured cluster subnets and an overlay port on the
//! network control plane. Native nodes have the subnet assigned by the native
//! overlay mirrored into the same annotation, so every node's subnet can be
//! found in one place.

use anyhow::Context;
use futures::Stream;
use slog::Logger;
use std::sync::Arc;

pub mod allocator;
pub mod annotator;
pub mod config;
pub mod controller;
pub mod fakes;
pub mod nbctl;
pub mod node;
pub mod port;
pub mod subnet_allocator;
pub mod watch;

pub use allocator::ClusterSubnet;
pub use allocator::MasterSubnetAllocator;
pub use config::Config;
pub use controller::MasterController;
pub use nbctl::Nbctl;
pub use node::Node;
pub use node::NodeApi;
pub use port::ControlPlane;
pub use watch::NodeEvent;
pub use watch::NodeHandler;
pub use watch::NodeWatcher;

/// Run the master until `events` ends.
///
/// `initial_nodes` is every node that exists at startup; subnets already
/// recorded on them are never handed out again.
pub async fn run_master<S>(
    log: &Logger,
    config: &Config,
    node_api: Arc<dyn NodeApi>,
    control_plane: Arc<dyn ControlPlane>,
    initial_nodes: Vec<Node>,
    events: S,
) -> anyhow::Result<()>
where
    S: Stream<Item = NodeEvent> + Unpin,
{
    config.validate().context("invalid configuration")?;
    let allocator = MasterSubnetAllocator::from_nodes(
        log,
        &config.cluster_subnets,
        &initial_nodes,
    )
    .context("failed to create host subnet allocator")?;
    let controller = Arc::new(MasterController::new(
        log,
        node_api,
        Arc::new(allocator),
        control_plane,
        config.platform.clone(),
    ));
    NodeWatcher::new(log, controller, config.watch.clone())
        .run(initial_nodes, events)
        .await;
    Ok(())
}
