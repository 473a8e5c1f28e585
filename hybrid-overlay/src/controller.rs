// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-node reconciliation of host subnets and overlay ports

use crate::allocator::AllocateError;
use crate::allocator::MasterSubnetAllocator;
use crate::annotator::AnnotatorError;
use crate::annotator::NodeAnnotator;
use crate::node::Node;
use crate::node::NodeApi;
use crate::node::Platform;
use crate::node::PlatformClassifier;
use crate::node::EXTERNAL_SUBNET;
use crate::node::NATIVE_SUBNET;
use crate::node::PORT_MAC;
use crate::port::mac_to_string;
use crate::port::ControlPlane;
use crate::port::PortManager;
use crate::watch::NodeHandler;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use slog_error_chain::SlogInlineError;
use std::sync::Arc;

/// The inputs to the subnet decision for one node, with malformed
/// annotations already treated as absent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeSubnetState {
    pub platform: Platform,
    pub native: Option<IpNetwork>,
    pub external: Option<IpNetwork>,
}

/// What to do with a node's `external-subnet` annotation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubnetAction {
    Keep,
    /// The native overlay no longer assigns the node a subnet.
    RemoveExternal,
    /// Mirror the subnet assigned by the native overlay.
    SyncExternal(IpNetwork),
    /// Allocate a subnet from the cluster subnets.
    Allocate,
}

impl SubnetAction {
    pub fn decide(state: &NodeSubnetState) -> Self {
        match (state.platform, state.native, state.external) {
            (Platform::Target, _, Some(_)) => SubnetAction::Keep,
            (Platform::Target, _, None) => SubnetAction::Allocate,
            (Platform::Native, Some(native), external)
                if external != Some(native) =>
            {
                SubnetAction::SyncExternal(native)
            }
            (Platform::Native, Some(_), _) => SubnetAction::Keep,
            (Platform::Native, None, Some(_)) => SubnetAction::RemoveExternal,
            (Platform::Native, None, None) => SubnetAction::Keep,
        }
    }
}

/// State of a node's `port-mac` annotation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MacState {
    Absent,
    /// Present but not a MAC address.
    Invalid,
    Present,
}

/// What to do with a node's overlay port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortAction {
    None,
    /// Make sure the port exists with an address in this subnet.
    Ensure(IpNetwork),
    Remove,
}

impl PortAction {
    /// `subnet` is the node's currently recorded subnet: the native one if
    /// any, else the external one.
    pub fn decide(
        platform: Platform,
        subnet: Option<IpNetwork>,
        mac: MacState,
    ) -> Self {
        match (platform, subnet, mac) {
            (Platform::Native, _, _) => PortAction::None,
            (Platform::Target, Some(_), MacState::Present) => PortAction::None,
            (Platform::Target, Some(subnet), _) => PortAction::Ensure(subnet),
            (Platform::Target, None, MacState::Absent) => PortAction::None,
            (Platform::Target, None, _) => PortAction::Remove,
        }
    }
}

#[derive(Debug, thiserror::Error, SlogInlineError)]
pub enum ReconcileError {
    #[error("failed to allocate a host subnet for node {node}")]
    Allocate {
        node: String,
        #[source]
        err: AllocateError,
    },

    #[error(transparent)]
    Annotate(#[from] AnnotatorError),
}

/// Drives every node toward its desired subnet and overlay port.
pub struct MasterController {
    log: Logger,
    node_api: Arc<dyn NodeApi>,
    allocator: Arc<MasterSubnetAllocator>,
    ports: PortManager,
    classifier: PlatformClassifier,
}

impl MasterController {
    pub fn new(
        log: &Logger,
        node_api: Arc<dyn NodeApi>,
        allocator: Arc<MasterSubnetAllocator>,
        control_plane: Arc<dyn ControlPlane>,
        classifier: PlatformClassifier,
    ) -> Self {
        let log = log.new(o!("component" => "MasterController"));
        let ports = PortManager::new(&log, control_plane);
        Self { log, node_api, allocator, ports, classifier }
    }

    fn subnet(
        &self,
        log: &Logger,
        node: &Node,
        key: &str,
    ) -> Option<IpNetwork> {
        match node.subnet_annotation(key) {
            Ok(subnet) => subnet,
            Err(error) => {
                warn!(
                    log,
                    "ignoring malformed subnet annotation";
                    "error" => &error,
                );
                None
            }
        }
    }

    fn mac_state(&self, log: &Logger, node: &Node) -> MacState {
        match node.port_mac() {
            Ok(Some(_)) => MacState::Present,
            Ok(None) => MacState::Absent,
            Err(error) => {
                warn!(log, "ignoring malformed port MAC"; "error" => &error);
                MacState::Invalid
            }
        }
    }

    pub fn subnet_state(&self, node: &Node) -> NodeSubnetState {
        let log = self.log.new(o!("node" => node.name.clone()));
        NodeSubnetState {
            platform: self.classifier.classify(node),
            native: self.subnet(&log, node, NATIVE_SUBNET),
            external: self.subnet(&log, node, EXTERNAL_SUBNET),
        }
    }

    /// Bring `node`'s annotations and overlay port in line with its
    /// platform and subnets, persisting every change in one update.
    ///
    /// A newly allocated subnet is released again if it cannot be recorded.
    /// Port failures are logged and leave `port-mac` unchanged; the subnet
    /// changes are still applied. An allocation failure is returned only
    /// after the port has been reconciled and the remaining changes applied.
    pub async fn reconcile_node(
        &self,
        node: &Node,
    ) -> Result<(), ReconcileError> {
        let log = self.log.new(o!("node" => node.name.clone()));
        let state = self.subnet_state(node);
        let mut annotator =
            NodeAnnotator::new(&self.log, &*self.node_api, node);

        let mut allocate_error = None;
        match SubnetAction::decide(&state) {
            SubnetAction::Keep => {}
            SubnetAction::RemoveExternal => {
                info!(log, "removing external subnet no longer assigned");
                annotator.del(EXTERNAL_SUBNET);
            }
            SubnetAction::SyncExternal(native) => {
                info!(log, "recording native subnet"; "subnet" => %native);
                annotator.set(EXTERNAL_SUBNET, native.to_string());
            }
            SubnetAction::Allocate => match self.allocator.allocate() {
                Ok(subnet) => {
                    info!(log, "allocated host subnet"; "subnet" => %subnet);
                    let allocator = Arc::clone(&self.allocator);
                    let handler_log = log.clone();
                    annotator.set_with_failure_handler(
                        EXTERNAL_SUBNET,
                        subnet.to_string(),
                        move |_, _, _| {
                            release_subnet(&handler_log, &allocator, subnet);
                        },
                    );
                }
                Err(err) => {
                    allocate_error = Some(ReconcileError::Allocate {
                        node: node.name.clone(),
                        err,
                    });
                }
            },
        }

        let subnet = state.native.or(state.external);
        let mac = self.mac_state(&log, node);
        match PortAction::decide(state.platform, subnet, mac) {
            PortAction::None => {}
            PortAction::Ensure(subnet) => {
                match self.ports.ensure_port(node, subnet).await {
                    Ok(Some(mac)) => {
                        annotator.set(PORT_MAC, mac_to_string(mac));
                    }
                    Ok(None) => {}
                    Err(error) => {
                        error!(
                            log,
                            "failed to provision overlay port";
                            "error" => &error,
                        );
                    }
                }
            }
            PortAction::Remove => match self.ports.remove_port(node).await {
                Ok(()) => annotator.del(PORT_MAC),
                Err(error) => {
                    error!(
                        log,
                        "failed to remove overlay port";
                        "error" => &error,
                    );
                }
            },
        }

        annotator.run().await?;
        match allocate_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Release everything held on behalf of a deleted node.
    pub async fn remove_node(&self, node: &Node) {
        let log = self.log.new(o!("node" => node.name.clone()));
        if let Some(subnet) = self.subnet(&log, node, EXTERNAL_SUBNET) {
            release_subnet(&log, &self.allocator, subnet);
        }
        if node.annotations.contains_key(PORT_MAC) {
            if let Err(error) = self.ports.remove_port(node).await {
                error!(log, "failed to remove overlay port"; "error" => &error);
            }
        }
    }
}

fn release_subnet(
    log: &Logger,
    allocator: &MasterSubnetAllocator,
    subnet: IpNetwork,
) {
    match allocator.release(subnet) {
        Ok(()) => info!(log, "released host subnet"; "subnet" => %subnet),
        Err(error) => {
            warn!(log, "failed to release host subnet"; "error" => &error);
        }
    }
}

#[async_trait]
impl NodeHandler for MasterController {
    async fn add(&self, node: &Node) {
        if let Err(error) = self.reconcile_node(node).await {
            error!(
                self.log,
                "failed to reconcile node";
                "node" => &node.name,
                "error" => &error,
            );
        }
    }

    async fn update(&self, _old: &Node, new: &Node) {
        self.add(new).await
    }

    async fn delete(&self, node: &Node) {
        self.remove_node(node).await
    }

    async fn resync(&self, name: &str) {
        match self.node_api.get_node(name).await {
            Ok(Some(node)) => self.add(&node).await,
            Ok(None) => {
                debug!(
                    self.log,
                    "skipping resync of deleted node";
                    "node" => name,
                );
            }
            Err(error) => {
                warn!(
                    self.log,
                    "failed to fetch node for resync";
                    "node" => name,
                    "error" => %InlineErrorChain::new(&error),
                );
            }
        }
    }

    async fn sync(&self, nodes: &[Node]) {
        // Allocated subnets were already excluded when the allocator was
        // built from these nodes.
        info!(self.log, "initial node sync"; "nodes" => nodes.len());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::allocator::ClusterSubnet;
    use crate::fakes::ControlPlaneCall;
    use crate::fakes::FakeControlPlane;
    use crate::fakes::FakeNodeApi;
    use crate::port::PortSpec;
    use assert_matches::assert_matches;
    use hybrid_overlay_test_utils::dev::test_setup_log;
    use macaddr::MacAddr6;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn test_subnet_decision_table() {
        use Platform::*;
        let a = Some(net("10.1.2.0/24"));
        let b = Some(net("10.9.0.0/23"));
        let cases = [
            (Native, None, a, SubnetAction::RemoveExternal),
            (Native, a, b, SubnetAction::SyncExternal(net("10.1.2.0/24"))),
            (Native, a, None, SubnetAction::SyncExternal(net("10.1.2.0/24"))),
            (Native, a, a, SubnetAction::Keep),
            (Native, None, None, SubnetAction::Keep),
            (Target, None, b, SubnetAction::Keep),
            (Target, a, b, SubnetAction::Keep),
            (Target, None, None, SubnetAction::Allocate),
            (Target, a, None, SubnetAction::Allocate),
        ];
        for (platform, native, external, expected) in cases {
            let state = NodeSubnetState { platform, native, external };
            assert_eq!(SubnetAction::decide(&state), expected, "{state:?}");
        }
    }

    #[test]
    fn test_port_decision_table() {
        use MacState::*;
        use Platform::*;
        let a = Some(net("10.1.2.0/24"));
        let cases = [
            (Native, a, Absent, PortAction::None),
            (Native, None, Present, PortAction::None),
            (Target, a, Present, PortAction::None),
            (Target, a, Absent, PortAction::Ensure(net("10.1.2.0/24"))),
            (Target, a, Invalid, PortAction::Ensure(net("10.1.2.0/24"))),
            (Target, None, Absent, PortAction::None),
            (Target, None, Present, PortAction::Remove),
            (Target, None, Invalid, PortAction::Remove),
        ];
        for (platform, subnet, mac, expected) in cases {
            assert_eq!(
                PortAction::decide(platform, subnet, mac),
                expected,
                "{platform:?} {subnet:?} {mac:?}"
            );
        }
    }

    struct Harness {
        api: Arc<FakeNodeApi>,
        control_plane: Arc<FakeControlPlane>,
        allocator: Arc<MasterSubnetAllocator>,
        controller: MasterController,
    }

    fn harness(log: &Logger, cidr: &str, host_subnet_length: u8) -> Harness {
        let api = FakeNodeApi::new();
        let control_plane = FakeControlPlane::new();
        let allocator = Arc::new(
            MasterSubnetAllocator::new(
                log,
                &[ClusterSubnet {
                    cidr: cidr.parse().unwrap(),
                    host_subnet_length,
                }],
                &[],
            )
            .unwrap(),
        );
        let controller = MasterController::new(
            log,
            api.clone(),
            Arc::clone(&allocator),
            control_plane.clone(),
            PlatformClassifier::default(),
        );
        Harness { api, control_plane, allocator, controller }
    }

    fn windows(name: &str) -> Node {
        Node::new(name).with_label("kubernetes.io/os", "windows")
    }

    #[tokio::test]
    async fn test_target_node_gets_subnet_then_port() {
        let logctx = test_setup_log("test_target_node_gets_subnet_then_port");
        let h = harness(&logctx.log, "10.132.0.0/14", 23);
        h.api.insert_node(windows("win1"));

        let node = h.api.node("win1").unwrap();
        h.controller.reconcile_node(&node).await.unwrap();
        let node = h.api.node("win1").unwrap();
        assert_eq!(node.annotation(EXTERNAL_SUBNET), Some("10.132.0.0/23"));
        assert_eq!(node.annotation(PORT_MAC), None);
        assert!(h.control_plane.calls().is_empty());

        // The update produced by recording the subnet provisions the port.
        h.controller.reconcile_node(&node).await.unwrap();
        let node = h.api.node("win1").unwrap();
        assert_eq!(node.annotation(PORT_MAC), Some("0a:58:0a:84:00:03"));
        assert_eq!(
            h.control_plane.port("int-win1"),
            Some(PortSpec {
                switch: String::from("win1"),
                name: String::from("int-win1"),
                mac: MacAddr6::new(0x0a, 0x58, 0x0a, 0x84, 0x00, 0x03),
                ip: "10.132.0.3".parse().unwrap(),
            })
        );
        assert_eq!(h.api.patch_count(), 2);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_provisioned_node_is_left_alone() {
        let logctx = test_setup_log("test_provisioned_node_is_left_alone");
        let h = harness(&logctx.log, "10.132.0.0/14", 23);
        let node = windows("win1")
            .with_annotation(EXTERNAL_SUBNET, "10.132.0.0/23")
            .with_annotation(PORT_MAC, "0a:58:0a:84:00:03");
        h.api.insert_node(node.clone());

        h.controller.reconcile_node(&node).await.unwrap();
        assert_eq!(h.api.patch_count(), 0);
        assert!(h.control_plane.calls().is_empty());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_native_node_mirrors_native_subnet() {
        let logctx = test_setup_log("test_native_node_mirrors_native_subnet");
        let h = harness(&logctx.log, "10.132.0.0/22", 23);
        let node = Node::new("linux1")
            .with_label("kubernetes.io/os", "linux")
            .with_annotation(NATIVE_SUBNET, "10.1.2.0/24");
        h.api.insert_node(node.clone());

        h.controller.reconcile_node(&node).await.unwrap();
        let node = h.api.node("linux1").unwrap();
        assert_eq!(node.annotation(EXTERNAL_SUBNET), Some("10.1.2.0/24"));
        assert!(h.control_plane.calls().is_empty());

        // Nothing was taken from the allocator.
        assert_eq!(h.allocator.allocate().unwrap(), net("10.132.0.0/23"));

        // Losing the native subnet removes the mirrored one.
        let mut node = node;
        node.annotations.remove(NATIVE_SUBNET);
        h.api.insert_node(node.clone());
        h.controller.reconcile_node(&node).await.unwrap();
        let node = h.api.node("linux1").unwrap();
        assert_eq!(node.annotation(EXTERNAL_SUBNET), None);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_failed_write_releases_subnet() {
        let logctx = test_setup_log("test_failed_write_releases_subnet");
        let h = harness(&logctx.log, "10.132.0.0/22", 23);
        let node = windows("win1");
        h.api.insert_node(node.clone());
        h.api.set_fail_patches(true);

        assert_matches!(
            h.controller.reconcile_node(&node).await,
            Err(ReconcileError::Annotate(_))
        );
        assert_eq!(h.allocator.allocate().unwrap(), net("10.132.0.0/23"));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_exhaustion_leaves_node_unchanged() {
        let logctx = test_setup_log("test_exhaustion_leaves_node_unchanged");
        let h = harness(&logctx.log, "10.132.0.0/23", 23);
        h.allocator.allocate().unwrap();
        let node = windows("win1");
        h.api.insert_node(node.clone());

        assert_matches!(
            h.controller.reconcile_node(&node).await,
            Err(ReconcileError::Allocate { err: AllocateError::Exhausted, .. })
        );
        assert_eq!(h.api.node("win1"), Some(node));
        assert_eq!(h.api.patch_count(), 0);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_port_failure_still_records_subnet() {
        let logctx = test_setup_log("test_port_failure_still_records_subnet");
        let h = harness(&logctx.log, "10.132.0.0/14", 23);
        let node =
            windows("win1").with_annotation(NATIVE_SUBNET, "10.1.2.0/24");
        h.api.insert_node(node.clone());
        h.control_plane.set_fail(true);

        h.controller.reconcile_node(&node).await.unwrap();
        let node = h.api.node("win1").unwrap();
        assert_eq!(node.annotation(EXTERNAL_SUBNET), Some("10.132.0.0/23"));
        assert_eq!(node.annotation(PORT_MAC), None);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_port_removed_without_subnet() {
        let logctx = test_setup_log("test_port_removed_without_subnet");
        let h = harness(&logctx.log, "10.132.0.0/23", 23);
        // Exhaust the pool so the node stays without a subnet.
        h.allocator.allocate().unwrap();
        let node =
            windows("win1").with_annotation(PORT_MAC, "0a:58:0a:84:00:03");
        h.api.insert_node(node.clone());

        // The port goes away even though no subnet could be allocated.
        assert_matches!(
            h.controller.reconcile_node(&node).await,
            Err(ReconcileError::Allocate { .. })
        );
        assert_eq!(
            h.control_plane.calls(),
            vec![ControlPlaneCall::Remove(String::from("int-win1"))]
        );
        let updated = h.api.node("win1").unwrap();
        assert_eq!(updated.annotation(PORT_MAC), None);
        assert_eq!(updated.annotation(EXTERNAL_SUBNET), None);

        // Later events keep failing to allocate but have nothing to remove.
        h.controller.reconcile_node(&updated).await.unwrap_err();
        assert_eq!(h.control_plane.calls().len(), 1);

        // A malformed subnet counts as no subnet.
        let node = node.with_annotation(EXTERNAL_SUBNET, "bogus");
        h.api.insert_node(node.clone());
        h.allocator.release(net("10.132.0.0/23")).unwrap();
        h.control_plane.set_fail(true);
        h.controller.reconcile_node(&node).await.unwrap();
        let updated = h.api.node("win1").unwrap();
        assert_eq!(updated.annotation(EXTERNAL_SUBNET), Some("10.132.0.0/23"));
        assert_eq!(updated.annotation(PORT_MAC), Some("0a:58:0a:84:00:03"));

        h.control_plane.set_fail(false);
        h.api.insert_node(node.clone());
        h.allocator.release(net("10.132.0.0/23")).unwrap();
        h.controller.reconcile_node(&node).await.unwrap();
        let updated = h.api.node("win1").unwrap();
        assert_eq!(updated.annotation(PORT_MAC), None);
        assert_eq!(
            h.control_plane.calls().last(),
            Some(&ControlPlaneCall::Remove(String::from("int-win1")))
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_resync_reads_current_node() {
        let logctx = test_setup_log("test_resync_reads_current_node");
        let h = harness(&logctx.log, "10.132.0.0/22", 23);
        h.api.insert_node(windows("win1"));

        h.controller.resync("win1").await;
        let node = h.api.node("win1").unwrap();
        assert_eq!(node.annotation(EXTERNAL_SUBNET), Some("10.132.0.0/23"));

        // The second pass sees the recorded subnet and only adds the port.
        h.controller.resync("win1").await;
        let node = h.api.node("win1").unwrap();
        assert_eq!(node.annotation(EXTERNAL_SUBNET), Some("10.132.0.0/23"));
        assert_eq!(node.annotation(PORT_MAC), Some("0a:58:0a:84:00:03"));
        assert_eq!(h.allocator.allocate().unwrap(), net("10.132.2.0/23"));

        // A node that no longer exists is left alone.
        h.controller.resync("gone").await;
        assert_eq!(h.api.patch_count(), 2);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_delete_releases_everything() {
        let logctx = test_setup_log("test_delete_releases_everything");
        let h = harness(&logctx.log, "10.132.0.0/22", 23);
        let subnet = h.allocator.allocate().unwrap();
        let node = windows("win1")
            .with_annotation(EXTERNAL_SUBNET, subnet.to_string())
            .with_annotation(PORT_MAC, "0a:58:0a:84:00:03");

        h.controller.delete(&node).await;
        assert_eq!(
            h.control_plane.calls(),
            vec![ControlPlaneCall::Remove(String::from("int-win1"))]
        );
        assert_eq!(h.allocator.allocate().unwrap(), subnet);

        // Deleting again finds nothing to release and is harmless.
        h.allocator.release(subnet).unwrap();
        h.controller.delete(&Node::new("linux1")).await;
        let gone =
            Node::new("gone").with_annotation(EXTERNAL_SUBNET, "10.9.0.0/23");
        h.controller.delete(&gone).await;
        assert_eq!(h.control_plane.calls().len(), 1);
        logctx.cleanup_successful();
    }
}
