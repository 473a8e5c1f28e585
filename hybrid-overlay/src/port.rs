// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Manager for the overlay ports that carry hybrid overlay traffic

use crate::nbctl::ExecutionError;
use crate::node::Node;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use macaddr::MacAddr6;
use slog::debug;
use slog::info;
use slog::o;
use slog::Logger;
use slog_error_chain::SlogInlineError;
use std::net::IpAddr;
use std::sync::Arc;

/// Prefix of every overlay port name.
pub const PORT_NAME_PREFIX: &str = "int-";

/// The overlay port name for node `node_name`.
pub fn port_name(node_name: &str) -> String {
    format!("{PORT_NAME_PREFIX}{node_name}")
}

/// The address of the overlay port within `subnet`.
///
/// The first two host addresses belong to the cluster router and management
/// ports, so the overlay port takes the third. Returns `None` if `subnet` has
/// no room for it.
pub fn port_ip(subnet: IpNetwork) -> Option<IpAddr> {
    let max_prefix = match subnet {
        IpNetwork::V4(_) => 29,
        IpNetwork::V6(_) => 126,
    };
    if subnet.prefix() > max_prefix {
        return None;
    }
    subnet.iter().nth(3)
}

/// The MAC address derived from an overlay port address: `0a:58` followed by
/// the last four octets of `ip`.
pub fn port_mac(ip: IpAddr) -> MacAddr6 {
    let o = match ip {
        IpAddr::V4(ip) => ip.octets(),
        IpAddr::V6(ip) => {
            let octets = ip.octets();
            [octets[12], octets[13], octets[14], octets[15]]
        }
    };
    MacAddr6::new(0x0a, 0x58, o[0], o[1], o[2], o[3])
}

/// Lower-case, colon-separated form of `mac`, as recorded on nodes and
/// ports.
pub fn mac_to_string(mac: MacAddr6) -> String {
    mac.as_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Everything needed to create one overlay port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortSpec {
    /// Logical switch the port is attached to.
    pub switch: String,
    pub name: String,
    pub mac: MacAddr6,
    pub ip: IpAddr,
}

/// Addresses currently recorded on an existing port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortAddresses {
    pub mac: Option<MacAddr6>,
    pub ip: Option<IpAddr>,
}

#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("failed to {op} port {port}")]
    Execution {
        op: &'static str,
        port: String,
        #[source]
        err: ExecutionError,
    },

    #[error("could not parse addresses of port {port}: {output:?}")]
    Addresses { port: String, output: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The network control plane that owns overlay ports.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Create the port if it does not already exist.
    async fn ensure_port(
        &self,
        port: &PortSpec,
    ) -> Result<(), ControlPlaneError>;

    /// Delete the port if it exists.
    async fn remove_port(&self, name: &str) -> Result<(), ControlPlaneError>;

    /// Look up the addresses of a port, or `None` if there is no such port.
    async fn port_addresses(
        &self,
        name: &str,
    ) -> Result<Option<PortAddresses>, ControlPlaneError>;
}

#[derive(Debug, thiserror::Error, SlogInlineError)]
pub enum PortError {
    #[error("subnet {0} has no room for an overlay port address")]
    SubnetTooSmall(IpNetwork),

    #[error("failed to look up overlay port {port}")]
    Lookup {
        port: String,
        #[source]
        err: ControlPlaneError,
    },

    #[error("failed to add overlay port {port} for node {node}")]
    Ensure {
        node: String,
        port: String,
        #[source]
        err: ControlPlaneError,
    },

    #[error("failed to remove overlay port {port}")]
    Remove {
        port: String,
        #[source]
        err: ControlPlaneError,
    },
}

/// Creates and removes the overlay port of each target-platform node.
#[derive(Clone)]
pub struct PortManager {
    log: Logger,
    control_plane: Arc<dyn ControlPlane>,
}

impl PortManager {
    pub fn new(log: &Logger, control_plane: Arc<dyn ControlPlane>) -> Self {
        Self { log: log.new(o!("component" => "PortManager")), control_plane }
    }

    /// Make sure `node` has an overlay port in `subnet`.
    ///
    /// Returns the MAC address to record on the node, or `None` if the node
    /// already records one. Nothing is returned unless the port exists on the
    /// control plane.
    pub async fn ensure_port(
        &self,
        node: &Node,
        subnet: IpNetwork,
    ) -> Result<Option<MacAddr6>, PortError> {
        if let Ok(Some(_)) = node.port_mac() {
            return Ok(None);
        }

        let name = port_name(&node.name);
        let ip = port_ip(subnet).ok_or(PortError::SubnetTooSmall(subnet))?;
        let existing = self
            .control_plane
            .port_addresses(&name)
            .await
            .map_err(|err| PortError::Lookup { port: name.clone(), err })?;
        let mac = match existing.and_then(|addrs| addrs.mac) {
            Some(mac) => {
                debug!(
                    self.log,
                    "reusing MAC of existing overlay port";
                    "port" => &name,
                    "mac" => %mac,
                );
                mac
            }
            None => port_mac(ip),
        };

        let spec =
            PortSpec { switch: node.name.clone(), name: name.clone(), mac, ip };
        self.control_plane.ensure_port(&spec).await.map_err(|err| {
            PortError::Ensure {
                node: node.name.clone(),
                port: name.clone(),
                err,
            }
        })?;
        info!(
            self.log,
            "ensured overlay port";
            "node" => &node.name,
            "port" => &name,
            "mac" => %mac,
            "ip" => %ip,
        );
        Ok(Some(mac))
    }

    /// Remove the overlay port of `node`, if it has one.
    pub async fn remove_port(&self, node: &Node) -> Result<(), PortError> {
        let name = port_name(&node.name);
        self.control_plane
            .remove_port(&name)
            .await
            .map_err(|err| PortError::Remove { port: name.clone(), err })?;
        info!(self.log, "removed overlay port"; "port" => &name);
        Ok(())
    }
}
