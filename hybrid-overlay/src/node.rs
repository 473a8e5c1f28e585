// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster nodes as seen by the hybrid overlay, and the API used to update
//! their annotations

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use ipnetwork::IpNetworkError;
use macaddr::MacAddr6;
use serde::Deserialize;
use serde::Serialize;
use slog_error_chain::SlogInlineError;
use std::collections::BTreeMap;

/// The host subnet assigned to a node by the hybrid overlay.
pub const EXTERNAL_SUBNET: &str = "external-subnet";

/// The host subnet assigned to a node by the native overlay's own IPAM.
pub const NATIVE_SUBNET: &str = "native-subnet";

/// MAC address of the node's overlay port, present once the port exists.
pub const PORT_MAC: &str = "port-mac";

/// A cluster member: its name, labels and annotations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn with_label(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Parse the subnet stored under annotation `key`.
    ///
    /// Returns `Ok(None)` if the annotation is absent. The returned network is
    /// normalized, so `10.0.0.7/24` yields `10.0.0.0/24`.
    pub fn subnet_annotation(
        &self,
        key: &str,
    ) -> Result<Option<IpNetwork>, AnnotationParseError> {
        let Some(value) = self.annotation(key) else {
            return Ok(None);
        };
        let to_err = |err| AnnotationParseError::Subnet {
            node: self.name.clone(),
            key: key.to_string(),
            value: value.to_string(),
            err,
        };
        let net: IpNetwork = value.parse().map_err(to_err)?;
        IpNetwork::new(net.network(), net.prefix()).map(Some).map_err(to_err)
    }

    /// Parse the overlay port MAC annotation, if any.
    pub fn port_mac(&self) -> Result<Option<MacAddr6>, AnnotationParseError> {
        let Some(value) = self.annotation(PORT_MAC) else {
            return Ok(None);
        };
        value.parse().map(Some).map_err(|err| AnnotationParseError::Mac {
            node: self.name.clone(),
            value: value.to_string(),
            err,
        })
    }
}

#[derive(Debug, thiserror::Error, SlogInlineError)]
pub enum AnnotationParseError {
    #[error("node {node} annotation {key} has invalid subnet {value:?}")]
    Subnet {
        node: String,
        key: String,
        value: String,
        #[source]
        err: IpNetworkError,
    },

    #[error("node {node} has invalid overlay port MAC {value:?}")]
    Mac {
        node: String,
        value: String,
        #[source]
        err: macaddr::ParseError,
    },
}

/// Which side of the hybrid overlay a node lives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    /// The node cannot join the native overlay; the hybrid overlay allocates
    /// its subnet and provisions its overlay port.
    Target,
    /// The node is a member of the native overlay.
    Native,
}

/// Classifies nodes by the value of a single label.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct PlatformClassifier {
    /// Label consulted on each node.
    pub label: String,
    /// Label value identifying a target-platform node.
    pub target: String,
}

impl Default for PlatformClassifier {
    fn default() -> Self {
        Self {
            label: String::from("kubernetes.io/os"),
            target: String::from("windows"),
        }
    }
}

impl PlatformClassifier {
    /// Nodes without the label are treated as native.
    pub fn classify(&self, node: &Node) -> Platform {
        match node.labels.get(&self.label) {
            Some(value) if *value == self.target => Platform::Target,
            _ => Platform::Native,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NodeApiError {
    #[error("node {0} not found")]
    NotFound(String),

    #[error("failed to update node {node}: {message}")]
    Update { node: String, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The cluster API as used by the hybrid overlay.
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// Fetch the current state of node `node_name`, or `None` if it no
    /// longer exists.
    async fn get_node(
        &self,
        node_name: &str,
    ) -> Result<Option<Node>, NodeApiError>;

    /// Apply `changes` to the annotations of node `node_name` in a single
    /// update. A `None` value removes the annotation.
    async fn patch_node_annotations(
        &self,
        node_name: &str,
        changes: &BTreeMap<String, Option<String>>,
    ) -> Result<(), NodeApiError>;
}
