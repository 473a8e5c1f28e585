// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory implementations of [`NodeApi`] and [`ControlPlane`] for tests

use crate::node::Node;
use crate::node::NodeApi;
use crate::node::NodeApiError;
use crate::port::ControlPlane;
use crate::port::ControlPlaneError;
use crate::port::PortAddresses;
use crate::port::PortSpec;
use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

#[derive(Default)]
struct FakeNodeApiInner {
    nodes: BTreeMap<String, Node>,
    patches: usize,
    fail_patches: bool,
}

/// A cluster API holding nodes in memory.
#[derive(Default)]
pub struct FakeNodeApi {
    inner: Mutex<FakeNodeApiInner>,
}

impl FakeNodeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_node(&self, node: Node) {
        self.inner.lock().unwrap().nodes.insert(node.name.clone(), node);
    }

    pub fn remove_node(&self, name: &str) -> Option<Node> {
        self.inner.lock().unwrap().nodes.remove(name)
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.inner.lock().unwrap().nodes.get(name).cloned()
    }

    /// Number of updates that were applied.
    pub fn patch_count(&self) -> usize {
        self.inner.lock().unwrap().patches
    }

    /// Make every subsequent update fail without changing anything.
    pub fn set_fail_patches(&self, fail: bool) {
        self.inner.lock().unwrap().fail_patches = fail;
    }
}

#[async_trait]
impl NodeApi for FakeNodeApi {
    async fn get_node(
        &self,
        node_name: &str,
    ) -> Result<Option<Node>, NodeApiError> {
        Ok(self.node(node_name))
    }

    async fn patch_node_annotations(
        &self,
        node_name: &str,
        changes: &BTreeMap<String, Option<String>>,
    ) -> Result<(), NodeApiError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_patches {
            return Err(NodeApiError::Update {
                node: node_name.to_string(),
                message: String::from("injected failure"),
            });
        }
        let node = inner
            .nodes
            .get_mut(node_name)
            .ok_or_else(|| NodeApiError::NotFound(node_name.to_string()))?;
        for (key, value) in changes {
            match value {
                Some(value) => {
                    node.annotations.insert(key.clone(), value.clone());
                }
                None => {
                    node.annotations.remove(key);
                }
            }
        }
        inner.patches += 1;
        Ok(())
    }
}

/// A request made of a [`FakeControlPlane`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlPlaneCall {
    Lookup(String),
    Ensure(PortSpec),
    Remove(String),
}

#[derive(Default)]
struct FakeControlPlaneInner {
    ports: BTreeMap<String, PortSpec>,
    calls: Vec<ControlPlaneCall>,
    fail: bool,
}

/// A control plane holding ports in memory and recording every request.
#[derive(Default)]
pub struct FakeControlPlane {
    inner: Mutex<FakeControlPlaneInner>,
}

impl FakeControlPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<ControlPlaneCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn port(&self, name: &str) -> Option<PortSpec> {
        self.inner.lock().unwrap().ports.get(name).cloned()
    }

    pub fn ports(&self) -> Vec<PortSpec> {
        self.inner.lock().unwrap().ports.values().cloned().collect()
    }

    pub fn insert_port(&self, port: PortSpec) {
        self.inner.lock().unwrap().ports.insert(port.name.clone(), port);
    }

    /// Make every subsequent request fail.
    pub fn set_fail(&self, fail: bool) {
        self.inner.lock().unwrap().fail = fail;
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn ensure_port(
        &self,
        port: &PortSpec,
    ) -> Result<(), ControlPlaneError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(ControlPlaneCall::Ensure(port.clone()));
        if inner.fail {
            return Err(anyhow!("injected failure adding {}", port.name).into());
        }
        inner.ports.insert(port.name.clone(), port.clone());
        Ok(())
    }

    async fn remove_port(&self, name: &str) -> Result<(), ControlPlaneError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(ControlPlaneCall::Remove(name.to_string()));
        if inner.fail {
            return Err(anyhow!("injected failure removing {name}").into());
        }
        inner.ports.remove(name);
        Ok(())
    }

    async fn port_addresses(
        &self,
        name: &str,
    ) -> Result<Option<PortAddresses>, ControlPlaneError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(ControlPlaneCall::Lookup(name.to_string()));
        if inner.fail {
            return Err(anyhow!("injected failure looking up {name}").into());
        }
        Ok(inner.ports.get(name).map(|port| PortAddresses {
            mac: Some(port.mac),
            ip: Some(port.ip),
        }))
    }
}
