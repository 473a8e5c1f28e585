// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Batched updates to a node's annotations

use crate::node::Node;
use crate::node::NodeApi;
use crate::node::NodeApiError;
use slog::debug;
use slog::o;
use slog::Logger;
use slog_error_chain::SlogInlineError;
use std::collections::BTreeMap;

/// Invoked with the node, key and value of a write that was not persisted.
pub type FailureHandler = Box<dyn FnOnce(&Node, &str, &str) + Send>;

enum Change {
    Set { value: String, on_failure: Option<FailureHandler> },
    Delete,
}

#[derive(Debug, thiserror::Error, SlogInlineError)]
#[error("failed to update annotations on node {node}")]
pub struct AnnotatorError {
    node: String,
    #[source]
    err: NodeApiError,
}

/// Stages annotation changes for one node and applies them in a single
/// update.
///
/// A value staged with [`NodeAnnotator::set_with_failure_handler`] carries a
/// handler that runs only if the update fails. This is how a resource backing
/// the value (such as an allocated subnet) gets returned when the value could
/// not be recorded.
pub struct NodeAnnotator<'a> {
    log: Logger,
    api: &'a dyn NodeApi,
    node: &'a Node,
    changes: BTreeMap<String, Change>,
}

impl<'a> NodeAnnotator<'a> {
    pub fn new(log: &Logger, api: &'a dyn NodeApi, node: &'a Node) -> Self {
        Self {
            log: log.new(o!("node" => node.name.clone())),
            api,
            node,
            changes: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.stage(key, Change::Set { value: value.into(), on_failure: None });
    }

    pub fn set_with_failure_handler<F>(
        &mut self,
        key: &str,
        value: impl Into<String>,
        on_failure: F,
    ) where
        F: FnOnce(&Node, &str, &str) + Send + 'static,
    {
        self.stage(
            key,
            Change::Set {
                value: value.into(),
                on_failure: Some(Box::new(on_failure)),
            },
        );
    }

    pub fn del(&mut self, key: &str) {
        self.stage(key, Change::Delete);
    }

    // A change that replaces an earlier one for the same key means the earlier
    // value will never be written, so its failure handler runs now.
    fn stage(&mut self, key: &str, change: Change) {
        if let Some(Change::Set { value, on_failure: Some(on_failure) }) =
            self.changes.insert(key.to_string(), change)
        {
            on_failure(self.node, key, &value);
        }
    }

    /// Apply all staged changes.
    ///
    /// Changes that would leave the node as it is are dropped, and nothing is
    /// sent if no change remains.
    pub async fn run(self) -> Result<(), AnnotatorError> {
        let mut patch = BTreeMap::new();
        let mut handlers = Vec::new();
        for (key, change) in self.changes {
            match change {
                Change::Set { value, on_failure } => {
                    if self.node.annotation(&key) == Some(value.as_str()) {
                        continue;
                    }
                    if let Some(on_failure) = on_failure {
                        handlers.push((key.clone(), value.clone(), on_failure));
                    }
                    patch.insert(key, Some(value));
                }
                Change::Delete => {
                    if self.node.annotations.contains_key(&key) {
                        patch.insert(key, None);
                    }
                }
            }
        }

        if patch.is_empty() {
            return Ok(());
        }

        debug!(self.log, "updating node annotations"; "changes" => ?patch);
        match self.api.patch_node_annotations(&self.node.name, &patch).await {
            Ok(()) => Ok(()),
            Err(err) => {
                for (key, value, on_failure) in handlers {
                    on_failure(self.node, &key, &value);
                }
                Err(AnnotatorError { node: self.node.name.clone(), err })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fakes::FakeNodeApi;
    use hybrid_overlay_test_utils::dev::test_setup_log;
    use std::sync::Arc;
    use std::sync::Mutex;

    type Failures = Arc<Mutex<Vec<(String, String, String)>>>;

    fn record(
        failures: &Failures,
    ) -> impl FnOnce(&Node, &str, &str) + Send + 'static {
        let failures = Arc::clone(failures);
        move |node: &Node, key: &str, value: &str| {
            failures.lock().unwrap().push((
                node.name.clone(),
                key.to_string(),
                value.to_string(),
            ));
        }
    }

    #[tokio::test]
    async fn test_run_applies_changes() {
        let logctx = test_setup_log("test_run_applies_changes");
        let node = Node::new("n1")
            .with_annotation("stale", "x")
            .with_annotation("keep", "y");
        let api = FakeNodeApi::new();
        api.insert_node(node.clone());

        let mut annotator = NodeAnnotator::new(&logctx.log, &*api, &node);
        annotator.set("new", "z");
        annotator.del("stale");
        annotator.run().await.unwrap();

        assert_eq!(api.patch_count(), 1);
        let updated = api.node("n1").unwrap();
        assert_eq!(updated.annotation("new"), Some("z"));
        assert_eq!(updated.annotation("stale"), None);
        assert_eq!(updated.annotation("keep"), Some("y"));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_noop_changes_are_not_sent() {
        let logctx = test_setup_log("test_noop_changes_are_not_sent");
        let node = Node::new("n1").with_annotation("a", "1");
        let api = FakeNodeApi::new();
        api.insert_node(node.clone());

        let mut annotator = NodeAnnotator::new(&logctx.log, &*api, &node);
        annotator.set("a", "1");
        annotator.del("absent");
        annotator.run().await.unwrap();

        NodeAnnotator::new(&logctx.log, &*api, &node).run().await.unwrap();
        assert_eq!(api.patch_count(), 0);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_failure_handler_runs_only_on_failure() {
        let logctx =
            test_setup_log("test_failure_handler_runs_only_on_failure");
        let node = Node::new("n1");
        let api = FakeNodeApi::new();
        api.insert_node(node.clone());
        let failures = Failures::default();

        let mut annotator = NodeAnnotator::new(&logctx.log, &*api, &node);
        annotator.set_with_failure_handler("a", "1", record(&failures));
        annotator.run().await.unwrap();
        assert!(failures.lock().unwrap().is_empty());

        api.set_fail_patches(true);
        let mut annotator = NodeAnnotator::new(&logctx.log, &*api, &node);
        annotator.set_with_failure_handler("b", "2", record(&failures));
        annotator.set("c", "3");
        annotator.run().await.unwrap_err();
        assert_eq!(
            *failures.lock().unwrap(),
            vec![(String::from("n1"), String::from("b"), String::from("2"))]
        );
        assert_eq!(api.node("n1").unwrap().annotation("b"), None);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_replaced_value_runs_failure_handler() {
        let logctx = test_setup_log("test_replaced_value_runs_failure_handler");
        let node = Node::new("n1");
        let api = FakeNodeApi::new();
        api.insert_node(node.clone());
        let failures = Failures::default();

        let mut annotator = NodeAnnotator::new(&logctx.log, &*api, &node);
        annotator.set_with_failure_handler("a", "1", record(&failures));
        annotator.set("a", "2");
        assert_eq!(failures.lock().unwrap().len(), 1);

        annotator.run().await.unwrap();
        assert_eq!(api.node("n1").unwrap().annotation("a"), Some("2"));
        assert_eq!(failures.lock().unwrap().len(), 1);
        logctx.cleanup_successful();
    }
}
