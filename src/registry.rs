//! BridgeSet — the single public entry point for running a whole config's
//! worth of bridges at once.
//!
//! `BridgeSet` validates the config, spawns one `BridgeInstance` per
//! enabled child, aggregates status and active-client projections, and
//! shuts every child down together.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{BridgeSetConfig, ChildConfig, ToolInfo};
use crate::error::Result;
use crate::observability::ObservabilityHooks;
use crate::orchestrator::{self, BridgeInstance, BridgeStatus};

/// A running set of bridges, one per configured child.
pub struct BridgeSet {
    instances: BTreeMap<String, Arc<BridgeInstance>>,
    pub hooks: Arc<ObservabilityHooks>,
}

impl BridgeSet {
    /// Validates `config` and spawns every enabled child's bridge. Children
    /// that fail to start are left in their `Error` state rather than
    /// aborting the whole set — one bad child must not prevent its
    /// siblings from serving traffic.
    pub async fn from_config(config: BridgeSetConfig) -> Result<Self> {
        config.validate()?;

        let hooks = Arc::new(ObservabilityHooks::new());
        let mut instances = BTreeMap::new();

        for child in config.children {
            let id = child.id.clone();
            let instance = Arc::new(BridgeInstance::new(child, hooks.clone()));
            match orchestrator::start(instance.clone()).await {
                Ok(()) => info!(child = %id, "bridge started"),
                Err(e) => warn!(child = %id, error = %e, "bridge failed to start"),
            }
            instances.insert(id, instance);
        }

        Ok(Self { instances, hooks })
    }

    pub fn child_ids(&self) -> Vec<String> {
        self.instances.keys().cloned().collect()
    }

    pub async fn status(&self, id: &str) -> Option<BridgeStatus> {
        match self.instances.get(id) {
            Some(instance) => Some(instance.status().await),
            None => None,
        }
    }

    pub async fn all_statuses(&self) -> BTreeMap<String, BridgeStatus> {
        let mut out = BTreeMap::new();
        for (id, instance) in &self.instances {
            out.insert(id.clone(), instance.status().await);
        }
        out
    }

    pub async fn active_clients(&self, id: &str) -> Option<Vec<String>> {
        match self.instances.get(id) {
            Some(instance) => Some(instance.active_client_names().await),
            None => None,
        }
    }

    pub async fn port(&self, id: &str) -> Option<u16> {
        let instance = self.instances.get(id)?;
        *instance.port.read().await
    }

    pub fn config_for(&self, id: &str) -> Option<ChildConfig> {
        self.instances.get(id).map(|i| i.config.clone())
    }

    /// Stops every bridge in the set.
    pub async fn shutdown(&self) {
        for (id, instance) in &self.instances {
            info!(child = %id, "shutting down bridge");
            orchestrator::stop(instance).await;
        }
    }

    pub fn instance(&self, id: &str) -> Option<Arc<BridgeInstance>> {
        self.instances.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn child(id: &str, command: &str) -> ChildConfig {
        ChildConfig {
            id: id.to_string(),
            name: String::new(),
            enabled: true,
            command: command.to_string(),
            args: vec![],
            env: Default::default(),
            cwd: None,
            host: "127.0.0.1".to_string(),
            port: 0,
            bearer_token: None,
            tools: vec![ToolInfo {
                name: "noop".to_string(),
                description: String::new(),
                params: Default::default(),
            }],
            disabled_tools: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn test_from_config_rejects_duplicate_ids() {
        let config = BridgeSetConfig {
            children: vec![child("gh", "cat"), child("gh", "cat")],
        };
        let result = BridgeSet::from_config(config).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_from_config_starts_all_children() {
        let config = BridgeSetConfig {
            children: vec![child("gh", "cat"), child("slack", "cat")],
        };
        let set = BridgeSet::from_config(config).await.unwrap();
        let statuses = set.all_statuses().await;
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses.get("gh"), Some(&BridgeStatus::Running));
        assert_eq!(statuses.get("slack"), Some(&BridgeStatus::Running));
        set.shutdown().await;
    }

    #[tokio::test]
    async fn test_one_failing_child_does_not_block_others() {
        let mut bad = child("bad", "/no/such/binary");
        bad.enabled = true;
        let config = BridgeSetConfig {
            children: vec![bad, child("good", "cat")],
        };
        let set = BridgeSet::from_config(config).await.unwrap();
        assert_eq!(set.status("bad").await, Some(BridgeStatus::Error));
        assert_eq!(set.status("good").await, Some(BridgeStatus::Running));
        set.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_of_unknown_child_is_none() {
        let config = BridgeSetConfig { children: vec![] };
        let set = BridgeSet::from_config(config).await.unwrap();
        assert_eq!(set.status("ghost").await, None);
    }
}
