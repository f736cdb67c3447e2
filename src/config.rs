//! Configuration types for MCProxy bridges.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    0
}

/// Configuration for a single bridged child process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChildConfig {
    /// Stable identifier used to key this child in the `BridgeSet` and in
    /// log fields. Must be unique within a config.
    pub id: String,

    /// Human-friendly display name. Falls back to `id` if empty.
    #[serde(default)]
    pub name: String,

    /// Whether this child should be started. Disabled children are parsed
    /// and validated but never spawned.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Executable token: absolute path, relative path, or a bare name to be
    /// resolved against PATH and the fallback directory list.
    pub command: String,

    /// Arguments passed to the child verbatim.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables overlaid on top of the inherited environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory for the child. Supports a leading `~`.
    #[serde(default)]
    pub cwd: Option<String>,

    /// Host interface the Mini-Server binds to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Desired TCP port. `0` means "let the OS choose an ephemeral port".
    /// Any other value below 1024 is rejected at start time.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Optional bearer token clients must present to be served.
    #[serde(default)]
    pub bearer_token: Option<String>,

    /// Tool list to skip discovery with. When empty, Tool Discovery runs
    /// automatically once the child is `Running`.
    #[serde(default)]
    pub tools: Vec<ToolInfo>,

    /// Tool names to hide from `active tools` projections even if the child
    /// advertises them.
    #[serde(default)]
    pub disabled_tools: BTreeSet<String>,
}

/// A flattened tool description, as produced by Tool Discovery or supplied
/// ahead of time to skip discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Parameter name -> flattened JSON schema type ("string", "number",
    /// "boolean", "object", "array", or "any" for anything unrecognized).
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl ChildConfig {
    /// Effective display name: `name` if set, otherwise `id`.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Validates this child's configuration in isolation (no knowledge of
    /// sibling children — duplicate id checking happens at the set level).
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(BridgeError::InvalidConfig(
                self.id.clone(),
                "id must not be empty".to_string(),
            ));
        }
        if self.command.trim().is_empty() {
            return Err(BridgeError::InvalidConfig(
                self.id.clone(),
                "command must not be empty".to_string(),
            ));
        }
        if self.port != 0 && self.port < 1024 {
            return Err(BridgeError::PortRestricted(self.id.clone(), self.port));
        }
        if self.host.trim().is_empty() {
            return Err(BridgeError::InvalidConfig(
                self.id.clone(),
                "host must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// A set of children to run together, as loaded from a config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeSetConfig {
    #[serde(default)]
    pub children: Vec<ChildConfig>,
}

impl BridgeSetConfig {
    /// Validates every child and rejects duplicate ids across the set.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for child in &self.children {
            child.validate()?;
            if !seen.insert(child.id.clone()) {
                return Err(BridgeError::DuplicateId(child.id.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_child(id: &str) -> ChildConfig {
        ChildConfig {
            id: id.to_string(),
            name: String::new(),
            enabled: true,
            command: "echo".to_string(),
            args: vec![],
            env: BTreeMap::new(),
            cwd: None,
            host: default_host(),
            port: 0,
            bearer_token: None,
            tools: vec![],
            disabled_tools: BTreeSet::new(),
        }
    }

    #[test]
    fn test_display_name_falls_back_to_id() {
        let child = base_child("gh");
        assert_eq!(child.display_name(), "gh");
    }

    #[test]
    fn test_display_name_prefers_name() {
        let mut child = base_child("gh");
        child.name = "GitHub".to_string();
        assert_eq!(child.display_name(), "GitHub");
    }

    #[test]
    fn test_validate_empty_command_rejected() {
        let mut child = base_child("gh");
        child.command = "   ".to_string();
        assert!(matches!(
            child.validate(),
            Err(BridgeError::InvalidConfig(_, _))
        ));
    }

    #[test]
    fn test_validate_restricted_port_rejected() {
        let mut child = base_child("gh");
        child.port = 80;
        assert!(matches!(
            child.validate(),
            Err(BridgeError::PortRestricted(_, 80))
        ));
    }

    #[test]
    fn test_validate_ephemeral_port_allowed() {
        let child = base_child("gh");
        assert!(child.validate().is_ok());
    }

    #[test]
    fn test_validate_unrestricted_port_allowed() {
        let mut child = base_child("gh");
        child.port = 8080;
        assert!(child.validate().is_ok());
    }

    #[test]
    fn test_set_rejects_duplicate_ids() {
        let set = BridgeSetConfig {
            children: vec![base_child("gh"), base_child("gh")],
        };
        assert!(matches!(set.validate(), Err(BridgeError::DuplicateId(_))));
    }

    #[test]
    fn test_set_accepts_unique_ids() {
        let set = BridgeSetConfig {
            children: vec![base_child("gh"), base_child("slack")],
        };
        assert!(set.validate().is_ok());
    }

    #[test]
    fn test_parse_from_toml() {
        let toml_src = r#"
            [[children]]
            id = "gh"
            command = "gh-mcp"
            args = ["--stdio"]
            port = 8900
        "#;
        let parsed: BridgeSetConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(parsed.children.len(), 1);
        assert_eq!(parsed.children[0].id, "gh");
        assert_eq!(parsed.children[0].port, 8900);
        assert!(parsed.children[0].enabled);
    }
}
