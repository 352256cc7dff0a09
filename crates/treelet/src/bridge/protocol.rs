//! Wire protocol types for host-worker communication.
//!
//! Every connection starts with the worker sending a `ready` greeting. After
//! that the host writes one [`RequestFrame`] and reads exactly one
//! [`ResponseFrame`] back; frames never interleave on a connection.
//!
//! Version 1 commands:
//! - `install-recipes`: resolve a recipe package, list its recipes
//! - `load-recipe`: instantiate a recipe with options, get an id
//! - `run-recipe-visitor`: run a loaded recipe over a tree
//! - `parse-batch`: parse `(path, text)` pairs under a project root
//! - `print`: print a tree with the worker's printer
//! - `shutdown`: acknowledge, then exit the worker process

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::RemoteFailure;
use crate::tree::wire::WireTree;

/// A command the host can send.
///
/// The payload is the `Serialize` impl of the implementing type; the worker
/// answers with an `Output`.
pub trait Command: Serialize {
    const NAME: &'static str;
    type Output: DeserializeOwned;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub command: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFrame {
    /// First frame on every connection.
    Ready {
        protocol_version: u32,
        worker: WorkerInfo,
    },

    Ok {
        #[serde(default)]
        result: serde_json::Value,
    },

    Error(RemoteFailure),
}

/// Identity of the worker process announced in the greeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub name: String,
    pub version: String,
    /// Fresh per worker process; recipe ids are only valid for one instance.
    pub instance: uuid::Uuid,
}

impl WorkerInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            instance: uuid::Uuid::new_v4(),
        }
    }
}

/// Execution context as it travels with a command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextPayload {
    pub id: uuid::Uuid,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub data: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallRecipes {
    pub package: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    pub ctx: ContextPayload,
}

impl Command for InstallRecipes {
    const NAME: &'static str = "install-recipes";
    type Output = RecipePackage;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipePackage {
    pub name: String,
    pub version: String,
    pub recipes: Vec<RecipeDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeDescriptor {
    pub name: String,
    pub display_name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<OptionDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionDescriptor {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadRecipe {
    pub name: String,
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl Command for LoadRecipe {
    const NAME: &'static str = "load-recipe";
    type Output = LoadedRecipe;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedRecipe {
    pub recipe_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecipe {
    pub recipe_id: u32,
    pub tree: WireTree,
}

impl Command for RunRecipe {
    const NAME: &'static str = "run-recipe-visitor";
    type Output = TreeResult;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeResult {
    pub tree: WireTree,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceText {
    pub path: PathBuf,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseBatch {
    pub root: PathBuf,
    pub inputs: Vec<SourceText>,
    pub ctx: ContextPayload,
}

impl Command for ParseBatch {
    const NAME: &'static str = "parse-batch";
    type Output = ParsedBatch;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedBatch {
    pub results: Vec<ParsedItem>,
}

/// Outcome for one input: a tree, or the failure that prevented one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedItem {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree: Option<WireTree>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintTree {
    pub tree: WireTree,
}

impl Command for PrintTree {
    const NAME: &'static str = "print";
    type Output = Printed;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Printed {
    pub text: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Shutdown;

impl Command for Shutdown {
    const NAME: &'static str = "shutdown";
    type Output = ();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_instance() -> uuid::Uuid {
        uuid::Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap()
    }

    #[test]
    fn ready_serializes() {
        let resp = ResponseFrame::Ready {
            protocol_version: 1,
            worker: WorkerInfo {
                name: "treelet-worker".to_string(),
                version: "0.3.0".to_string(),
                instance: test_instance(),
            },
        };
        insta::assert_json_snapshot!(resp, @r#"
        {
          "type": "ready",
          "protocol_version": 1,
          "worker": {
            "name": "treelet-worker",
            "version": "0.3.0",
            "instance": "550e8400-e29b-41d4-a716-446655440000"
          }
        }
        "#);
    }

    #[test]
    fn ok_serializes() {
        let resp = ResponseFrame::Ok {
            result: json!({"recipe_id": 3}),
        };
        insta::assert_json_snapshot!(resp, @r#"
        {
          "type": "ok",
          "result": {
            "recipe_id": 3
          }
        }
        "#);
    }

    #[test]
    fn error_serializes() {
        let resp = ResponseFrame::Error(RemoteFailure {
            message: "no recipe named 'format.Tabs'".to_string(),
            trace: Some("load-recipe".to_string()),
        });
        insta::assert_json_snapshot!(resp, @r#"
        {
          "type": "error",
          "message": "no recipe named 'format.Tabs'",
          "trace": "load-recipe"
        }
        "#);
    }

    #[test]
    fn load_recipe_request_serializes() {
        let payload = LoadRecipe {
            name: "format.Spaces".to_string(),
            options: BTreeMap::new(),
        };
        let frame = RequestFrame {
            command: LoadRecipe::NAME.to_string(),
            payload: serde_json::to_value(&payload).unwrap(),
        };
        insta::assert_json_snapshot!(frame, @r#"
        {
          "command": "load-recipe",
          "payload": {
            "name": "format.Spaces",
            "options": {}
          }
        }
        "#);
    }

    #[test]
    fn shutdown_payload_is_null() {
        assert_eq!(serde_json::to_value(Shutdown).unwrap(), serde_json::Value::Null);
        let (): () = serde_json::from_value(serde_json::Value::Null).unwrap();
    }

    #[test]
    fn parsed_item_carries_either_tree_or_error() {
        let item: ParsedItem = serde_json::from_value(json!({
            "path": "src/Broken.tw",
            "error": {"message": "unclosed '{'"}
        }))
        .unwrap();
        assert!(item.tree.is_none());
        assert_eq!(item.error.unwrap().message, "unclosed '{'");
    }

    #[test]
    fn request_without_payload_defaults_to_null() {
        let frame: RequestFrame = serde_json::from_str(r#"{"command":"shutdown"}"#).unwrap();
        assert_eq!(frame.command, "shutdown");
        assert!(frame.payload.is_null());
    }
}
