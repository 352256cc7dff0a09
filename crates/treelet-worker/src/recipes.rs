//! Built-in recipes.
//!
//! A recipe is a pure tree-to-tree function. Everything it leaves alone comes
//! back as the same `Arc`, so untouched nodes keep their worker handles and
//! the host sees them as the identical objects it sent.

use std::collections::BTreeMap;

use serde_json::Value;
use treelet::Tree;
use treelet::tree::rewrite;

use crate::error::{Result, WorkerError};

pub trait Recipe: Send + Sync {
    fn name(&self) -> &'static str;

    fn visit(&self, tree: &Tree) -> Tree;
}

/// Build a recipe by name, validating its options.
pub fn instantiate(name: &str, options: &BTreeMap<String, Value>) -> Result<Box<dyn Recipe>> {
    match name {
        Spaces::NAME => {
            reject_unknown(name, options, &[])?;
            Ok(Box::new(Spaces))
        }
        RenameIdentifier::NAME => {
            reject_unknown(name, options, &["from", "to"])?;
            let from = required_identifier(name, options, "from")?;
            let to = required_identifier(name, options, "to")?;
            Ok(Box::new(RenameIdentifier { from, to }))
        }
        other => Err(WorkerError::UnknownRecipe(other.to_string())),
    }
}

/// Collapses runs of spaces and tabs inside a line to a single space.
/// Indentation (any whitespace containing a line break) is left alone.
pub struct Spaces;

impl Spaces {
    pub const NAME: &'static str = "format.Spaces";
}

impl Recipe for Spaces {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn visit(&self, tree: &Tree) -> Tree {
        rewrite(tree, &mut |node| {
            let prefix = node.prefix();
            let collapsible = prefix.len() > 1 && prefix.bytes().all(|b| b == b' ' || b == b'\t');
            collapsible.then(|| node.as_ref().clone().with_prefix(" "))
        })
    }
}

/// Renames every identifier token spelled `from`.
pub struct RenameIdentifier {
    from: String,
    to: String,
}

impl RenameIdentifier {
    pub const NAME: &'static str = "rename.Identifier";
}

impl Recipe for RenameIdentifier {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn visit(&self, tree: &Tree) -> Tree {
        rewrite(tree, &mut |node| {
            let is_identifier = matches!(node.kind(), "identifier" | "type_identifier");
            (is_identifier && node.text() == Some(self.from.as_str()))
                .then(|| node.as_ref().clone().with_text(self.to.clone()))
        })
    }
}

fn reject_unknown(recipe: &str, options: &BTreeMap<String, Value>, known: &[&str]) -> Result<()> {
    match options.keys().find(|k| !known.contains(&k.as_str())) {
        Some(unknown) => Err(WorkerError::InvalidOptions {
            recipe: recipe.to_string(),
            reason: format!("unknown option '{unknown}'"),
        }),
        None => Ok(()),
    }
}

fn required_identifier(
    recipe: &str,
    options: &BTreeMap<String, Value>,
    key: &str,
) -> Result<String> {
    let invalid = |reason: String| WorkerError::InvalidOptions {
        recipe: recipe.to_string(),
        reason,
    };
    let value = options
        .get(key)
        .ok_or_else(|| invalid(format!("missing required option '{key}'")))?;
    let text = value
        .as_str()
        .ok_or_else(|| invalid(format!("option '{key}' must be a string")))?;
    if !is_java_identifier(text) {
        return Err(invalid(format!("'{text}' is not a valid identifier")));
    }
    Ok(text.to_string())
}

fn is_java_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}
