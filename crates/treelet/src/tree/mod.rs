//! Uniform tree abstraction shared by host and worker.
//!
//! Nodes are immutable and reference-counted. Formatting metadata (the
//! whitespace before a node and trailing text after its children) is stored
//! explicitly, so printing a tree that was never modified reproduces its
//! source byte for byte.
//!
//! Two identities coexist:
//! - [`NodeId`]: the logical identity of a node, preserved by `with_*` edits.
//! - [`NativeRef`]: the handle of one immutable object inside the worker's
//!   graph. Edited nodes drop it, so an edit can never alias a worker object.

pub mod wire;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Logical node identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(uuid::Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle emitted by the worker for a node, type, or symbol.
///
/// Only meaningful as a cache key: equal values denote the same worker-side
/// entity for the lifetime of one analysis session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NativeRef(u64);

impl NativeRef {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for NativeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Semantic type attribution reported by the worker.
///
/// Types point at each other by [`NativeRef`] rather than by owning
/// pointers, so cyclic type graphs need no special handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfo {
    pub native: NativeRef,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supertype: Option<NativeRef>,
}

pub type Tree = Arc<Node>;

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    id: NodeId,
    native: Option<NativeRef>,
    kind: String,
    prefix: String,
    text: Option<String>,
    children: Vec<Tree>,
    suffix: String,
    type_ref: Option<NativeRef>,
}

impl Node {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(),
            native: None,
            kind: kind.into(),
            prefix: String::new(),
            text: None,
            children: Vec::new(),
            suffix: String::new(),
            type_ref: None,
        }
    }

    /// A token node: leading whitespace plus the token text.
    pub fn leaf(kind: impl Into<String>, prefix: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(kind).with_prefix(prefix).with_text(text)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        id: NodeId,
        native: Option<NativeRef>,
        kind: String,
        prefix: String,
        text: Option<String>,
        children: Vec<Tree>,
        suffix: String,
        type_ref: Option<NativeRef>,
    ) -> Self {
        Self {
            id,
            native,
            kind,
            prefix,
            text,
            children,
            suffix,
            type_ref,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn native(&self) -> Option<NativeRef> {
        self.native
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn children(&self) -> &[Tree] {
        &self.children
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn type_ref(&self) -> Option<NativeRef> {
        self.type_ref
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self.native = None;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self.native = None;
        self
    }

    pub fn with_children(mut self, children: Vec<Tree>) -> Self {
        self.children = children;
        self.native = None;
        self
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self.native = None;
        self
    }

    pub fn with_type_ref(mut self, type_ref: Option<NativeRef>) -> Self {
        self.type_ref = type_ref;
        self.native = None;
        self
    }

    /// Stamp the node with the worker handle it was created under.
    ///
    /// Only workers call this; host-side edits never carry a handle.
    pub fn with_native(mut self, native: NativeRef) -> Self {
        self.native = Some(native);
        self
    }

    pub fn print(&self) -> String {
        let mut out = String::new();
        self.print_to(&mut out);
        out
    }

    fn print_to(&self, out: &mut String) {
        enum Step<'t> {
            Enter(&'t Node),
            Suffix(&'t str),
        }

        let mut steps = vec![Step::Enter(self)];
        while let Some(step) = steps.pop() {
            match step {
                Step::Enter(node) => {
                    out.push_str(&node.prefix);
                    if let Some(ref text) = node.text {
                        out.push_str(text);
                    }
                    steps.push(Step::Suffix(&node.suffix));
                    steps.extend(node.children.iter().rev().map(|c| Step::Enter(c.as_ref())));
                }
                Step::Suffix(suffix) => out.push_str(suffix),
            }
        }
    }
}

// Deep trees would otherwise be torn down one stack frame per level.
impl Drop for Node {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.children);
        while let Some(child) = pending.pop() {
            if let Ok(mut node) = Arc::try_unwrap(child) {
                pending.append(&mut node.children);
            }
        }
    }
}

/// Visit every node in pre-order, including repeated visits of shared subtrees.
pub fn walk<F: FnMut(&Tree)>(tree: &Tree, f: &mut F) {
    let mut stack = vec![tree];
    while let Some(node) = stack.pop() {
        f(node);
        stack.extend(node.children().iter().rev());
    }
}

/// Rebuild a tree bottom-up, sharing every subtree that did not change.
///
/// `f` sees each node after its children were rewritten and returns a
/// replacement, or `None` to keep it. Unchanged subtrees come back as the
/// same `Arc`, so `Arc::ptr_eq(&before, &after)` means nothing changed.
pub fn rewrite<F>(tree: &Tree, f: &mut F) -> Tree
where
    F: FnMut(&Tree) -> Option<Node>,
{
    struct Frame<'t> {
        node: &'t Tree,
        children: Vec<Tree>,
    }

    impl<'t> Frame<'t> {
        fn new(node: &'t Tree) -> Self {
            Self {
                node,
                children: Vec::with_capacity(node.children().len()),
            }
        }
    }

    let mut stack = vec![Frame::new(tree)];
    let mut result = None;
    while let Some(frame) = stack.last_mut() {
        let node = frame.node;
        if let Some(child) = node.children().get(frame.children.len()) {
            stack.push(Frame::new(child));
            continue;
        }

        let Some(Frame { node, children }) = stack.pop() else {
            break;
        };
        let out = rebuild(node, children, f);
        match stack.last_mut() {
            Some(parent) => parent.children.push(out),
            None => result = Some(out),
        }
    }
    result.unwrap_or_else(|| Arc::clone(tree))
}

fn rebuild<F>(node: &Tree, children: Vec<Tree>, f: &mut F) -> Tree
where
    F: FnMut(&Tree) -> Option<Node>,
{
    let children_changed = children
        .iter()
        .zip(node.children())
        .any(|(new, old)| !Arc::ptr_eq(new, old));

    let current = if children_changed {
        Arc::new(node.as_ref().clone().with_children(children))
    } else {
        Arc::clone(node)
    };

    match f(&current) {
        Some(replacement) => Arc::new(replacement),
        None => current,
    }
}
