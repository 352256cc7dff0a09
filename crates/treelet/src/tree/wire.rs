//! Wire form of a tree.
//!
//! A tree travels as a flat pre-order list of entries. A `node` entry carries
//! the node-local fields and the number of children that follow it; a `ref`
//! entry points back at a node already emitted in the same message, so
//! shared subtrees are serialized once. Types referenced by the nodes travel
//! alongside in a table, each exactly once per message.
//!
//! Decoding goes through the session's [`SessionCache`]: a node whose handle
//! is already cached is returned as the cached instance and its encoded
//! subtree is skipped without being decoded.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{NativeRef, Node, NodeId, Tree, TypeInfo};
use crate::error::{Error, Result};
use crate::identity::{IdentityCache, SessionCache};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTree {
    pub entries: Vec<WireEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<TypeInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum WireEntry {
    Node {
        id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        native: Option<NativeRef>,
        kind: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        prefix: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        suffix: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        type_ref: Option<NativeRef>,
        #[serde(default)]
        arity: u32,
    },
    Ref {
        id: NodeId,
    },
}

/// Serialize a tree.
///
/// With a type source, every type the nodes reference (and the supertypes
/// those reach) is written into the type table. A referenced type missing
/// from the source is an error: the receiving side could never resolve it.
pub fn encode(tree: &Tree, types: Option<&IdentityCache<TypeInfo>>) -> Result<WireTree> {
    let mut encoder = Encoder {
        entries: Vec::new(),
        seen: HashSet::new(),
        type_refs: Vec::new(),
        seen_types: HashSet::new(),
    };
    encoder.push(tree)?;

    let types = match types {
        Some(source) => encoder.type_table(source)?,
        None => Vec::new(),
    };

    tracing::trace!(
        entries = encoder.entries.len(),
        types = types.len(),
        "Encoded tree"
    );

    Ok(WireTree {
        entries: encoder.entries,
        types,
    })
}

/// Deserialize a tree, resolving every handle through `cache`.
pub fn decode(wire: &WireTree, cache: &SessionCache) -> Result<Tree> {
    for ty in &wire.types {
        cache.types.resolve(ty.native, || ty.clone());
    }

    let mut decoder = Decoder {
        entries: &wire.entries,
        pos: 0,
        by_id: HashMap::new(),
        nodes: &cache.nodes,
    };
    let root = decoder.node()?;
    if decoder.pos != wire.entries.len() {
        return Err(Error::protocol(format!(
            "tree has {} trailing entries",
            wire.entries.len() - decoder.pos
        )));
    }
    Ok(root)
}

struct Encoder {
    entries: Vec<WireEntry>,
    seen: HashSet<NodeId>,
    type_refs: Vec<NativeRef>,
    seen_types: HashSet<NativeRef>,
}

impl Encoder {
    fn push(&mut self, tree: &Tree) -> Result<()> {
        let mut stack = vec![tree];
        while let Some(node) = stack.pop() {
            if !self.seen.insert(node.id()) {
                self.entries.push(WireEntry::Ref { id: node.id() });
                continue;
            }

            if let Some(type_ref) = node.type_ref() {
                self.note_type(type_ref);
            }

            let arity = u32::try_from(node.children().len()).map_err(|_| {
                Error::protocol(format!("node {} has too many children", node.id()))
            })?;

            self.entries.push(WireEntry::Node {
                id: node.id(),
                native: node.native(),
                kind: node.kind().to_string(),
                prefix: node.prefix().to_string(),
                text: node.text().map(str::to_string),
                suffix: node.suffix().to_string(),
                type_ref: node.type_ref(),
                arity,
            });
            stack.extend(node.children().iter().rev());
        }
        Ok(())
    }

    fn note_type(&mut self, native: NativeRef) {
        if self.seen_types.insert(native) {
            self.type_refs.push(native);
        }
    }

    fn type_table(&mut self, source: &IdentityCache<TypeInfo>) -> Result<Vec<TypeInfo>> {
        let mut table = Vec::with_capacity(self.type_refs.len());
        let mut queue: VecDeque<NativeRef> = self.type_refs.drain(..).collect();

        while let Some(native) = queue.pop_front() {
            let ty = source
                .get(native)
                .ok_or_else(|| Error::protocol(format!("unknown type {}", native)))?;
            if let Some(supertype) = ty.supertype
                && self.seen_types.insert(supertype)
            {
                queue.push_back(supertype);
            }
            table.push(ty.as_ref().clone());
        }
        Ok(table)
    }
}

struct Decoder<'a> {
    entries: &'a [WireEntry],
    pos: usize,
    by_id: HashMap<NodeId, Tree>,
    nodes: &'a IdentityCache<Node>,
}

/// A node entry whose children are still being decoded.
struct Pending<'a> {
    id: NodeId,
    native: Option<NativeRef>,
    kind: &'a str,
    prefix: &'a str,
    text: Option<&'a str>,
    suffix: &'a str,
    type_ref: Option<NativeRef>,
    arity: usize,
    children: Vec<Tree>,
}

impl<'a> Decoder<'a> {
    fn next_entry(&mut self) -> Result<&'a WireEntry> {
        let entry = self
            .entries
            .get(self.pos)
            .ok_or_else(|| Error::protocol("tree entries end mid-node"))?;
        self.pos += 1;
        Ok(entry)
    }

    /// Decode one subtree. Ancestors waiting for children sit on an explicit
    /// stack, so nesting depth is bounded by memory only.
    fn node(&mut self) -> Result<Tree> {
        let mut open: Vec<Pending<'a>> = Vec::new();
        loop {
            let mut done = match self.next_entry()? {
                WireEntry::Ref { id } => self
                    .by_id
                    .get(id)
                    .cloned()
                    .ok_or_else(|| Error::protocol(format!("dangling node reference {}", id)))?,
                WireEntry::Node {
                    id,
                    native,
                    kind,
                    prefix,
                    text,
                    suffix,
                    type_ref,
                    arity,
                } => {
                    if let Some(native) = native
                        && let Some(cached) = self.nodes.get(*native)
                    {
                        self.skip(*arity)?;
                        self.register(&cached);
                        cached
                    } else {
                        // Every child takes at least one entry.
                        let arity = *arity as usize;
                        let remaining = self.entries.len() - self.pos;
                        if arity > remaining {
                            return Err(Error::protocol(format!(
                                "node {id} claims {arity} children but only {remaining} entries follow"
                            )));
                        }
                        let pending = Pending {
                            id: *id,
                            native: *native,
                            kind,
                            prefix,
                            text: text.as_deref(),
                            suffix,
                            type_ref: *type_ref,
                            arity,
                            children: Vec::with_capacity(arity),
                        };
                        if arity > 0 {
                            open.push(pending);
                            continue;
                        }
                        self.build(pending)
                    }
                }
            };

            loop {
                let Some(mut parent) = open.pop() else {
                    return Ok(done);
                };
                parent.children.push(done);
                if parent.children.len() < parent.arity {
                    open.push(parent);
                    break;
                }
                done = self.build(parent);
            }
        }
    }

    fn build(&mut self, pending: Pending<'a>) -> Tree {
        let Pending {
            id,
            native,
            kind,
            prefix,
            text,
            suffix,
            type_ref,
            children,
            ..
        } = pending;
        let build = || {
            Node::from_parts(
                id,
                native,
                kind.to_string(),
                prefix.to_string(),
                text.map(str::to_string),
                children,
                suffix.to_string(),
                type_ref,
            )
        };
        let tree = match native {
            Some(native) => self.nodes.resolve(native, build),
            None => Arc::new(build()),
        };
        self.by_id.insert(id, Arc::clone(&tree));
        tree
    }

    /// Step over `count` encoded subtrees without building them.
    fn skip(&mut self, count: u32) -> Result<()> {
        let mut remaining = count as usize;
        while remaining > 0 {
            remaining -= 1;
            if let WireEntry::Node { arity, .. } = self.next_entry()? {
                remaining += *arity as usize;
            }
        }
        Ok(())
    }

    /// Make every node of a cached subtree addressable by later backreferences.
    fn register(&mut self, tree: &Tree) {
        super::walk(tree, &mut |node| {
            self.by_id
                .entry(node.id())
                .or_insert_with(|| Arc::clone(node));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(kind: &str, prefix: &str, text: &str) -> Tree {
        Arc::new(Node::leaf(kind, prefix, text))
    }

    fn sample() -> Tree {
        Arc::new(
            Node::new("source")
                .with_children(vec![
                    leaf("keyword", "", "class"),
                    leaf("ident", " ", "Foo"),
                    Arc::new(Node::new("block").with_children(vec![
                        leaf("punct", "  ", "{"),
                        leaf("punct", "\n", "}"),
                    ])),
                ])
                .with_suffix("\n"),
        )
    }

    #[test]
    fn round_trip_reprints_identically() {
        let tree = sample();
        let wire = encode(&tree, None).unwrap();
        let json = serde_json::to_string(&wire).unwrap();
        let back: WireTree = serde_json::from_str(&json).unwrap();

        let decoded = decode(&back, &SessionCache::new()).unwrap();
        assert_eq!(decoded.print(), "class Foo  {\n}\n");
        assert_eq!(*decoded, *tree);
    }

    #[test]
    fn shared_subtree_is_encoded_once() {
        let shared = leaf("ident", " ", "x");
        let tree = Arc::new(Node::new("pair").with_children(vec![
            Arc::clone(&shared),
            Arc::clone(&shared),
        ]));

        let wire = encode(&tree, None).unwrap();
        assert_eq!(wire.entries.len(), 3);
        assert_eq!(wire.entries[2], WireEntry::Ref { id: shared.id() });

        let decoded = decode(&wire, &SessionCache::new()).unwrap();
        assert!(Arc::ptr_eq(&decoded.children()[0], &decoded.children()[1]));
        assert_eq!(decoded.print(), " x x");
    }

    #[test]
    fn node_entry_shape() {
        let id = NodeId(uuid::Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap());
        let entry = WireEntry::Node {
            id,
            native: Some(NativeRef::new(12)),
            kind: "ident".to_string(),
            prefix: " ".to_string(),
            text: Some("Foo".to_string()),
            suffix: String::new(),
            type_ref: Some(NativeRef::new(3)),
            arity: 0,
        };
        insta::assert_json_snapshot!(entry, @r#"
        {
          "t": "node",
          "id": "550e8400-e29b-41d4-a716-446655440000",
          "native": 12,
          "kind": "ident",
          "prefix": " ",
          "text": "Foo",
          "type_ref": 3,
          "arity": 0
        }
        "#);
    }

    #[test]
    fn cached_handles_decode_to_cached_instances() {
        let cache = SessionCache::new();
        let tree = Arc::new(
            Node::new("source")
                .with_children(vec![Arc::new(
                    Node::leaf("ident", "", "Foo").with_native(NativeRef::new(2)),
                )])
                .with_native(NativeRef::new(1)),
        );
        let wire = encode(&tree, None).unwrap();

        let first = decode(&wire, &cache).unwrap();
        let second = decode(&wire, &cache).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(
            &first.children()[0],
            &cache.nodes.get(NativeRef::new(2)).unwrap()
        ));
    }

    #[test]
    fn backreference_into_skipped_subtree_resolves() {
        let cache = SessionCache::new();
        let inner = Arc::new(Node::leaf("ident", "", "x").with_native(NativeRef::new(11)));
        let left = Arc::new(
            Node::new("group")
                .with_children(vec![Arc::clone(&inner)])
                .with_native(NativeRef::new(10)),
        );
        let warm = encode(&left, None).unwrap();
        decode(&warm, &cache).unwrap();

        // `left` is cached now, so its entries get skipped; the trailing ref
        // to `inner` must still resolve.
        let tree = Arc::new(Node::new("pair").with_children(vec![Arc::clone(&left), inner]));
        let wire = encode(&tree, None).unwrap();
        let decoded = decode(&wire, &cache).unwrap();
        assert!(Arc::ptr_eq(
            &decoded.children()[0].children()[0],
            &decoded.children()[1]
        ));
    }

    #[test]
    fn type_table_includes_supertypes_once() {
        let types = IdentityCache::new();
        let base = TypeInfo {
            native: NativeRef::new(1),
            kind: "class".into(),
            name: "Base".into(),
            supertype: None,
        };
        let derived = TypeInfo {
            native: NativeRef::new(2),
            kind: "class".into(),
            name: "Derived".into(),
            supertype: Some(NativeRef::new(1)),
        };
        types.insert(base.native, Arc::new(base.clone()));
        types.insert(derived.native, Arc::new(derived.clone()));

        let tree = Arc::new(Node::new("source").with_children(vec![
            Arc::new(Node::leaf("ident", "", "Derived").with_type_ref(Some(NativeRef::new(2)))),
            Arc::new(Node::leaf("ident", " ", "Base").with_type_ref(Some(NativeRef::new(1)))),
        ]));

        let wire = encode(&tree, Some(&types)).unwrap();
        assert_eq!(wire.types, vec![derived, base]);

        let cache = SessionCache::new();
        decode(&wire, &cache).unwrap();
        assert_eq!(cache.types.len(), 2);
    }

    #[test]
    fn unknown_type_fails_encoding() {
        let types = IdentityCache::new();
        let tree = Arc::new(Node::leaf("ident", "", "X").with_type_ref(Some(NativeRef::new(4))));
        assert!(matches!(encode(&tree, Some(&types)), Err(Error::Protocol(_))));
    }

    #[test]
    fn dangling_reference_is_protocol_error() {
        let wire = WireTree {
            entries: vec![WireEntry::Ref { id: NodeId::new() }],
            types: Vec::new(),
        };
        let err = decode(&wire, &SessionCache::new()).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn truncated_entries_are_protocol_error() {
        let mut wire = encode(&sample(), None).unwrap();
        wire.entries.pop();
        assert!(matches!(
            decode(&wire, &SessionCache::new()),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn trailing_entries_are_protocol_error() {
        let mut wire = encode(&leaf("ident", "", "a"), None).unwrap();
        wire.entries.extend(encode(&leaf("ident", "", "b"), None).unwrap().entries);
        assert!(matches!(
            decode(&wire, &SessionCache::new()),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn oversized_arity_is_protocol_error() {
        let wire = WireTree {
            entries: vec![WireEntry::Node {
                id: NodeId::new(),
                native: None,
                kind: "block".to_string(),
                prefix: String::new(),
                text: None,
                suffix: String::new(),
                type_ref: None,
                arity: u32::MAX,
            }],
            types: Vec::new(),
        };
        let err = decode(&wire, &SessionCache::new()).unwrap_err();
        assert!(
            matches!(err, Error::Protocol(ref msg) if msg.contains("children")),
            "{err:?}"
        );
    }

    #[test]
    fn deep_chain_survives_encode_and_decode_on_a_small_stack() {
        std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(|| {
                let depth = 5_000;
                let mut tree = Arc::new(Node::leaf("ident", "", "x").with_native(NativeRef::new(0)));
                for level in 1..=depth {
                    tree = Arc::new(
                        Node::new("paren")
                            .with_prefix("(")
                            .with_children(vec![tree])
                            .with_suffix(")")
                            .with_native(NativeRef::new(level)),
                    );
                }

                let wire = encode(&tree, None).unwrap();
                assert_eq!(wire.entries.len(), depth as usize + 1);

                let cache = SessionCache::new();
                let first = decode(&wire, &cache).unwrap();
                assert_eq!(first.print(), tree.print());
                let second = decode(&wire, &cache).unwrap();
                assert!(Arc::ptr_eq(&first, &second));
            })
            .unwrap()
            .join()
            .unwrap();
    }
}
