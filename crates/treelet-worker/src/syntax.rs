//! Java front-end.
//!
//! Source is parsed with tree-sitter and converted into a lossless treelet
//! tree: every tree-sitter leaf becomes a token node whose prefix holds the
//! bytes between it and the previous token, and the root keeps whatever
//! trails the last token as its suffix. Printing the result reproduces the
//! input exactly.
//!
//! Type declarations are interned by simple name in a process-wide
//! [`TypeRegistry`], so every connection and every file sees one handle per
//! type. Identifier tokens naming a known type carry that handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tree_sitter::Parser;
use treelet::{IdentityCache, NativeRef, Node, Tree, TypeInfo};

use crate::error::{Result, WorkerError};

/// Hands out worker handles for nodes and types. Never reuses a value.
pub struct NativeAllocator {
    next: AtomicU64,
}

impl Default for NativeAllocator {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl NativeAllocator {
    pub fn next(&self) -> NativeRef {
        NativeRef::new(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// A type declared in a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub kind: String,
    pub name: String,
    pub supertype: Option<String>,
}

/// Every type this worker process has reported, by name and by handle.
///
/// The first sighting of a name fixes its [`TypeInfo`]. A supertype that is
/// never declared is reported with kind `external`.
#[derive(Default)]
pub struct TypeRegistry {
    by_name: DashMap<String, NativeRef>,
    types: IdentityCache<TypeInfo>,
}

impl TypeRegistry {
    pub fn types(&self) -> &IdentityCache<TypeInfo> {
        &self.types
    }

    /// Known type handle for `name`, if one has been reported.
    pub fn lookup(&self, name: &str) -> Option<NativeRef> {
        let native = *self.by_name.get(name)?;
        self.types.contains(native).then_some(native)
    }

    pub fn get(&self, name: &str) -> Option<Arc<TypeInfo>> {
        self.lookup(name).and_then(|native| self.types.get(native))
    }

    /// Register a set of declarations seen together.
    ///
    /// Supertypes declared anywhere in the set resolve to their declaration
    /// regardless of order.
    pub fn declare(&self, declarations: &[Declaration], natives: &NativeAllocator) {
        for decl in declarations {
            let native = self.reserve(&decl.name, natives);
            let supertype = decl
                .supertype
                .as_deref()
                .map(|name| self.reserve(name, natives));
            self.types.resolve(native, || TypeInfo {
                native,
                kind: decl.kind.clone(),
                name: decl.name.clone(),
                supertype,
            });
        }

        for name in declarations.iter().filter_map(|d| d.supertype.as_deref()) {
            let native = self.reserve(name, natives);
            self.types.resolve(native, || {
                tracing::trace!(type_name = name, "Interning external supertype");
                TypeInfo {
                    native,
                    kind: "external".to_string(),
                    name: name.to_string(),
                    supertype: None,
                }
            });
        }
    }

    fn reserve(&self, name: &str, natives: &NativeAllocator) -> NativeRef {
        *self
            .by_name
            .entry(name.to_string())
            .or_insert_with(|| natives.next())
    }
}

/// A successfully parsed source file that has not been converted yet.
pub struct ParsedJava {
    path: String,
    source: String,
    tree: tree_sitter::Tree,
}

impl ParsedJava {
    /// Type declarations anywhere in the file, nested ones included.
    pub fn declarations(&self) -> Vec<Declaration> {
        let mut out = Vec::new();
        let src = self.source.as_bytes();
        let mut stack = vec![self.tree.root_node()];
        while let Some(node) = stack.pop() {
            if let Some(kind) = declaration_kind(node.kind())
                && let Some(name) = node.child_by_field_name("name")
                && let Ok(name) = name.utf8_text(src)
            {
                let supertype = node
                    .child_by_field_name("superclass")
                    .and_then(|s| supertype_name(s, src));
                out.push(Declaration {
                    kind: kind.to_string(),
                    name: name.to_string(),
                    supertype,
                });
            }
            let mut cursor = node.walk();
            let children: Vec<_> = node.named_children(&mut cursor).collect();
            stack.extend(children.into_iter().rev());
        }
        out
    }

    /// Build the lossless tree, stamping every node with a fresh handle.
    pub fn to_tree(&self, natives: &NativeAllocator, registry: &TypeRegistry) -> Result<Tree> {
        let mut builder = Builder {
            path: &self.path,
            source: &self.source,
            cursor: 0,
            natives,
            registry,
        };
        builder.root(self.tree.root_node())
    }
}

/// Parse `source`, rejecting it when tree-sitter had to recover from errors.
pub fn parse(path: impl Into<String>, source: impl Into<String>) -> Result<ParsedJava> {
    let path = path.into();
    let source = source.into();

    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_java::LANGUAGE.into())
        .map_err(|e| parse_error(&path, format!("failed to set language: {e}"), 0, 0))?;
    let tree = parser
        .parse(&source, None)
        .ok_or_else(|| parse_error(&path, "tree-sitter parse returned None", 0, 0))?;

    let root = tree.root_node();
    if root.has_error() {
        let (message, line, column) = first_error(root, source.as_bytes());
        return Err(parse_error(&path, message, line, column));
    }

    Ok(ParsedJava { path, source, tree })
}

struct Builder<'a> {
    path: &'a str,
    source: &'a str,
    cursor: usize,
    natives: &'a NativeAllocator,
    registry: &'a TypeRegistry,
}

impl<'a> Builder<'a> {
    fn root(&mut self, node: tree_sitter::Node) -> Result<Tree> {
        let children = self.children(node)?;
        let suffix = self.slice(self.cursor, self.source.len())?;
        Ok(Arc::new(
            Node::new(node.kind())
                .with_children(children)
                .with_suffix(suffix)
                .with_native(self.natives.next()),
        ))
    }

    fn interior(&self, node: tree_sitter::Node, children: Vec<Tree>) -> Tree {
        Arc::new(
            Node::new(node.kind())
                .with_children(children)
                .with_native(self.natives.next()),
        )
    }

    fn leaf(&mut self, node: tree_sitter::Node) -> Result<Tree> {
        let (start, end) = (node.start_byte(), node.end_byte());
        let prefix = self.slice(self.cursor, start)?;
        let text = self.slice(start, end)?;
        self.cursor = end;

        let mut leaf = Node::leaf(node.kind(), prefix, text);
        if matches!(node.kind(), "identifier" | "type_identifier") {
            leaf = leaf.with_type_ref(self.registry.lookup(text));
        }
        Ok(Arc::new(leaf.with_native(self.natives.next())))
    }

    /// Convert the children of `parent` in source order. The tree-sitter
    /// cursor does the descent, so deeply nested expressions cost heap, not
    /// stack.
    fn children(&mut self, parent: tree_sitter::Node) -> Result<Vec<Tree>> {
        let mut cursor = parent.walk();
        if !cursor.goto_first_child() {
            return Ok(Vec::new());
        }

        let mut top = Vec::new();
        // Interior nodes the cursor is inside, each with its converted children.
        let mut open: Vec<(tree_sitter::Node, Vec<Tree>)> = Vec::new();
        loop {
            let node = cursor.node();
            if cursor.goto_first_child() {
                open.push((node, Vec::new()));
                continue;
            }

            let mut done = self.leaf(node)?;
            loop {
                match open.last_mut() {
                    Some((_, siblings)) => siblings.push(done),
                    None => top.push(done),
                }
                if cursor.goto_next_sibling() {
                    break;
                }
                let Some((finished, children)) = open.pop() else {
                    return Ok(top);
                };
                cursor.goto_parent();
                done = self.interior(finished, children);
            }
        }
    }

    fn slice(&self, start: usize, end: usize) -> Result<&'a str> {
        self.source.get(start..end).ok_or_else(|| {
            parse_error(
                self.path,
                format!("token range {start}..{end} is not on a character boundary"),
                0,
                0,
            )
        })
    }
}

fn declaration_kind(kind: &str) -> Option<&'static str> {
    match kind {
        "class_declaration" => Some("class"),
        "interface_declaration" => Some("interface"),
        "enum_declaration" => Some("enum"),
        "record_declaration" => Some("record"),
        _ => None,
    }
}

/// Simple name of the type after `extends`: `Foo` for `Foo`, `Foo<T>`, and
/// `a.b.Foo`.
fn supertype_name(superclass: tree_sitter::Node, src: &[u8]) -> Option<String> {
    let ty = superclass.named_child(0)?;
    let name_node = match ty.kind() {
        "generic_type" => ty.named_child(0)?,
        _ => ty,
    };
    let text = name_node.utf8_text(src).ok()?;
    Some(text.rsplit('.').next().unwrap_or(text).to_string())
}

fn first_error(root: tree_sitter::Node, src: &[u8]) -> (String, usize, usize) {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_missing() {
            let pos = node.start_position();
            return (format!("missing '{}'", node.kind()), pos.row + 1, pos.column + 1);
        }
        if node.is_error() {
            let pos = node.start_position();
            let snippet: String = node
                .utf8_text(src)
                .unwrap_or("")
                .chars()
                .take(20)
                .collect();
            return (format!("unexpected '{snippet}'"), pos.row + 1, pos.column + 1);
        }
        if node.has_error() {
            let mut cursor = node.walk();
            let children: Vec<_> = node.children(&mut cursor).collect();
            stack.extend(children.into_iter().rev());
        }
    }
    ("syntax error".to_string(), 1, 1)
}

fn parse_error(path: &str, message: impl Into<String>, line: usize, column: usize) -> WorkerError {
    WorkerError::Parse {
        path: path.to_string(),
        message: message.into(),
        line,
        column,
    }
}
