//! Command dispatcher: the typed operations a host runs against a worker.
//!
//! A [`Dispatcher`] owns one [`Session`]. Everything it returns (trees,
//! types) is resolved through that session's identity caches, so the same
//! worker entity always comes back as the same `Arc`.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bridge::protocol::{
    ContextPayload, InstallRecipes, LoadRecipe, ParseBatch, ParsedItem, PrintTree,
    RecipePackage, RunRecipe, SourceText,
};
use crate::bridge::session::Session;
use crate::config::DEFAULT_PARSE_BATCH_SIZE;
use crate::error::{Error, RemoteFailure, Result};
use crate::tree::wire;
use crate::tree::{NativeRef, Node, Tree, TypeInfo};

/// Correlates a unit of work: travels with install and parse commands and
/// collects per-input failures.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    id: uuid::Uuid,
    data: serde_json::Map<String, serde_json::Value>,
    errors: Vec<InputFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFailure {
    pub path: PathBuf,
    pub failure: RemoteFailure,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            data: serde_json::Map::new(),
            errors: Vec::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    pub fn data(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.data
    }

    pub fn errors(&self) -> &[InputFailure] {
        &self.errors
    }

    pub fn take_errors(&mut self) -> Vec<InputFailure> {
        std::mem::take(&mut self.errors)
    }

    fn payload(&self) -> ContextPayload {
        ContextPayload {
            id: self.id,
            data: self.data.clone(),
        }
    }

    fn record(&mut self, path: PathBuf, failure: RemoteFailure) {
        self.errors.push(InputFailure { path, failure });
    }
}

/// One source file to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInput {
    pub path: PathBuf,
    pub text: String,
}

impl SourceInput {
    pub fn new(path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            text: text.into(),
        }
    }

    pub async fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let text = tokio::fs::read_to_string(&path).await?;
        Ok(Self { path, text })
    }
}

#[derive(Debug, Clone)]
pub struct ParsedSource {
    /// Path as the worker reported it, relative to the project root.
    pub path: PathBuf,
    pub tree: Tree,
}

/// A recipe instantiated on one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeHandle {
    id: u32,
    name: String,
    worker: uuid::Uuid,
}

impl RecipeHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone)]
pub struct RecipeRun {
    pub tree: Tree,
    pub changed: bool,
}

pub struct Dispatcher {
    session: Session,
    batch_size: usize,
}

impl Dispatcher {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            batch_size: DEFAULT_PARSE_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Resolve a recipe package on the worker and list what it contains.
    /// Nothing is loaded.
    pub async fn install_recipe_package(
        &mut self,
        package: &str,
        version: &str,
        sources: &[String],
        ctx: &ExecutionContext,
    ) -> Result<RecipePackage> {
        let installed = self
            .session
            .send(&InstallRecipes {
                package: package.to_string(),
                version: version.to_string(),
                sources: sources.to_vec(),
                ctx: ctx.payload(),
            })
            .await?;
        tracing::info!(
            package = %installed.name,
            version = %installed.version,
            recipes = installed.recipes.len(),
            "Recipe package installed"
        );
        Ok(installed)
    }

    pub async fn load_recipe(
        &mut self,
        name: &str,
        options: BTreeMap<String, serde_json::Value>,
    ) -> Result<RecipeHandle> {
        let loaded = self
            .session
            .send(&LoadRecipe {
                name: name.to_string(),
                options,
            })
            .await
            .map_err(|e| match e {
                Error::RemoteExecution(failure) => {
                    Error::RecipeLoad(format!("{name}: {}", failure.message))
                }
                other => other,
            })?;
        tracing::debug!(recipe = name, recipe_id = loaded.recipe_id, "Recipe loaded");
        Ok(RecipeHandle {
            id: loaded.recipe_id,
            name: name.to_string(),
            worker: self.session.worker().instance,
        })
    }

    /// Run a loaded recipe over `tree`.
    ///
    /// The result is unchanged when it is the very same root (the worker
    /// handed back untouched nodes) or prints identically.
    pub async fn run_recipe(&mut self, handle: &RecipeHandle, tree: &Tree) -> Result<RecipeRun> {
        if handle.worker != self.session.worker().instance {
            return Err(Error::RecipeLoad(format!(
                "recipe {} was loaded on another worker instance",
                handle.name
            )));
        }

        let result = self
            .session
            .send(&RunRecipe {
                recipe_id: handle.id,
                tree: wire::encode(tree, None)?,
            })
            .await?;
        let out = self.session.decode_tree(&result.tree)?;

        let changed = !Arc::ptr_eq(&out, tree) && out.print() != tree.print();
        tracing::debug!(recipe = %handle.name, recipe_id = handle.id, changed, "Recipe ran");
        Ok(RecipeRun { tree: out, changed })
    }

    pub async fn load_and_run(
        &mut self,
        name: &str,
        options: BTreeMap<String, serde_json::Value>,
        tree: &Tree,
    ) -> Result<RecipeRun> {
        let handle = self.load_recipe(name, options).await?;
        self.run_recipe(&handle, tree).await
    }

    /// Parse `inputs` lazily, one batch per worker round trip.
    pub fn parse_inputs<'a>(
        &'a mut self,
        inputs: Vec<SourceInput>,
        root: impl Into<PathBuf>,
        ctx: &'a mut ExecutionContext,
    ) -> ParseStream<'a> {
        ParseStream {
            dispatcher: self,
            ctx,
            root: root.into(),
            pending: inputs.into_iter(),
            ready: VecDeque::new(),
            done: false,
        }
    }

    /// Print a tree with the worker's own printer.
    pub async fn print(&mut self, tree: &Tree) -> Result<String> {
        let printed = self
            .session
            .send(&PrintTree {
                tree: wire::encode(tree, None)?,
            })
            .await?;
        Ok(printed.text)
    }

    pub fn type_of(&self, node: &Node) -> Option<Arc<TypeInfo>> {
        node.type_ref().and_then(|r| self.resolve_type(r))
    }

    pub fn resolve_type(&self, native: NativeRef) -> Option<Arc<TypeInfo>> {
        self.session.cache().types.get(native)
    }

    /// The type and its supertypes, nearest first, as far as they are known.
    pub fn supertypes(&self, ty: &TypeInfo) -> Vec<Arc<TypeInfo>> {
        let mut chain = Vec::new();
        let mut next = ty.supertype;
        while let Some(native) = next {
            let Some(found) = self.resolve_type(native) else {
                break;
            };
            if chain.iter().any(|t: &Arc<TypeInfo>| t.native == found.native) {
                break;
            }
            next = found.supertype;
            chain.push(found);
        }
        chain
    }

    pub async fn close(self) -> Result<()> {
        self.session.close().await
    }
}

/// Lazy, single-pass sequence of parse results.
///
/// The next batch is requested only once everything from the previous one
/// has been consumed. A file that fails to parse yields
/// [`Error::RemoteExecution`] and the stream goes on; a transport failure
/// yields one error and ends it.
pub struct ParseStream<'a> {
    dispatcher: &'a mut Dispatcher,
    ctx: &'a mut ExecutionContext,
    root: PathBuf,
    pending: std::vec::IntoIter<SourceInput>,
    ready: VecDeque<Result<ParsedSource>>,
    done: bool,
}

impl ParseStream<'_> {
    pub async fn next(&mut self) -> Option<Result<ParsedSource>> {
        loop {
            if let Some(item) = self.ready.pop_front() {
                return Some(item);
            }
            if self.done {
                return None;
            }
            let batch: Vec<SourceInput> = self
                .pending
                .by_ref()
                .take(self.dispatcher.batch_size)
                .collect();
            if batch.is_empty() {
                self.done = true;
                return None;
            }
            self.fetch(batch).await;
        }
    }

    /// Inputs not yet yielded.
    pub fn remaining(&self) -> usize {
        self.pending.len() + self.ready.len()
    }

    async fn fetch(&mut self, batch: Vec<SourceInput>) {
        let inputs: Vec<SourceText> = batch
            .into_iter()
            .map(|input| SourceText {
                path: relative_to(&self.root, &input.path),
                text: input.text,
            })
            .collect();
        let paths: Vec<PathBuf> = inputs.iter().map(|i| i.path.clone()).collect();
        tracing::debug!(files = inputs.len(), root = %self.root.display(), "Parsing batch");

        let command = ParseBatch {
            root: self.root.clone(),
            inputs,
            ctx: self.ctx.payload(),
        };
        match self.dispatcher.session.send(&command).await {
            Ok(parsed) => {
                for item in parsed.results {
                    let result = self.accept(item);
                    let fatal = matches!(result, Err(ref e) if e.is_fatal_to_session());
                    self.ready.push_back(result);
                    if fatal {
                        self.done = true;
                        break;
                    }
                }
            }
            Err(Error::RemoteExecution(failure)) => {
                tracing::warn!(error = %failure.message, "Worker rejected parse batch");
                for path in paths {
                    self.ctx.record(path, failure.clone());
                    self.ready
                        .push_back(Err(Error::RemoteExecution(failure.clone())));
                }
            }
            Err(e) => {
                self.done = true;
                self.ready.push_back(Err(e));
            }
        }
    }

    fn accept(&mut self, item: ParsedItem) -> Result<ParsedSource> {
        match (item.tree, item.error) {
            (_, Some(failure)) => {
                tracing::warn!(path = %item.path.display(), error = %failure.message, "Failed to parse");
                self.ctx.record(item.path, failure.clone());
                Err(Error::RemoteExecution(failure))
            }
            (Some(tree), None) => {
                let tree = self.dispatcher.session.decode_tree(&tree)?;
                Ok(ParsedSource {
                    path: item.path,
                    tree,
                })
            }
            (None, None) => Err(Error::protocol(format!(
                "worker returned neither a tree nor an error for {}",
                item.path.display()
            ))),
        }
    }
}

fn relative_to(root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(root).unwrap_or(path).to_path_buf()
}
