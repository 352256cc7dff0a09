//! Command handling for the Java worker.
//!
//! Loaded recipes and reported types live for the whole process and are
//! shared by every connection. Node handles are registered per connection,
//! so a tree the host sends back decodes to the very nodes this worker
//! produced for it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use treelet::bridge::protocol::{
    InstallRecipes, LoadRecipe, LoadedRecipe, ParseBatch, ParsedBatch, ParsedItem, PrintTree,
    Printed, RunRecipe, TreeResult,
};
use treelet::tree::{rewrite, walk, wire};
use treelet::{RemoteFailure, SessionCache, Tree, WorkerHandler};

use crate::error::{Result, WorkerError};
use crate::manifest::Installation;
use crate::recipes::{self, Recipe};
use crate::syntax::{self, NativeAllocator, TypeRegistry};

pub struct JavaWorker {
    install: Installation,
    natives: NativeAllocator,
    types: TypeRegistry,
    recipes: DashMap<u32, Arc<dyn Recipe>>,
    next_recipe: AtomicU32,
}

impl JavaWorker {
    pub fn new(install: Installation) -> Self {
        Self {
            install,
            natives: NativeAllocator::default(),
            types: TypeRegistry::default(),
            recipes: DashMap::new(),
            next_recipe: AtomicU32::new(1),
        }
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    fn install_recipes(&self, request: InstallRecipes) -> Result<treelet::RecipePackage> {
        let catalog = self.install.catalog_with(&request.sources)?;
        let package = catalog.find(&request.package, &request.version)?.clone();
        tracing::info!(
            package = %package.name,
            version = %package.version,
            ctx = %request.ctx.id,
            "Installed recipe package"
        );
        Ok(package)
    }

    fn load_recipe(&self, request: LoadRecipe) -> Result<LoadedRecipe> {
        let recipe: Arc<dyn Recipe> =
            recipes::instantiate(&request.name, &request.options)?.into();
        let recipe_id = self.next_recipe.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(recipe = recipe.name(), recipe_id, "Loaded recipe");
        self.recipes.insert(recipe_id, recipe);
        Ok(LoadedRecipe { recipe_id })
    }

    fn run_recipe(&self, cache: &SessionCache, request: RunRecipe) -> Result<TreeResult> {
        let recipe = self
            .recipes
            .get(&request.recipe_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or(WorkerError::UnknownRecipeId(request.recipe_id))?;

        let tree = wire::decode(&request.tree, cache)?;
        let out = self.stamp(&recipe.visit(&tree));
        register(cache, &out);
        Ok(TreeResult {
            tree: wire::encode(&out, Some(self.types.types()))?,
        })
    }

    /// Parse a batch. Declarations from every file that parses are
    /// registered before any tree is built, so types declared in one file
    /// resolve in the others.
    fn parse_batch(&self, cache: &SessionCache, request: ParseBatch) -> Result<ParsedBatch> {
        tracing::debug!(
            files = request.inputs.len(),
            root = %request.root.display(),
            ctx = %request.ctx.id,
            "Parsing batch"
        );

        let parsed: Vec<_> = request
            .inputs
            .into_iter()
            .map(|input| {
                let parsed = syntax::parse(input.path.display().to_string(), input.text);
                (input.path, parsed)
            })
            .collect();

        let declarations: Vec<_> = parsed
            .iter()
            .filter_map(|(_, p)| p.as_ref().ok())
            .flat_map(|p| p.declarations())
            .collect();
        self.types.declare(&declarations, &self.natives);

        let mut results = Vec::with_capacity(parsed.len());
        for (path, outcome) in parsed {
            let converted = outcome.and_then(|p| p.to_tree(&self.natives, &self.types));
            let item = match converted {
                Ok(tree) => {
                    register(cache, &tree);
                    ParsedItem {
                        path,
                        tree: Some(wire::encode(&tree, Some(self.types.types()))?),
                        error: None,
                    }
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Parse failed");
                    ParsedItem {
                        path,
                        tree: None,
                        error: Some(e.into()),
                    }
                }
            };
            results.push(item);
        }
        Ok(ParsedBatch { results })
    }

    fn print(&self, cache: &SessionCache, request: PrintTree) -> Result<Printed> {
        let tree = wire::decode(&request.tree, cache)?;
        Ok(Printed { text: tree.print() })
    }

    /// Give a handle to every node a recipe created.
    fn stamp(&self, tree: &Tree) -> Tree {
        rewrite(tree, &mut |node| {
            node.native()
                .is_none()
                .then(|| node.as_ref().clone().with_native(self.natives.next()))
        })
    }
}

fn register(cache: &SessionCache, tree: &Tree) {
    walk(tree, &mut |node| {
        if let Some(native) = node.native() {
            cache.nodes.insert(native, Arc::clone(node));
        }
    });
}

fn decode<T: DeserializeOwned>(command: &str, payload: Value) -> Result<T> {
    serde_json::from_value(payload).map_err(|source| WorkerError::Payload {
        command: command.to_string(),
        source,
    })
}

fn respond<T: Serialize>(
    command: &str,
    result: Result<T>,
) -> std::result::Result<Value, RemoteFailure> {
    let value = result?;
    serde_json::to_value(value)
        .map_err(|e| RemoteFailure::new(format!("failed to encode {command} result: {e}")))
}

#[async_trait]
impl WorkerHandler for JavaWorker {
    type Connection = SessionCache;

    fn open(&self) -> SessionCache {
        SessionCache::new()
    }

    async fn handle(
        &self,
        cache: &mut SessionCache,
        command: &str,
        payload: Value,
    ) -> std::result::Result<Value, RemoteFailure> {
        match command {
            "install-recipes" => respond(
                command,
                decode(command, payload).and_then(|r| self.install_recipes(r)),
            ),
            "load-recipe" => respond(
                command,
                decode(command, payload).and_then(|r| self.load_recipe(r)),
            ),
            "run-recipe-visitor" => respond(
                command,
                decode(command, payload).and_then(|r| self.run_recipe(cache, r)),
            ),
            "parse-batch" => respond(
                command,
                decode(command, payload).and_then(|r| self.parse_batch(cache, r)),
            ),
            "print" => respond(
                command,
                decode(command, payload).and_then(|r| self.print(cache, r)),
            ),
            other => Err(WorkerError::UnknownCommand(other.to_string()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use serde_json::json;
    use treelet::bridge::protocol::{ContextPayload, SourceText};
    use treelet::{RecipeDescriptor, RecipePackage};

    use crate::manifest::{Catalog, Manifest};

    fn worker() -> JavaWorker {
        JavaWorker::new(Installation {
            dir: PathBuf::from("."),
            manifest: Manifest {
                name: "treelet-worker".into(),
                version: "0.3.0".into(),
                language: "java".into(),
                files: vec!["recipes.json".into()],
            },
            catalog: Catalog {
                packages: vec![RecipePackage {
                    name: "@treelet/recipes-java".into(),
                    version: "1.0.0".into(),
                    recipes: vec![RecipeDescriptor {
                        name: "format.Spaces".into(),
                        display_name: "Collapse spaces".into(),
                        description: "Collapse runs of blanks.".into(),
                        tags: Vec::new(),
                        options: Vec::new(),
                    }],
                }],
            },
        })
    }

    fn batch(files: &[(&str, &str)]) -> ParseBatch {
        ParseBatch {
            root: PathBuf::from("/project"),
            inputs: files
                .iter()
                .map(|(path, text)| SourceText {
                    path: PathBuf::from(path),
                    text: text.to_string(),
                })
                .collect(),
            ctx: ContextPayload::default(),
        }
    }

    #[test]
    fn supertypes_resolve_across_files_in_a_batch() {
        let worker = worker();
        let cache = SessionCache::new();
        let parsed = worker
            .parse_batch(
                &cache,
                batch(&[("B.java", "class B extends A {}"), ("A.java", "class A {}")]),
            )
            .unwrap();

        assert_eq!(parsed.results.len(), 2);
        assert!(parsed.results.iter().all(|r| r.error.is_none()));

        let a = worker.types().get("A").unwrap();
        let b = worker.types().get("B").unwrap();
        assert_eq!(a.kind, "class");
        assert_eq!(b.supertype, Some(a.native));

        let b_types: Vec<_> = parsed.results[0]
            .tree
            .as_ref()
            .unwrap()
            .types
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(b_types, ["B", "A"]);
    }

    #[test]
    fn broken_file_fails_alone() {
        let worker = worker();
        let cache = SessionCache::new();
        let parsed = worker
            .parse_batch(
                &cache,
                batch(&[("Ok.java", "class Ok {}"), ("Bad.java", "class Bad {")]),
            )
            .unwrap();

        assert!(parsed.results[0].tree.is_some());
        let failure = parsed.results[1].error.as_ref().unwrap();
        assert!(failure.message.starts_with("failed to parse Bad.java"));
        assert!(failure.trace.as_deref().unwrap().starts_with("at line 1"));
    }

    #[tokio::test]
    async fn untouched_tree_comes_back_with_the_same_handles() {
        let worker = worker();
        let mut cache = SessionCache::new();
        let parsed = worker
            .parse_batch(&cache, batch(&[("Foo.java", "class Foo {}")]))
            .unwrap();
        let sent = parsed.results[0].tree.clone().unwrap();

        let loaded = worker
            .handle(&mut cache, "load-recipe", json!({"name": "format.Spaces"}))
            .await
            .unwrap();
        let result = worker
            .handle(
                &mut cache,
                "run-recipe-visitor",
                json!({"recipe_id": loaded["recipe_id"], "tree": sent}),
            )
            .await
            .unwrap();
        let back: TreeResult = serde_json::from_value(result).unwrap();
        assert_eq!(back.tree.entries, sent.entries);
    }

    #[test]
    fn deeply_nested_file_round_trips_on_a_small_stack() {
        let terms = vec!["x"; 4_000].join(" + ");
        let source = format!("class Deep {{\n    int s = {terms};\n}}\n");
        std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(move || {
                let worker = worker();
                let cache = SessionCache::new();
                let parsed = worker
                    .parse_batch(&cache, batch(&[("Deep.java", source.as_str())]))
                    .unwrap();
                let sent = parsed.results[0].tree.clone().unwrap();

                let loaded = worker
                    .load_recipe(LoadRecipe {
                        name: "format.Spaces".to_string(),
                        options: Default::default(),
                    })
                    .unwrap();
                let back = worker
                    .run_recipe(
                        &cache,
                        RunRecipe {
                            recipe_id: loaded.recipe_id,
                            tree: sent,
                        },
                    )
                    .unwrap();
                let printed = worker.print(&cache, PrintTree { tree: back.tree }).unwrap();
                assert_eq!(printed.text, source);
            })
            .unwrap()
            .join()
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_recipe_id_is_reported() {
        let worker = worker();
        let mut cache = SessionCache::new();
        let err = worker
            .handle(
                &mut cache,
                "run-recipe-visitor",
                json!({"recipe_id": 99, "tree": {"entries": [{"t": "ref", "id": uuid_zero()}]}}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.message, "no loaded recipe with id 99");
    }

    #[tokio::test]
    async fn install_recipes_lists_the_package() {
        let worker = worker();
        let mut cache = SessionCache::new();
        let package = worker
            .handle(
                &mut cache,
                "install-recipes",
                json!({
                    "package": "@treelet/recipes-java",
                    "version": "latest",
                    "ctx": {"id": uuid_zero()}
                }),
            )
            .await
            .unwrap();
        insta::assert_json_snapshot!(package, @r#"
        {
          "name": "@treelet/recipes-java",
          "version": "1.0.0",
          "recipes": [
            {
              "name": "format.Spaces",
              "display_name": "Collapse spaces",
              "description": "Collapse runs of blanks."
            }
          ]
        }
        "#);
    }

    #[tokio::test]
    async fn bad_payload_and_unknown_command() {
        let worker = worker();
        let mut cache = SessionCache::new();
        let err = worker
            .handle(&mut cache, "load-recipe", json!({"options": {}}))
            .await
            .unwrap_err();
        assert!(err.message.starts_with("bad load-recipe payload"));

        let err = worker
            .handle(&mut cache, "compile", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.message, "unknown command: compile");
    }

    fn uuid_zero() -> String {
        "00000000-0000-0000-0000-000000000000".to_string()
    }
}
