//! Small, in-memory [`Fetcher`]/[`Compiler`] stand-ins used by the loader's own test suite.

use crate::compiler::{Compiler, ModuleBody, RegistryCompiler, UmdDefinition, UmdFactory};
use crate::error::ModuleError;
use crate::fetcher::{Dependencies, FetchContext, FetchResult, Fetcher};
use crate::prelude::*;
use crate::value::JsValue;
use crate::wrapper::{DynamicImport, Require, RequireOutcome};

use async_trait::async_trait;
use std::cell::RefCell;
use std::rc::Rc;

/// A [`Fetcher`] backed by a map registered ahead of time, so tests can describe a module graph
/// as plain data instead of real source files.
#[derive(Default)]
pub struct InMemoryFetcher {
  modules: RefCell<HashMap<String, FetchResult>>,
  fetch_counts: RefCell<HashMap<String, u32>>,
}

impl InMemoryFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(
    &self,
    url: impl Into<String>,
    id: impl Into<String>,
    code: impl Into<String>,
    deps: Vec<String>,
  ) -> &Self {
    let url = url.into();
    self.modules.borrow_mut().insert(
      url.clone(),
      FetchResult {
        url,
        id: id.into(),
        code: code.into(),
        dependencies: Dependencies::List(deps),
        dependency_version_ranges: HashMap::default(),
        css: None,
      },
    );
    self
  }

  pub fn register_umd(&self, url: impl Into<String>, id: impl Into<String>, code: impl Into<String>) -> &Self {
    let url = url.into();
    self.modules.borrow_mut().insert(
      url.clone(),
      FetchResult {
        url,
        id: id.into(),
        code: code.into(),
        dependencies: Dependencies::Umd,
        dependency_version_ranges: HashMap::default(),
        css: None,
      },
    );
    self
  }

  pub fn fetch_count(&self, url: &str) -> u32 {
    *self.fetch_counts.borrow().get(url).unwrap_or(&0)
  }
}

#[async_trait(?Send)]
impl Fetcher for InMemoryFetcher {
  async fn fetch(&self, url: &str, _ctx: FetchContext) -> anyhow::Result<FetchResult> {
    *self.fetch_counts.borrow_mut().entry(url.to_string()).or_insert(0) += 1;
    self
      .modules
      .borrow()
      .get(url)
      .cloned()
      .ok_or_else(|| anyhow::anyhow!("no module registered for url {url:?}"))
  }
}

/// A body that sets a single key on its own exports object to a fixed value.
pub fn export_value(key: &str, value: JsValue) -> ModuleBody {
  let key = key.to_string();
  Rc::new(move |_require: &Require, module: &crate::value::Module| {
    if let JsValue::Object(map) = &mut *module.exports.borrow_mut() {
      map.insert(key.clone(), value.clone());
    }
    Ok(())
  })
}

/// A body that `require()`s `dep`, stores its exports under `as_key` on its own exports, and
/// errors out rather than dealing with a dynamic import if `dep` turns out unresolved at prepare
/// time (every test using this helper keeps its graph static).
pub fn require_and_export(dep: &str, as_key: &str) -> ModuleBody {
  let dep = dep.to_string();
  let as_key = as_key.to_string();
  Rc::new(move |require: &Require, module: &crate::value::Module| {
    let value = match require.call(&dep)? {
      RequireOutcome::Exports(exports) => exports.borrow().clone(),
      RequireOutcome::Pending(_) => {
        return Err(ModuleError::Unresolvable {
          request: dep.clone(),
          parent_id: module.id.clone(),
        });
      }
    };
    if let JsValue::Object(map) = &mut *module.exports.borrow_mut() {
      map.insert(as_key.clone(), value);
    }
    Ok(())
  })
}

/// A body that calls `require(dep)` purely for its side effects (linking/cycle tests that don't
/// care about the resulting value).
pub fn require_only(dep: &str) -> ModuleBody {
  let dep = dep.to_string();
  Rc::new(move |require: &Require, _module: &crate::value::Module| {
    require.call(&dep)?;
    Ok(())
  })
}

/// A body that `require()`s `dep`, a specifier absent from its own static `dependencies` list.
/// `require`'s internal `resolve` starts `dep`'s fetch as a side effect, so this always observes
/// `RequireOutcome::Pending` rather than an immediate `Exports`; the resulting future is stashed
/// into `captured` for the test to await directly, outside (necessarily synchronous) execution.
pub fn dynamic_import_capture(dep: &str, captured: Rc<RefCell<Option<DynamicImport>>>) -> ModuleBody {
  let dep = dep.to_string();
  Rc::new(move |require: &Require, _module: &crate::value::Module| {
    match require.call(&dep)? {
      RequireOutcome::Exports(_) => {
        panic!("dependency {dep:?} was not in the static dependency list; expected Pending")
      }
      RequireOutcome::Pending(fut) => {
        *captured.borrow_mut() = Some(fut);
      }
    }
    Ok(())
  })
}

/// A UMD factory combining its positional dependency exports (in declared order) under the keys
/// given in `keys`, then storing the names under `"combined"`.
pub fn umd_combine(keys: Vec<&'static str>) -> UmdFactory {
  Rc::new(move |args: &[crate::value::Exports]| {
    let mut combined = serde_json::Map::new();
    for (key, arg) in keys.iter().zip(args.iter()) {
      combined.insert((*key).to_string(), arg.borrow().clone());
    }
    Some(JsValue::Object(combined))
  })
}

/// A [`Compiler`] that ignores `code` entirely and instead bakes the `globals`/`module_this`
/// it was compiled with directly into the produced body's exports, under `"globals"` and
/// `"module_this"`. Exists to prove those values really do reach a compiled module body instead of
/// being dropped on the floor between `LoaderOptions` and [`Compiler::compile_module`].
#[derive(Default)]
pub struct GlobalsEchoCompiler;

impl Compiler for GlobalsEchoCompiler {
  fn compile_module(
    &self,
    _free_vars: &[String],
    _code: &str,
    globals: &HashMap<String, JsValue>,
    module_this: Option<&JsValue>,
  ) -> Result<ModuleBody, crate::error::AnyErr> {
    let globals = JsValue::Object(globals.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
    let module_this = module_this.cloned().unwrap_or(JsValue::Null);
    Ok(Rc::new(move |_require: &Require, module: &crate::value::Module| {
      if let JsValue::Object(map) = &mut *module.exports.borrow_mut() {
        map.insert("globals".to_string(), globals.clone());
        map.insert("module_this".to_string(), module_this.clone());
      }
      Ok(())
    }))
  }

  fn compile_umd(&self, _code: &str, _globals: &HashMap<String, JsValue>) -> Result<UmdDefinition, crate::error::AnyErr> {
    Err(anyhow::anyhow!("GlobalsEchoCompiler does not support UMD"))
  }
}

/// Builds a [`RegistryCompiler`] with one normal module body registered per `(code, body)` pair
/// and one UMD definition registered per `(code, def)` pair.
pub fn compiler_with(
  modules: Vec<(&str, ModuleBody)>,
  umd: Vec<(&str, UmdDefinition)>,
) -> Rc<dyn Compiler> {
  let compiler = RegistryCompiler::new();
  for (code, body) in modules {
    compiler.register_module(code, body);
  }
  for (code, def) in umd {
    compiler.register_umd(code, def);
  }
  Rc::new(compiler)
}
