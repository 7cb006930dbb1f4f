//! The loader: the load/link/execute engine tying fetcher, resolver, compiler and the module
//! graph together.
//!
//! Mirrors the role `ModuleMap`/its `loader.rs` play in the sibling JS-runtime module of this
//! codebase: `wrappers` is that `index`, `loads` is that `seen`-style in-flight-fetch table.

use crate::compiler::{Compiler, ModuleBody};
use crate::error::{AnyErrShared, LoaderError};
use crate::fetcher::{Dependencies, FetchContext, FetchResult, Fetcher};
use crate::prelude::*;
use crate::resolver::{Resolution, Resolver, VersionRanges};
use crate::style::StyleSink;
use crate::value::{Exports, JsValue, Module};
use crate::wrapper::{Body, ModuleWrapper};

use derive_builder::Builder;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tokio::sync::oneshot;
use tracing::{debug, error, trace};

/// Called once, the first time (and only the first time) a given entry module finishes
/// executing; see invariant 3, "`onEntry` fires exactly once per distinct entry id".
pub type OnEntry = Rc<dyn Fn(&str, &Exports)>;
/// Called whenever the loader transitions into the latched error state.
pub type OnError = Rc<dyn Fn(&LoaderError)>;

#[derive(Builder)]
#[builder(pattern = "owned", setter(into, strip_option), build_fn(name = "build_raw"))]
pub struct LoaderOptions {
  pub fetcher: Rc<dyn Fetcher>,
  #[builder(default = "Rc::new(crate::resolver::DefaultResolver::new())")]
  pub resolver: Rc<dyn Resolver>,
  pub compiler: Rc<dyn Compiler>,
  #[builder(default = "Rc::new(crate::style::NullStyleSink)")]
  pub style_sink: Rc<dyn StyleSink>,
  /// Free-variable name → value, injected into every compiled module body (§4.6).
  #[builder(default)]
  pub globals: HashMap<String, JsValue>,
  /// Bound as the receiver of every compiled module body.
  #[builder(default)]
  pub module_this: Option<JsValue>,
  #[builder(default)]
  pub on_entry: Option<OnEntry>,
  #[builder(default)]
  pub on_error: Option<OnError>,
}

impl LoaderOptionsBuilder {
  pub fn build(self) -> Result<LoaderOptions, LoaderOptionsBuilderError> {
    self.build_raw()
  }
}

/// A one-shot, multi-waiter broadcast of a completed fetch+link attempt for one URL.
struct LoadEntry {
  state: RefCell<LoadState>,
}

enum LoadState {
  Pending(Vec<oneshot::Sender<Result<Rc<ModuleWrapper>, AnyErrShared>>>),
  Ready(Rc<ModuleWrapper>),
  Failed(AnyErrShared),
}

impl LoadEntry {
  fn pending() -> Rc<Self> {
    Rc::new(Self {
      state: RefCell::new(LoadState::Pending(Vec::new())),
    })
  }

  fn settle(&self, outcome: Result<Rc<ModuleWrapper>, AnyErrShared>) {
    let mut state = self.state.borrow_mut();
    if !matches!(&*state, LoadState::Pending(_)) {
      return;
    }
    let prev = std::mem::replace(
      &mut *state,
      match &outcome {
        Ok(w) => LoadState::Ready(Rc::clone(w)),
        Err(e) => LoadState::Failed(e.clone()),
      },
    );
    drop(state);
    if let LoadState::Pending(waiters) = prev {
      for tx in waiters {
        let _ = tx.send(outcome.clone());
      }
    }
  }

  async fn wait(self: Rc<Self>) -> Result<Rc<ModuleWrapper>, AnyErrShared> {
    let rx = {
      let mut state = self.state.borrow_mut();
      match &*state {
        LoadState::Ready(w) => return Ok(Rc::clone(w)),
        LoadState::Failed(e) => return Err(e.clone()),
        LoadState::Pending(_) => {
          let (tx, rx) = oneshot::channel();
          if let LoadState::Pending(waiters) = &mut *state {
            waiters.push(tx);
          }
          rx
        }
      }
    };
    rx.await
      .unwrap_or_else(|_| Err(AnyErrShared::new(anyhow::anyhow!("load dropped"))))
  }
}

struct LoaderInner {
  fetcher: Rc<dyn Fetcher>,
  resolver: Rc<dyn Resolver>,
  compiler: Rc<dyn Compiler>,
  style_sink: Rc<dyn StyleSink>,
  globals: HashMap<String, JsValue>,
  module_this: Option<JsValue>,
  on_entry: Option<OnEntry>,
  on_error: Option<OnError>,

  wrappers: RefCell<HashMap<String, Rc<ModuleWrapper>>>,
  loads: RefCell<HashMap<String, Rc<LoadEntry>>>,
  pending_required_by: RefCell<HashMap<String, Vec<Rc<ModuleWrapper>>>>,
  entries_run: RefCell<HashSet<String>>,
  anonymous_counter: Cell<u64>,
  error: RefCell<Option<AnyErrShared>>,
}

/// The engine. Cheap to clone (an `Rc` handle); every clone shares the same module graph.
#[derive(Clone)]
pub struct Loader(Rc<LoaderInner>);

impl Loader {
  pub fn new(options: LoaderOptions) -> Self {
    Self(Rc::new(LoaderInner {
      fetcher: options.fetcher,
      resolver: options.resolver,
      compiler: options.compiler,
      style_sink: options.style_sink,
      globals: options.globals,
      module_this: options.module_this,
      on_entry: options.on_entry,
      on_error: options.on_error,
      wrappers: RefCell::new(HashMap::default()),
      loads: RefCell::new(HashMap::default()),
      pending_required_by: RefCell::new(HashMap::default()),
      entries_run: RefCell::new(HashSet::default()),
      anonymous_counter: Cell::new(0),
      error: RefCell::new(None),
    }))
  }

  fn latched_error(&self) -> Option<AnyErrShared> {
    self.0.error.borrow().clone()
  }

  pub fn set_error(&self, err: AnyErrShared) {
    let mut slot = self.0.error.borrow_mut();
    if slot.is_some() {
      return;
    }
    *slot = Some(err.clone());
    drop(slot);
    error!(error = %err, "loader latched into error state");
    if let Some(cb) = &self.0.on_error {
      cb(&LoaderError::Latched);
    }
  }

  /// Clears the latched error. Per §4.1, this drops only *failed* in-flight loads and *failed*
  /// wrappers (unbinding their URL↔id entries in the resolver); successful loads and wrappers
  /// survive untouched.
  pub fn clear_error(&self) {
    if self.0.error.borrow_mut().take().is_none() {
      return;
    }

    let failed_urls: Vec<String> = self
      .0
      .loads
      .borrow()
      .iter()
      .filter_map(|(url, entry)| match &*entry.state.borrow() {
        LoadState::Failed(_) => Some(url.clone()),
        _ => None,
      })
      .collect();
    for url in &failed_urls {
      self.0.loads.borrow_mut().remove(url);
      self.0.resolver.unregister_url(url);
    }

    // A wrapper that never reached `isPrepared` before the latch hit either failed outright or
    // was still waiting on a dependency that (transitively) did; either way it counts as "failed"
    // for clearError's purposes, since a pending dependency fetch that completes after this point
    // has nowhere left to deliver its result (the wrapper is about to be evicted).
    let failed_wrapper_ids: Vec<String> = self
      .0
      .wrappers
      .borrow()
      .iter()
      .filter(|(_, w)| !w.is_prepared())
      .map(|(id, _)| id.clone())
      .collect();
    for id in &failed_wrapper_ids {
      self.0.wrappers.borrow_mut().remove(id);
      self.0.entries_run.borrow_mut().remove(id);
    }

    debug!(
      removed_loads = failed_urls.len(),
      removed_wrappers = failed_wrapper_ids.len(),
      "loader error cleared"
    );
  }

  pub(crate) fn resolve_request(
    &self,
    request: &str,
    parent_id: Option<&str>,
    version_ranges: &VersionRanges,
  ) -> AnyResult<Resolution> {
    self.0.resolver.resolve(request, parent_id, version_ranges)
  }

  pub(crate) fn get_wrapper(&self, id: &str) -> Option<Rc<ModuleWrapper>> {
    self.0.wrappers.borrow().get(id).cloned()
  }

  #[cfg(test)]
  pub(crate) fn get_wrapper_for_test(&self, id: &str) -> Option<Rc<ModuleWrapper>> {
    self.get_wrapper(id)
  }

  pub(crate) fn ready_id_for_url(&self, url: &str) -> Option<String> {
    match &*self.0.loads.borrow().get(url)?.state.borrow() {
      LoadState::Ready(w) => Some(w.id.clone()),
      _ => None,
    }
  }

  /// Deduplicated fetch+link for `url`; returns a handle future waiters can `.wait()` on. If a
  /// load for `url` is already in flight or complete, returns the existing entry instead of
  /// starting a second fetch (invariant 5: "identical concurrent requests for the same URL
  /// produce exactly one fetch").
  pub(crate) fn load_wrapper(
    &self,
    url: &str,
    required_by: Option<Rc<ModuleWrapper>>,
    original_request: Option<String>,
  ) -> LoadHandle {
    // A load already in flight may pick up more than one requirer before its fetch resolves (two
    // modules discovering a shared, not-yet-fetched dependency at nearly the same time, or a
    // cycle where each side requires the other). Every requirer recorded before the wrapper is
    // built is folded into that wrapper's `requiredBy` the moment it is built; a requirer arriving
    // after the wrapper already exists goes through `add_to_required_by` instead.
    if let Some(existing) = self.0.loads.borrow().get(url).cloned() {
      if let Some(rb) = required_by {
        match &*existing.state.borrow() {
          LoadState::Ready(w) => w.add_to_required_by(self, rb),
          LoadState::Pending(_) => {
            self.0.pending_required_by.borrow_mut().entry(url.to_string()).or_default().push(rb);
          }
          LoadState::Failed(_) => {}
        }
      }
      return LoadHandle(existing);
    }

    // Property 6 / invariant 7: once latched, no new Fetcher invocation is started.
    if let Some(err) = self.latched_error() {
      let entry = LoadEntry::pending();
      entry.settle(Err(err));
      return LoadHandle(entry);
    }

    if let Some(rb) = &required_by {
      self
        .0
        .pending_required_by
        .borrow_mut()
        .entry(url.to_string())
        .or_default()
        .push(Rc::clone(rb));
    }

    let entry = LoadEntry::pending();
    self.0.loads.borrow_mut().insert(url.to_string(), Rc::clone(&entry));

    let loader = self.clone();
    let url = url.to_string();
    tokio::task::spawn_local(async move {
      loader.run_fetch(url, original_request).await;
    });

    LoadHandle(entry)
  }

  async fn run_fetch(&self, url: String, original_request: Option<String>) {
    let required_by_id = self
      .0
      .pending_required_by
      .borrow()
      .get(&url)
      .and_then(|claims| claims.first())
      .map(|w| w.id.clone());
    let ctx = FetchContext {
      required_by_id,
      original_request: original_request.clone(),
    };
    trace!(url = %url, "fetching");
    let result = match self.0.fetcher.fetch(&url, ctx).await {
      Ok(r) => r,
      Err(source) => {
        let err = AnyErrShared::new(source);
        self.set_error(err.clone());
        self.0.pending_required_by.borrow_mut().remove(&url);
        self.fail_load(&url, err);
        return;
      }
    };
    self.handle_fetch_result(result).await;
  }

  fn fail_load(&self, url: &str, err: AnyErrShared) {
    if let Some(entry) = self.0.loads.borrow().get(url) {
      entry.settle(Err(err));
    }
  }

  async fn handle_fetch_result(&self, result: FetchResult) {
    // Invariant 7 / §4.1 step 1: once latched, no new wrappers are created and no new fetch
    // results are processed, even if the fetch itself succeeded.
    if let Some(err) = self.latched_error() {
      self.0.pending_required_by.borrow_mut().remove(&result.url);
      self.fail_load(&result.url, err);
      return;
    }

    self.0.resolver.register_resolved_url(&result.url, &result.id);
    let required_by_list = self.0.pending_required_by.borrow_mut().remove(&result.url).unwrap_or_default();

    let wrapper = if let Some(existing) = self.get_wrapper(&result.id) {
      for rb in required_by_list {
        existing.add_to_required_by(self, rb);
      }
      existing
    } else {
      let body = match self.compile(&result) {
        Ok(b) => b,
        Err(source) => {
          let err = AnyErrShared::new(source);
          self.set_error(err.clone());
          self.fail_load(&result.url, err);
          return;
        }
      };
      let wrapper = ModuleWrapper::new(result.id.clone(), body, result.dependency_version_ranges.clone());
      self.0.wrappers.borrow_mut().insert(result.id.clone(), Rc::clone(&wrapper));

      if let Some(css) = &result.css {
        self.0.style_sink.set_style(&result.id, css);
      }

      let deps = match &result.dependencies {
        Dependencies::List(list) => list.clone(),
        Dependencies::Umd => match &*wrapper.body.borrow() {
          Body::Umd { ordered_deps, .. } => {
            ordered_deps.iter().filter(|d| d.as_str() != "exports").cloned().collect()
          }
          _ => Vec::new(),
        },
      };

      wrapper.prepare(self, deps, required_by_list);
      wrapper
    };

    if let Err(e) = wrapper.wait_until_prepared().await {
      self.fail_load(&result.url, e);
      return;
    }

    if let Some(entry) = self.0.loads.borrow().get(&result.url).cloned() {
      entry.settle(Ok(wrapper));
    }
  }

  fn compile(&self, result: &FetchResult) -> Result<crate::wrapper::Body, crate::error::AnyErr> {
    match &result.dependencies {
      Dependencies::Umd => self.compile_umd(&result.code),
      Dependencies::List(deps) => self.compile_normal(deps, &result.code),
    }
  }

  /// Compiles `fn(define, ...globals)` and invokes the synthesized `define` bootstrap: §4.1 UMD
  /// mode.
  fn compile_umd(&self, code: &str) -> Result<crate::wrapper::Body, crate::error::AnyErr> {
    let def = self.0.compiler.compile_umd(code, &self.0.globals)?;
    Ok(crate::wrapper::Body::Umd {
      factory: def.factory,
      ordered_deps: def.deps,
    })
  }

  /// Compiles `fn(...globals, require, module, exports)`, bound to `module_this` with `globals`
  /// filled in: §4.1 normal mode.
  fn compile_normal(&self, deps: &[String], code: &str) -> Result<crate::wrapper::Body, crate::error::AnyErr> {
    let mut free_vars = deps.to_vec();
    free_vars.push("exports".to_string());
    let body: ModuleBody =
      self
        .0
        .compiler
        .compile_module(&free_vars, code, &self.0.globals, self.0.module_this.as_ref())?;
    Ok(crate::wrapper::Body::Normal(body))
  }

  /// Installs `exports` as an already-loaded module under `id`, with no URL and no fetch, and
  /// (optionally) injects CSS under the same id. Used to seed host globals (`process`, `require`
  /// itself, etc.) into the graph.
  pub fn preload_module(&self, id: impl Into<String>, exports: JsValue, css: Option<&str>) -> Rc<ModuleWrapper> {
    let id = id.into();
    self.0.resolver.register_id(&id);
    let wrapper = ModuleWrapper::new(id.clone(), crate::wrapper::Body::Preload, HashMap::default());
    wrapper.module.set_loaded_preloaded(exports);
    if let Some(css) = css {
      self.0.style_sink.set_style(&id, css);
    }
    self.0.wrappers.borrow_mut().insert(id, Rc::clone(&wrapper));
    wrapper
  }

  /// `evaluate(dependencies, code, versionRanges?, id?)`: §4.1. Builds an entry wrapper directly
  /// from already-available source (no fetch for the entry itself — only for any dependency that
  /// turns out unresolved), prepares it against `dependencies`, and executes it once prepared
  /// (it has no `requiredBy`, so it is an entry point by construction). Running the same id twice
  /// is a no-op the second time (invariant 3 / "`onEntry` fires exactly once per distinct entry
  /// id").
  pub async fn evaluate(
    &self,
    dependencies: Vec<String>,
    code: &str,
    version_ranges: Option<VersionRanges>,
    id: Option<String>,
  ) -> Result<Module, LoaderError> {
    let id = id.unwrap_or_else(|| self.next_anonymous_id());

    if let Some(err) = self.latched_error() {
      return Err(LoaderError::Fetch { url: id, source: err });
    }

    if let Some(existing) = self.get_wrapper(&id) {
      self.run_entry_if_needed(&existing)?;
      return Ok(existing.module.clone());
    }

    let body = self.compile_normal(&dependencies, code).map_err(|source| LoaderError::Compile {
      id: id.clone(),
      source: AnyErrShared::new(source),
    })?;

    let wrapper = ModuleWrapper::new(id.clone(), body, version_ranges.unwrap_or_default());
    self.0.resolver.register_id(&id);
    self.0.wrappers.borrow_mut().insert(id.clone(), Rc::clone(&wrapper));

    wrapper.prepare(self, dependencies, Vec::new());
    wrapper
      .wait_until_prepared()
      .await
      .map_err(|source| LoaderError::Fetch { url: id.clone(), source })?;

    self.run_entry_if_needed(&wrapper)?;
    Ok(wrapper.module.clone())
  }

  /// `require(request) → Module`: §4.1. Resolves `request` with no parent; if already known,
  /// returns the existing module, otherwise fetches and links it. A dependency-free request with
  /// no `requiredBy` is itself an entry point (invariant 6), so the same once-only `onEntry` and
  /// auto-execution rule applies here as in [`Loader::evaluate`].
  pub async fn require(&self, request: &str) -> Result<Module, LoaderError> {
    if let Some(err) = self.latched_error() {
      return Err(LoaderError::Fetch {
        url: request.to_string(),
        source: err,
      });
    }

    let wrapper = self.load_entry(request, None).await?;
    self.run_entry_if_needed(&wrapper)?;
    Ok(wrapper.module.clone())
  }

  /// Executes `wrapper` and fires `on_entry` the first (and only the first) time a given entry id
  /// is seen, whether reached through [`Loader::evaluate`] or [`Loader::require`].
  fn run_entry_if_needed(&self, wrapper: &Rc<ModuleWrapper>) -> Result<(), LoaderError> {
    let already_run = self.0.entries_run.borrow().contains(&wrapper.id);
    if !already_run {
      if !wrapper.module.loaded() {
        if let Err(source) = wrapper.execute(self) {
          self.set_error(AnyErrShared::new(anyhow::Error::new(source.clone())));
          return Err(LoaderError::Module(source));
        }
      }
      self.0.entries_run.borrow_mut().insert(wrapper.id.clone());
      if let Some(cb) = &self.0.on_entry {
        cb(&wrapper.id, &wrapper.module.exports);
      }
    }
    Ok(())
  }

  async fn load_entry(
    &self,
    request: &str,
    required_by: Option<Rc<ModuleWrapper>>,
  ) -> Result<Rc<ModuleWrapper>, LoaderError> {
    let resolution = self
      .resolve_request(request, required_by.as_deref().map(|w| w.id.as_str()), &HashMap::default())
      .map_err(|source| LoaderError::Resolve {
        request: request.to_string(),
        source: AnyErrShared::new(source),
      })?;

    match resolution {
      Resolution::Available { id } => self.get_wrapper(&id).ok_or_else(|| {
        LoaderError::Resolve {
          request: request.to_string(),
          source: AnyErrShared::new(anyhow::anyhow!("resolved id {id} has no wrapper")),
        }
      }),
      Resolution::NeedFetch { url } => {
        let handle = self.load_wrapper(&url, required_by, Some(request.to_string()));
        handle.wait().await.map_err(|source| LoaderError::Fetch { url, source })
      }
    }
  }

  /// Mints an id for a module with no natural specifier (an anonymous UMD blob, a `<script>`
  /// tag with inline source). Stable per-loader, monotonically increasing; advancing it while the
  /// loader is latched into an error is harmless since the resulting id is simply never used.
  pub fn next_anonymous_id(&self) -> String {
    let n = self.0.anonymous_counter.get();
    self.0.anonymous_counter.set(n + 1);
    format!("anonymous://{n}")
  }

  /// Evicts `id` and the transitive closure of every wrapper that only required it through this
  /// one (invariant: "unload cascades through `required_by`, not just direct dependents").
  pub fn unload(&self, id: &str) {
    let mut to_remove = HashSet::default();
    self.collect_unload_closure(id, &mut to_remove);

    for victim in &to_remove {
      if let Some(w) = self.0.wrappers.borrow_mut().remove(victim) {
        self.0.style_sink.remove_style(&w.id);
      }
      self.0.entries_run.borrow_mut().remove(victim);
    }

    let urls: Vec<String> = self
      .0
      .loads
      .borrow()
      .iter()
      .filter_map(|(url, entry)| match &*entry.state.borrow() {
        LoadState::Ready(w) if to_remove.contains(&w.id) => Some(url.clone()),
        _ => None,
      })
      .collect();
    for url in urls {
      self.0.loads.borrow_mut().remove(&url);
      self.0.resolver.unregister_url(&url);
    }
    debug!(id = %id, removed = to_remove.len(), "unloaded");
  }

  /// A module's own `required_by` set is exactly its ancestors in the requiring direction, so
  /// cascading an unload is just walking that set transitively.
  fn collect_unload_closure(&self, id: &str, acc: &mut HashSet<String>) {
    if !acc.insert(id.to_string()) {
      return;
    }
    let Some(wrapper) = self.get_wrapper(id) else {
      return;
    };
    for ancestor in wrapper.required_by() {
      self.collect_unload_closure(&ancestor, acc);
    }
  }
}

/// A handle to a deduplicated in-flight or completed [`LoadEntry`].
pub(crate) struct LoadHandle(Rc<LoadEntry>);

impl LoadHandle {
  pub(crate) async fn wait(self) -> Result<Rc<ModuleWrapper>, AnyErrShared> {
    self.0.wait().await
  }
}
