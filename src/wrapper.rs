//! The module-wrapper linking state machine.
//!
//! One [`ModuleWrapper`] exists per distinct module id. It tracks what it still needs before it
//! can run (`waiting_for`), who already depends on it (`required_by`, which is what lets cyclic
//! graphs terminate instead of deadlocking), and hosts the `require` closure handed to the
//! module's own body at execution time.

use crate::compiler::{ModuleBody, UmdFactory};
use crate::error::{AnyErrShared, ModuleError};
use crate::loader::Loader;
use crate::prelude::*;
use crate::resolver::{Resolution, VersionRanges};
use crate::value::{Exports, Module};

use futures::future::{FutureExt, LocalBoxFuture, Shared};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// The compiled, executable body of a wrapper.
pub(crate) enum Body {
  /// A commonjs-style body: `fn(require, module, exports)`.
  Normal(ModuleBody),
  /// A UMD factory plus the (still `"exports"`-laden) dependency order discovered when its
  /// `define()` call was compiled.
  Umd {
    factory: UmdFactory,
    ordered_deps: Vec<String>,
  },
  /// An already-exported value installed via `Loader::preload_module`; executing it is a no-op.
  Preload,
}

/// A one-shot latch with multiple waiters, used for `preparedPromise`. Resolving or rejecting it
/// twice is a no-op (invariant: "later `stopWaitingFor` calls on an already-empty set are
/// no-ops").
enum LatchState {
  Pending(Vec<oneshot::Sender<Result<(), AnyErrShared>>>),
  Ready,
  Failed(AnyErrShared),
}

pub(crate) struct Latch(RefCell<LatchState>);

impl Latch {
  fn new() -> Self {
    Self(RefCell::new(LatchState::Pending(Vec::new())))
  }

  fn settle(&self, outcome: Result<(), AnyErrShared>) {
    let mut state = self.0.borrow_mut();
    if !matches!(&*state, LatchState::Pending(_)) {
      return;
    }
    let prev = std::mem::replace(
      &mut *state,
      match &outcome {
        Ok(()) => LatchState::Ready,
        Err(e) => LatchState::Failed(e.clone()),
      },
    );
    drop(state);
    if let LatchState::Pending(waiters) = prev {
      for tx in waiters {
        let _ = tx.send(outcome.clone());
      }
    }
  }

  pub(crate) async fn wait(&self) -> Result<(), AnyErrShared> {
    let rx = {
      let mut state = self.0.borrow_mut();
      match &*state {
        LatchState::Ready => return Ok(()),
        LatchState::Failed(e) => return Err(e.clone()),
        LatchState::Pending(_) => {
          let (tx, rx) = oneshot::channel();
          if let LatchState::Pending(waiters) = &mut *state {
            waiters.push(tx);
          }
          rx
        }
      }
    };
    rx.await
      .unwrap_or_else(|_| Err(AnyErrShared::new(anyhow::anyhow!("wrapper dropped while preparing"))))
  }
}

/// A future representing a dynamic import started from `require.resolve`, resolved to the
/// eventual exports object (or an execution/unresolvable error).
pub type DynamicImport = Shared<LocalBoxFuture<'static, Result<Exports, ModuleError>>>;

/// The linking unit: one per distinct module id.
pub struct ModuleWrapper {
  pub id: String,
  pub module: Module,
  pub dependency_version_ranges: VersionRanges,
  pub(crate) body: RefCell<Body>,

  required_by: RefCell<HashSet<String>>,
  waiting_for: RefCell<Vec<String>>,
  dynamic_imports: RefCell<HashMap<String, DynamicImport>>,
  is_prepared: Cell<bool>,
  prepared: Latch,
}

impl std::fmt::Debug for ModuleWrapper {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ModuleWrapper")
      .field("id", &self.id)
      .field("is_prepared", &self.is_prepared.get())
      .field("required_by", &self.required_by.borrow())
      .field("waiting_for", &self.waiting_for.borrow())
      .finish()
  }
}

impl ModuleWrapper {
  pub(crate) fn new(
    id: String,
    body: Body,
    dependency_version_ranges: VersionRanges,
  ) -> Rc<Self> {
    Rc::new(Self {
      module: Module::new(id.clone()),
      id,
      dependency_version_ranges,
      body: RefCell::new(body),
      required_by: RefCell::new(HashSet::default()),
      waiting_for: RefCell::new(Vec::new()),
      dynamic_imports: RefCell::new(HashMap::default()),
      is_prepared: Cell::new(false),
      prepared: Latch::new(),
    })
  }

  pub fn is_prepared(&self) -> bool {
    self.is_prepared.get()
  }

  pub fn required_by(&self) -> HashSet<String> {
    self.required_by.borrow().clone()
  }

  pub(crate) async fn wait_until_prepared(self: &Rc<Self>) -> Result<(), AnyErrShared> {
    self.prepared.wait().await
  }

  /// `prepare(dependencyRequests, requiredByWrappers)`: §4.2.
  pub(crate) fn prepare(
    self: &Rc<Self>,
    loader: &Loader,
    dependency_requests: Vec<String>,
    required_by: Vec<Rc<ModuleWrapper>>,
  ) {
    for w in &required_by {
      self.add_required_by(w);
    }

    for request in dependency_requests {
      let resolution = match loader.resolve_request(
        &request,
        Some(&self.id),
        &self.dependency_version_ranges,
      ) {
        Ok(r) => r,
        Err(e) => {
          self.reject_prepared(AnyErrShared::new(e));
          return;
        }
      };

      match resolution {
        Resolution::Available { id } => {
          let Some(dep) = loader.get_wrapper(&id) else {
            self.reject_prepared(AnyErrShared::new(anyhow::anyhow!(
              "resolver reported {id} as available but no wrapper is registered for it"
            )));
            return;
          };
          if self.required_by.borrow().contains(&dep.id) {
            trace!(wrapper = %self.id, dep = %dep.id, "skipping dependency already in required_by (cycle)");
            continue;
          }
          if dep.is_prepared() {
            continue;
          }
          self.waiting_for.borrow_mut().push(dep.id.clone());
          let waiter = Rc::clone(self);
          let dep_for_wait = Rc::clone(&dep);
          tokio::task::spawn_local(async move {
            match dep_for_wait.wait_until_prepared().await {
              Ok(()) => waiter.stop_waiting_for(&dep_for_wait.id),
              Err(e) => waiter.reject_prepared(e),
            }
          });
        }
        Resolution::NeedFetch { url } => {
          self.waiting_for.borrow_mut().push(url.clone());
          let entry = loader.load_wrapper(&url, Some(Rc::clone(self)), Some(request.clone()));
          let waiter = Rc::clone(self);
          let url_for_stop = url.clone();
          tokio::task::spawn_local(async move {
            match entry.wait().await {
              Ok(_wrapper) => waiter.stop_waiting_for(&url_for_stop),
              Err(e) => waiter.reject_prepared(e),
            }
          });
        }
      }
    }

    self.maybe_finish_prepare();
  }

  fn add_required_by(&self, w: &Rc<ModuleWrapper>) {
    let mut rb = self.required_by.borrow_mut();
    rb.insert(w.id.clone());
    for id in w.required_by.borrow().iter() {
      rb.insert(id.clone());
    }
  }

  /// `addToRequiredBy(newRequiredBy)`: §4.2. Called when a shared dependency is late-claimed by
  /// an additional consumer after this wrapper was already registered.
  pub(crate) fn add_to_required_by(self: &Rc<Self>, loader: &Loader, new_required_by: Rc<ModuleWrapper>) {
    self.add_required_by(&new_required_by);
    let waiting: Vec<String> = self.waiting_for.borrow().clone();
    let rb = self.required_by.borrow().clone();
    for key in waiting {
      let discovered_cycle = rb.contains(&key)
        || loader
          .ready_id_for_url(&key)
          .is_some_and(|id| rb.contains(&id));
      if discovered_cycle {
        debug!(wrapper = %self.id, key = %key, "cycle discovered via late required_by claim");
        self.stop_waiting_for(&key);
      }
    }
  }

  fn stop_waiting_for(self: &Rc<Self>, key: &str) {
    let mut waiting = self.waiting_for.borrow_mut();
    waiting.retain(|k| k != key);
    let empty = waiting.is_empty();
    drop(waiting);
    if empty {
      self.maybe_finish_prepare();
    }
  }

  fn maybe_finish_prepare(self: &Rc<Self>) {
    if self.is_prepared.get() {
      return;
    }
    if self.waiting_for.borrow().is_empty() {
      self.is_prepared.set(true);
      debug!(wrapper = %self.id, "prepared");
      self.prepared.settle(Ok(()));
    }
  }

  fn reject_prepared(self: &Rc<Self>, err: AnyErrShared) {
    self.prepared.settle(Err(err));
  }

  /// `execute()`: §4.2. Asserts the module has not already run, then invokes its body.
  pub fn execute(self: &Rc<Self>, loader: &Loader) -> Result<(), ModuleError> {
    if self.module.loaded() {
      return Err(ModuleError::AlreadyExecuted(self.id.clone()));
    }
    self.module.mark_loaded();
    trace!(wrapper = %self.id, "executing");

    let require = Require {
      wrapper: Rc::clone(self),
      loader: loader.clone(),
    };

    // Avoid holding the `RefCell` borrow across the body call: a cyclic `require` may re-enter
    // this wrapper's `Require`, but never this wrapper's own `body` cell (self-require is
    // rejected before we ever get here), so this is purely to keep the borrow-checker happy about
    // reentrant calls through other wrappers.
    let body_kind = {
      let body = self.body.borrow();
      match &*body {
        Body::Preload => None,
        Body::Normal(f) => Some(Body::Normal(Rc::clone(f))),
        Body::Umd {
          factory,
          ordered_deps,
        } => Some(Body::Umd {
          factory: Rc::clone(factory),
          ordered_deps: ordered_deps.clone(),
        }),
      }
    };

    match body_kind {
      None => Ok(()),
      Some(Body::Normal(body)) => body(&require, &self.module),
      Some(Body::Umd {
        factory,
        ordered_deps,
      }) => {
        let mut args = Vec::with_capacity(ordered_deps.len());
        for dep in &ordered_deps {
          if dep == "exports" {
            args.push(Rc::clone(&self.module.exports));
            continue;
          }
          match require.call(dep)? {
            RequireOutcome::Exports(exports) => args.push(exports),
            RequireOutcome::Pending(_) => {
              return Err(ModuleError::Unresolvable {
                request: dep.clone(),
                parent_id: self.id.clone(),
              });
            }
          }
        }
        if let Some(replacement) = factory(&args) {
          *self.module.exports.borrow_mut() = replacement;
        }
        Ok(())
      }
      Some(Body::Preload) => unreachable!(),
    }
  }
}

/// What `require(request)` returns inside an executing module body: synchronous exports when the
/// dependency was already prepared, or a promise of exports for a dependency first discovered
/// during execution (a dynamic import).
pub enum RequireOutcome {
  Exports(Exports),
  Pending(DynamicImport),
}

/// The `require` function (and its attached `resolve`) exposed to an executing module body.
pub struct Require {
  wrapper: Rc<ModuleWrapper>,
  loader: Loader,
}

impl Require {
  /// `require.resolve(request)`: resolves synchronously and, for a `NeedFetch` resolution,
  /// *synchronously initiates* the fetch — the defining side effect that lets a later
  /// `require(request)` for the same specifier resume it.
  pub fn resolve(&self, request: &str) -> Result<String, ModuleError> {
    let resolution = self
      .loader
      .resolve_request(request, Some(&self.wrapper.id), &self.wrapper.dependency_version_ranges)
      .map_err(|_| ModuleError::Unresolvable {
        request: request.to_string(),
        parent_id: self.wrapper.id.clone(),
      })?;

    match resolution {
      Resolution::Available { id } => Ok(id),
      Resolution::NeedFetch { url } => {
        let entry = self
          .loader
          .load_wrapper(&url, Some(Rc::clone(&self.wrapper)), Some(request.to_string()));
        let parent_id = self.wrapper.id.clone();
        let requested = request.to_string();
        let loader = self.loader.clone();
        let fut: LocalBoxFuture<'static, Result<Exports, ModuleError>> = Box::pin(async move {
          match entry.wait().await {
            Ok(w) => {
              if !w.module.loaded() {
                w.execute(&loader)?;
              }
              Ok(Rc::clone(&w.module.exports))
            }
            Err(_) => Err(ModuleError::Unresolvable {
              request: requested,
              parent_id,
            }),
          }
        });
        self
          .wrapper
          .dynamic_imports
          .borrow_mut()
          .insert(request.to_string(), fut.shared());
        Ok(url)
      }
    }
  }

  /// `require(request)`: §4.2.
  pub fn call(&self, request: &str) -> Result<RequireOutcome, ModuleError> {
    let requested_id = self.resolve(request)?;

    if requested_id == self.wrapper.id {
      return Err(ModuleError::CyclicDependency(self.wrapper.id.clone()));
    }

    if let Some(w) = self.loader.get_wrapper(&requested_id) {
      if !w.module.loaded() {
        w.execute(&self.loader)?;
      }
      return Ok(RequireOutcome::Exports(Rc::clone(&w.module.exports)));
    }

    if let Some(fut) = self.wrapper.dynamic_imports.borrow().get(request).cloned() {
      return Ok(RequireOutcome::Pending(fut));
    }

    Err(ModuleError::Unresolvable {
      request: request.to_string(),
      parent_id: self.wrapper.id.clone(),
    })
  }

  pub fn module_id(&self) -> &str {
    &self.wrapper.id
  }
}

#[cfg(test)]
mod wrapper_tests;

