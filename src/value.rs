//! The values exchanged across the module graph.
//!
//! The engine stays host-agnostic: it never interprets a module's exports beyond moving them
//! around, so a small JSON-shaped value is enough to drive the linking and execution semantics in
//! this crate's tests, while a real embedder would swap it for its own value representation.

use std::cell::RefCell;
use std::rc::Rc;

pub use serde_json::Value as JsValue;

/// A module's exports object. Shared (`Rc<RefCell<_>>`) because cyclic peers observe each other's
/// *partial* exports while they are still executing (see the two-cycle scenario in the module
/// docs).
pub type Exports = Rc<RefCell<JsValue>>;

/// Creates the initial, empty exports object a module starts with.
pub fn empty_exports() -> Exports {
  Rc::new(RefCell::new(JsValue::Object(serde_json::Map::new())))
}

/// The module object observable to executing code: `{ id, exports, loaded }`.
#[derive(Debug, Clone)]
pub struct Module {
  pub id: String,
  pub exports: Exports,
  loaded: Rc<RefCell<bool>>,
}

impl Module {
  pub fn new(id: String) -> Self {
    Self {
      id,
      exports: empty_exports(),
      loaded: Rc::new(RefCell::new(false)),
    }
  }

  pub fn loaded(&self) -> bool {
    *self.loaded.borrow()
  }

  /// Marks the module loaded. Panics if called twice; invariant 2 in the module docs requires
  /// callers (only [`crate::wrapper::ModuleWrapper::execute`]) to check first.
  pub(crate) fn mark_loaded(&self) {
    let mut loaded = self.loaded.borrow_mut();
    assert!(!*loaded, "module {} executed twice", self.id);
    *loaded = true;
  }

  pub(crate) fn set_loaded_preloaded(&self, exports: JsValue) {
    *self.exports.borrow_mut() = exports;
    *self.loaded.borrow_mut() = true;
  }
}
