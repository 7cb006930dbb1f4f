//! The source-compiler boundary.
//!
//! The engine never parses or transforms JavaScript itself — turning source text into something
//! invocable is delegated entirely to a host-supplied [`Compiler`], exactly as the fetcher and
//! resolver are delegated to the host. This crate ships one reference implementation,
//! [`RegistryCompiler`], used by its own test suite: it treats the source string as an opaque key
//! into a table of pre-registered bodies, which is a legitimate (if minimal) `Compiler` and keeps
//! this crate from reinventing a JavaScript parser.

use crate::error::{AnyErr, ModuleError};
use crate::prelude::*;
use crate::value::{Exports, JsValue, Module};
use crate::wrapper::Require;
use std::cell::RefCell;
use std::rc::Rc;

/// A compiled, invocable commonjs-style module body: `fn(require, module, exports)`.
pub type ModuleBody = Rc<dyn Fn(&Require, &Module) -> Result<(), ModuleError>>;

/// A compiled UMD factory, invoked with one exports object per (non-`"exports"`) dependency, in
/// declaration order. A `Some` return value replaces `module.exports`.
pub type UmdFactory = Rc<dyn Fn(&[Exports]) -> Option<JsValue>>;

/// What compiling a UMD bootstrap discovers: the optional module name passed to `define`, its
/// dependency list (which may still contain the literal `"exports"`), and the factory to invoke
/// once those dependencies are ready.
#[derive(Clone)]
pub struct UmdDefinition {
  pub name: Option<String>,
  pub deps: Vec<String>,
  pub factory: UmdFactory,
}

/// Converts source text (plus the free-variable names it should close over) into an invocable
/// module body.
pub trait Compiler {
  /// Compiles a normal (commonjs-style) module body: `fn(...globals, require, module, exports)`,
  /// partially applied with `globals`'s values and bound to `module_this`, leaving only
  /// `(require, module)` (exports is reached through `module`) to be supplied at [`execute`]
  /// time.
  ///
  /// [`execute`]: crate::wrapper::ModuleWrapper::execute
  fn compile_module(
    &self,
    free_vars: &[String],
    code: &str,
    globals: &HashMap<String, JsValue>,
    module_this: Option<&JsValue>,
  ) -> Result<ModuleBody, AnyErr>;

  /// Compiles a UMD bootstrap. This is the Rust analogue of invoking `fn(define, ...globals)`
  /// with a synthesized `define` and observing what it records — see the UMD section of the
  /// module docs.
  fn compile_umd(&self, code: &str, globals: &HashMap<String, JsValue>) -> Result<UmdDefinition, AnyErr>;
}

/// Reference/test [`Compiler`]: source strings are keys into two registries of pre-built bodies.
#[derive(Default, Clone)]
pub struct RegistryCompiler {
  modules: Rc<RefCell<HashMap<String, ModuleBody>>>,
  umd: Rc<RefCell<HashMap<String, UmdDefinition>>>,
}

impl RegistryCompiler {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register_module(&self, code: impl Into<String>, body: ModuleBody) -> &Self {
    self.modules.borrow_mut().insert(code.into(), body);
    self
  }

  pub fn register_umd(&self, code: impl Into<String>, def: UmdDefinition) -> &Self {
    self.umd.borrow_mut().insert(code.into(), def);
    self
  }
}

impl Compiler for RegistryCompiler {
  // `globals`/`module_this` play no role here: registered bodies are plain Rust closures the test
  // author already bound to whatever they need, mirroring how a real compiler would have spliced
  // the same values into its generated function's bound arguments/receiver.
  fn compile_module(
    &self,
    _free_vars: &[String],
    code: &str,
    _globals: &HashMap<String, JsValue>,
    _module_this: Option<&JsValue>,
  ) -> Result<ModuleBody, AnyErr> {
    self
      .modules
      .borrow()
      .get(code)
      .cloned()
      .ok_or_else(|| anyhow::anyhow!("no registered module body for code {code:?}"))
  }

  fn compile_umd(&self, code: &str, _globals: &HashMap<String, JsValue>) -> Result<UmdDefinition, AnyErr> {
    self
      .umd
      .borrow()
      .get(code)
      .cloned()
      .ok_or_else(|| anyhow::anyhow!("no registered umd definition for code {code:?}"))
  }
}
