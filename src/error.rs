//! Errors and results.

use thiserror::Error as ThisError;

// anyhow {

/// [`anyhow::Error`]
pub type AnyErr = anyhow::Error;

/// [`anyhow::Result`] with `T` if ok, [`AnyErr`] if error.
pub type AnyResult<T> = anyhow::Result<T>;

// anyhow }

/// Errors thrown to (or by) executing module code.
#[derive(Debug, Clone, ThisError)]
pub enum ModuleError {
  /// A module synchronously required itself, directly or through `require.resolve`.
  #[error("Cyclic dependency on self: {0}")]
  CyclicDependency(String),

  /// A dependency discovered only at execution time (a dynamic import) could not be
  /// resolved, fetched, prepared or executed.
  #[error("Unresolvable request {request:?} from module {parent_id}")]
  Unresolvable { request: String, parent_id: String },

  /// A module's compiled body raised an error while executing.
  #[error("Module {0} threw while executing: {1}")]
  Execution(String, String),

  /// A wrapper was asked to execute twice.
  #[error("Module {0} already executed")]
  AlreadyExecuted(String),
}

/// Fatal, loader-scoped errors. Latching one of these via [`crate::loader::Loader::set_error`]
/// stops the loader from admitting new wrappers or fetch results.
#[derive(Debug, Clone, ThisError)]
pub enum LoaderError {
  #[error("fetch of {url} failed: {source}")]
  Fetch { url: String, source: AnyErrShared },

  #[error("resolution of {request:?} failed: {source}")]
  Resolve {
    request: String,
    source: AnyErrShared,
  },

  #[error("compilation of module {id} failed: {source}")]
  Compile { id: String, source: AnyErrShared },

  #[error(transparent)]
  Module(#[from] ModuleError),

  #[error("the loader has latched a fatal error")]
  Latched,
}

/// A cheaply-clonable `anyhow::Error`, needed because [`LoaderError`] must be [`Clone`] so it can
/// be broadcast to every waiter of a failed [`crate::wrapper::ModuleWrapper`] via
/// [`futures::future::Shared`].
#[derive(Debug, Clone)]
pub struct AnyErrShared(pub std::rc::Rc<AnyErr>);

impl AnyErrShared {
  pub fn new(err: AnyErr) -> Self {
    Self(std::rc::Rc::new(err))
  }
}

impl std::fmt::Display for AnyErrShared {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl std::error::Error for AnyErrShared {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    self.0.source()
  }
}

impl From<AnyErr> for AnyErrShared {
  fn from(err: AnyErr) -> Self {
    Self::new(err)
  }
}
