//! Request resolution.
//!
//! Mirrors the role `ImportMap`/`ModuleLoader::resolve` play in the sibling JS-runtime module of
//! this codebase: a pure mapping from a request string to a module identity, stateful only in
//! that it remembers which URLs have already produced which ids.

use crate::prelude::*;
use std::cell::RefCell;

pub type VersionRanges = HashMap<String, String>;

/// The result of resolving a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
  /// The module is already known; no fetch required.
  Available { id: String },
  /// A fetch must be performed; the eventual id is learned from the `FetchResult`.
  NeedFetch { url: String },
}

/// Maps a request string (plus an optional parent id and version-range map) to a [`Resolution`].
pub trait Resolver {
  fn resolve(
    &self,
    request: &str,
    parent_id: Option<&str>,
    version_ranges: &VersionRanges,
  ) -> AnyResult<Resolution>;

  /// Binds a URL to the id it eventually produced, so future resolutions of the same request
  /// return `Available` instead of re-fetching.
  fn register_resolved_url(&self, url: &str, id: &str);

  /// Registers a bare id as known (used for preloaded modules, which have no URL).
  fn register_id(&self, id: &str);

  /// Reverses [`Resolver::register_resolved_url`]; called by `unload`/`clear_error`.
  fn unregister_url(&self, url: &str);
}

/// The built-in [`Resolver`]: requests double as URLs until proven otherwise, and a request is
/// `Available` once either the request itself or a URL that previously resolved to it has been
/// registered.
#[derive(Debug, Default)]
pub struct DefaultResolver {
  known_urls: RefCell<HashMap<String, String>>,
  known_ids: RefCell<HashSet<String>>,
}

impl DefaultResolver {
  pub fn new() -> Self {
    Self::default()
  }

  /// Exposes the URL→id bindings so callers (or tests) can inspect what survived an `unload`.
  pub fn known_urls(&self) -> HashMap<String, String> {
    self.known_urls.borrow().clone()
  }
}

impl Resolver for DefaultResolver {
  fn resolve(
    &self,
    request: &str,
    _parent_id: Option<&str>,
    _version_ranges: &VersionRanges,
  ) -> AnyResult<Resolution> {
    if self.known_ids.borrow().contains(request) {
      return Ok(Resolution::Available {
        id: request.to_string(),
      });
    }
    if let Some(id) = self.known_urls.borrow().get(request) {
      return Ok(Resolution::Available { id: id.clone() });
    }
    Ok(Resolution::NeedFetch {
      url: request.to_string(),
    })
  }

  fn register_resolved_url(&self, url: &str, id: &str) {
    self
      .known_urls
      .borrow_mut()
      .insert(url.to_string(), id.to_string());
    self.known_ids.borrow_mut().insert(id.to_string());
  }

  fn register_id(&self, id: &str) {
    self.known_ids.borrow_mut().insert(id.to_string());
  }

  fn unregister_url(&self, url: &str) {
    if let Some(id) = self.known_urls.borrow_mut().remove(url) {
      self.known_ids.borrow_mut().remove(&id);
    }
  }
}
