//! Host-side CSS injection.
//!
//! The only DOM coupling this engine has: a module that ships CSS gets exactly one style record,
//! keyed by id, whose text is replaced in place on every re-preparation.

use crate::prelude::*;
use std::cell::RefCell;

pub trait StyleSink {
  /// Inserts or replaces the style text associated with `id`.
  fn set_style(&self, id: &str, css: &str);

  /// Drops the style record for `id`, if any (called by `unload`).
  fn remove_style(&self, _id: &str) {}
}

/// A [`StyleSink`] that discards everything; the default for headless/non-browser embeddings.
#[derive(Debug, Default)]
pub struct NullStyleSink;

impl StyleSink for NullStyleSink {
  fn set_style(&self, _id: &str, _css: &str) {}
}

/// A [`StyleSink`] that records injected CSS in memory, for tests and non-browser hosts that
/// still want to observe what would have been injected.
#[derive(Debug, Default)]
pub struct RecordingStyleSink {
  styles: RefCell<HashMap<String, String>>,
}

impl RecordingStyleSink {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, id: &str) -> Option<String> {
    self.styles.borrow().get(id).cloned()
  }
}

impl StyleSink for RecordingStyleSink {
  fn set_style(&self, id: &str, css: &str) {
    self.styles.borrow_mut().insert(id.to_string(), css.to_string());
  }

  fn remove_style(&self, id: &str) {
    self.styles.borrow_mut().remove(id);
  }
}

#[cfg(test)]
mod style_tests;
