//! Fetching module source.

use crate::resolver::VersionRanges;
use async_trait::async_trait;

/// A module's static dependency list, or the UMD sentinel meaning the real list is only known
/// once the module's `define()` call runs during compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependencies {
  List(Vec<String>),
  Umd,
}

/// What a [`Fetcher`] returns for a single URL.
#[derive(Debug, Clone)]
pub struct FetchResult {
  pub url: String,
  pub id: String,
  pub code: String,
  pub dependencies: Dependencies,
  pub dependency_version_ranges: VersionRanges,
  pub css: Option<String>,
}

/// Context passed alongside a fetch, letting a real fetcher make origin/permission decisions.
#[derive(Debug, Clone, Default)]
pub struct FetchContext {
  pub required_by_id: Option<String>,
  pub original_request: Option<String>,
}

/// Retrieves module source for a URL. `?Send` because the loader is single-threaded cooperative
/// (module wrappers are `Rc`-based, not `Arc`-based; see the concurrency notes in the module
/// docs), so fetchers never need to cross a thread boundary.
#[async_trait(?Send)]
pub trait Fetcher {
  async fn fetch(&self, url: &str, ctx: FetchContext) -> anyhow::Result<FetchResult>;
}
