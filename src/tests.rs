//! Testing utils (should be only used in unit tests).

#[cfg(test)]
pub mod fixtures;
