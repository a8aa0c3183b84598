//! Build session integration

pub mod lifecycle;

pub use lifecycle::{BuildSession, RootBuildListener};
