//! Changeset Gate - dependency-ordered builds across repositories, gated on a
//! consistent result.
//!
//! A change set is one branch name shared by open pull requests in several
//! repositories. The library runs a statically declared graph of remote build
//! jobs against that branch and publishes a merge-eligibility status on every
//! member revision, but only if nothing changed while the graph ran.

pub mod config;
pub mod dag;
pub mod gate;
pub mod github;
pub mod orchestrator;
pub mod persistence;
pub mod platform;
pub mod server;
pub mod trigger;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;
