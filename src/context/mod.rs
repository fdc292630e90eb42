//! Context chain: serial lanes, per-context object graphs, and the save
//! cascade that moves pending changes toward the store.

pub mod base;
pub mod graph;
pub mod lane;
pub mod main;
pub mod object;
pub mod root;

pub use base::{GraphChange, SaveEvent};
pub use graph::{Graph, SharedGraph};
pub use lane::Lane;
pub use main::MainContext;
pub use object::Object;
pub use root::RootContext;
