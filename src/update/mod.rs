//! Write path: transaction origins, private update contexts and the
//! handles their bodies receive.

pub mod context;
mod group;
pub mod handle;
pub mod origin;

pub use context::UpdateContext;
pub use handle::{UpdateHandle, WriteCapable};
pub use origin::{CommitNotice, OriginId, OriginOptions, OriginOrdering, OriginTarget, TransactionOrigin};
