pub mod aggregate;
pub mod options;
pub mod predicate;
pub mod sort;

pub use aggregate::{AggregateFunction, AggregateQuery, AggregateRow, SelectTarget};
pub use options::FetchOptions;
pub use predicate::{CompareOp, Operand, Predicate};
pub use sort::SortDescriptor;
