//! Built-in selection strategies, registered by name at first registry
//! access.

pub mod minimum_history;
pub mod random;
pub mod single_most_data;
