//! Query template engine (spec section 4.3).

mod builder;

pub use builder::{Bind, FinalizedQuery, QueryBuilder};
