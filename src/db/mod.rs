//! DB Client (spec section 4.1).

mod client;

pub use client::{column_text, execute_in_tx, is_null, DbClient, RetryPolicy};
