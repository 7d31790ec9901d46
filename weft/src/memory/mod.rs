//! Time-ordered ID generation shared by the context store and eval store.

mod uuid6;

pub use uuid6::{uuid6, uuid6_with_params, Uuid6};
