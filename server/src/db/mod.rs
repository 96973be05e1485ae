//! Persistence backends.

mod backend;
mod memory;
mod pool;
mod postgres;

pub use backend::*;
pub use memory::*;
pub use pool::*;
pub use postgres::*;
