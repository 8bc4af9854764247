pub mod error;
pub mod row;
pub mod value;

pub use error::{DbError, Result};
pub use row::{QueryResult, Row};
pub use value::Value;
