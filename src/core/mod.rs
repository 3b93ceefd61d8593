pub mod error;
pub mod value;

pub use error::{DbError, DriverError, DriverErrorKind, Result};
pub use value::Value;
