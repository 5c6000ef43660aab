pub mod errors;
pub mod telemetry;
pub mod types;

pub use errors::{ClientError, ClientResult, ErrorCode};
pub use types::*;
