pub mod api;
pub mod event;
pub mod records;

pub use api::*;
pub use event::*;
pub use records::*;
