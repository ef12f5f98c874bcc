pub mod protocol;
pub mod transport;

pub use protocol::{Request, Response};
