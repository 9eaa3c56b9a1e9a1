pub mod backend;
pub mod error;
pub mod kp;
pub mod wire;

pub use backend::{Backend, BackendId, Registry};
pub use error::{BackendError, KpError, WireError};
pub use kp::{Kp, KpMode};
