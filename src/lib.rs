//! cinder: a Go-flavoured toolchain.
//!
//! Source text is lexed and shaped into execution order, compiled in a
//! single pass to stack bytecode and run on a frame-pointer VM. A
//! [`Session`] keeps the program, symbols and globals alive across
//! evaluations and can snapshot its globals with [`Session::dump`].

pub mod bytecode;
pub mod error;
pub mod frontend;
pub mod lang;
pub mod runtime;
pub mod session;
pub mod snapshot;

pub use error::Error;
pub use session::{Session, SessionConfig};
pub use snapshot::Dump;
