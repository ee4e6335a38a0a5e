//! Session identities and the rotating pool that owns them.

pub mod pool;
pub mod session;

pub use pool::{CreateSessionFn, SessionHandle, SessionPool, SessionPoolState};
pub use session::{Cookie, Session};
