mod pool;
mod waiters;

pub use pool::{DisconnectListener, NodeSession, NodeView, SessionHandle, SessionPool};
pub use waiters::{CommandOutcome, CommandWaiters};
