//! NAT / session table for UDP flows
//!
//! Full-cone: a session is keyed by the client's source endpoint only, so
//! every destination that source talks to shares one upstream socket.
//!
//! # Single-flight dial
//!
//! ```text
//! packet(K) --lock(K) open--> park on the lock queue
//!     |
//!     no open lock
//!     v
//! get(K) hit --> forward
//!     |
//!     miss
//!     v
//! get_or_create_lock(K) --existed--> park, or get(K) again if the queue closed
//!     |
//!     created
//!     v
//! dial --> set(K) --> forward own packet --> drain queue in order
//!      --> drop DialGuard (close queue, delete lock, wake waiters)
//! ```

mod lock;
mod table;

pub use lock::{DialGuard, DialLock, Pending};
pub use table::{lock_key, NatTable};
