//! A TFTP (RFC 1350) client and concurrent server: wire codec, the
//! Reader/Writer transfer state machine, server-side session demultiplexing,
//! and the client-side per-filename transfer lock.
//!
//! Out of scope (spec.md §1): netascii mode, RFC 2347/2348/2349/7440 option
//! negotiation, IPv6, authentication/encryption, and files larger than
//! 65535 blocks (~32 MiB).

pub mod client;
pub mod error;
pub mod lock;
pub mod packet;
pub mod server;
pub mod session;
pub mod table;

pub use error::{Error, ProtocolErrorCode};
pub use packet::Packet;
pub use session::{Outcome, Role, Session};
