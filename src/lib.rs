//! Session pipeline - end-to-end encrypted messaging over storage nodes
//!
//! Receives and sends Session protocol messages (X25519 + Ed25519 +
//! ChaCha20-Poly1305) and maintains closed-group membership and key history.

mod types;
mod keys;
mod crypto;
mod envelope;
mod content;
mod message;
mod groups;
mod config;
mod storage;
mod transport;
pub mod pow;
mod sender;
mod group_sender;
mod receiver;
mod group_handler;
mod messenger;

pub use types::*;
pub use keys::*;
pub use crypto::*;
pub use envelope::*;
pub use content::*;
pub use message::*;
pub use groups::*;
pub use config::*;
pub use storage::*;
pub use transport::*;
pub use sender::MessageSender;
pub use receiver::{MessageReceiver, ReceiveContext, ReceiveSource};
pub use messenger::Messenger;
