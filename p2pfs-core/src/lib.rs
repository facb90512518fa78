//! p2pfs core: peer host with protocol-tagged streams, plus the chat, greeting
//! and file share exchanges that run over them.

pub mod address;
pub mod chat;
mod connection;
pub mod hello;
pub mod host;
pub mod identity;
pub mod protocol;
pub mod stream;
pub mod transfer;
pub mod wire;

pub use address::{AddressError, ListenAddress, PeerAddress, DEFAULT_LISTEN_ADDR};
pub use chat::{ChatError, ChatResponder, CHAT_ACK};
pub use hello::{HelloResponder, HELLO_GREETING};
pub use host::{Host, StreamHandler, TransportError};
pub use identity::{IdentityError, Keypair, PeerId, PublicKey};
pub use protocol::{CHAT_PROTOCOL, FILE_SHARE_PROTOCOL, HELLO_PROTOCOL, PROTOCOL_VERSION};
pub use stream::Stream;
pub use transfer::{
    CopyStats, FileRequester, FileResponder, ReceivedFile, TransferError, DEFAULT_CHUNK_SIZE,
    DEFAULT_RECEIVE_DIR, OPEN_ERROR,
};
