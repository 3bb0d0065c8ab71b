pub mod packet;
pub mod payload;
pub mod packet_builder;
pub mod capabilities;
pub mod command;
pub mod error_codes;
pub mod scramble;
pub mod handshake;
pub mod proxy_protocol;
pub mod reply;
pub mod tracker;

pub use self::packet::{Header, PacketReader, HEADER_LEN, MAX_PAYLOAD_LEN};
pub use self::payload::PayloadReader;
pub use self::packet_builder::PacketBuilder;
pub use self::command::Command;
pub use self::error_codes::ErrorCode;
pub use self::handshake::{InitialHandshake, HandshakeResponse, ChangeUserRequest, AuthSwitchRequest};
pub use self::proxy_protocol::{Subnet, ProxyHeader};
pub use self::reply::{Reply, ReplyState, ReplyError};
pub use self::tracker::ReplyTracker;
