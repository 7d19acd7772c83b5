//! Protocol definitions shared by the game server, the list server and
//! clients: byte order packing, message framing, type codes, player state
//! packing, the decoded event model, the list-server game info string and
//! list server addresses.

pub mod events;
pub mod framing;
pub mod gameinfo;
pub mod list_url;
pub mod player_state;
pub mod protocol;
pub mod wire;

pub use events::{DecodeError, GameEvent, ScoreRecord};
pub use framing::{
    encode_frame, next_frame, Frame, FrameBuffer, FrameError, FrameStatus, OwnedFrame,
    HEADER_LEN, MAX_PACKET_LEN, MAX_PAYLOAD_LEN,
};
pub use gameinfo::GameInfo;
pub use list_url::ListServerUrl;
pub use player_state::PlayerState;
pub use protocol::PlayerIndex;
pub use wire::{Pack, Vec3, WireReader};
