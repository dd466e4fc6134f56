//! Wire-protocol support: a restricted RESP2 encoder/decoder shared by the
//! inbound command listener and the outbound client used to talk to
//! monitored instances and peer Sentinels.

pub mod frame;

pub use frame::{RespFrame, RespFrameCodec};
