//! Remote walk protocol
//!
//! A [`Sender`] streams one STAT packet per entry of its tree, followed by
//! an empty STAT. The [`RemoteFs`] receiver hands that metadata to its walk
//! callback and pulls file content on demand with REQ packets, which the
//! sender answers with DATA chunks ending in an empty DATA. Every STAT
//! implicitly takes the next sequential id, starting at 0. The receiver ends
//! the exchange with FIN; either side aborts with ERR.

pub mod codec;
pub mod pipe;
pub mod receiver;
pub mod sender;

pub use codec::{framed, framed_with_config, Packet, PacketCodec, PacketSink, PacketStream};
pub use pipe::PipeReader;
pub use receiver::RemoteFs;
pub use sender::Sender;
