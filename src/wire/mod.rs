//! Packet protocol: typed, uniquely-identified messages and the tagged
//! plain-data wire format they travel in.

pub mod packet;
pub mod registry;

pub use packet::{Packet, PacketIds, VOID_PACKET_ID};
pub use registry::{DecodeFn, WireRegistry};
