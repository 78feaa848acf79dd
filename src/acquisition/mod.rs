//! Device acquisition: packet composition, shared serial sessions, VE.Direct.

pub mod device;
pub mod packet_cache;
pub mod registry;
pub mod session;
pub mod vedirect;

pub use device::{DeviceError, MockDevice, MockStep, PacketReader};
pub use packet_cache::PacketCache;
pub use registry::SessionRegistry;
pub use session::{RawReading, SerialSession, SessionConfig};
pub use vedirect::{FrameParser, VeDirectSerial};
