use bitflags::bitflags;

pub mod am;
pub mod handle;

pub use am::{AmHeader, AmStatus, TransportDesc, AM_HDR_SIZE};
pub use handle::{AsHandle, Handle};

bitflags! {
    /// Features negotiated when a worker engine is brought up.
    #[derive(Default)]
    pub struct Features: u32 {
        /// Byte-stream send/receive support.
        const STREAM = 0b00000001;
    }
}
