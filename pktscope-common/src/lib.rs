#![no_std]

/// Number of bytes copied from each frame, starting at the IPv4 header.
///
/// Covers a maximal IPv4 header (60 bytes) followed by a maximal TCP header
/// (60 bytes). Payload beyond that is never copied.
pub const CAPTURE_LEN: usize = 128;

/// Wire tag for frames seen on TC ingress, before the routing decision.
pub const STAGE_PRE_ROUTING: u8 = 0;
/// Wire tag for frames seen on TC egress, after the routing decision.
pub const STAGE_POST_ROUTING: u8 = 1;

/// Raw header bytes passed from the eBPF TC hooks to userspace via a RingBuf.
///
/// Parsing happens in userspace; the kernel side only copies bytes and tags
/// them with the interception stage.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawHeaderEvent {
    /// One of `STAGE_PRE_ROUTING` / `STAGE_POST_ROUTING`.
    pub stage: u8,
    /// Padding to maintain alignment.
    pub _pad: u8,
    /// Number of valid bytes in `data`.
    pub len: u16,
    /// Frame bytes starting at the IPv4 header.
    pub data: [u8; CAPTURE_LEN],
}

impl RawHeaderEvent {
    /// The captured bytes, clamped to the buffer size.
    pub fn bytes(&self) -> &[u8] {
        let len = (self.len as usize).min(CAPTURE_LEN);
        &self.data[..len]
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for RawHeaderEvent {}
