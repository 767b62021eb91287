#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::TC_ACT_PIPE,
    macros::{classifier, map},
    maps::RingBuf,
    programs::TcContext,
};
use core::ptr;
use network_types::eth::{EthHdr, EtherType};
use pktscope_common::{RawHeaderEvent, CAPTURE_LEN, STAGE_POST_ROUTING, STAGE_PRE_ROUTING};

#[no_mangle]
#[link_section = "license"]
pub static _license: [u8; 4] = *b"GPL\0";

#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(256 * 1024, 0);

/// Ingress hook: frames are seen before the routing decision.
#[classifier]
pub fn pktscope_ingress(ctx: TcContext) -> i32 {
    capture(&ctx, STAGE_PRE_ROUTING)
}

/// Egress hook: frames are seen after the routing decision.
#[classifier]
pub fn pktscope_egress(ctx: TcContext) -> i32 {
    capture(&ctx, STAGE_POST_ROUTING)
}

/// Copy the leading header bytes of an IPv4 frame into the ring buffer.
///
/// Parsing is left to userspace. Every path returns `TC_ACT_PIPE`, so the
/// frame continues through the stack untouched whether or not it was copied.
/// Field writes go through raw pointers one at a time to avoid
/// compiler-generated `memcpy` calls in `.text`.
#[inline(always)]
fn capture(ctx: &TcContext, stage: u8) -> i32 {
    let data = ctx.data();
    let data_end = ctx.data_end();

    if data + EthHdr::LEN > data_end {
        return TC_ACT_PIPE;
    }
    let eth_hdr = data as *const EthHdr;
    let ether_type = unsafe { ptr::read_unaligned(ptr::addr_of!((*eth_hdr).ether_type)) };
    if ether_type != EtherType::Ipv4 {
        return TC_ACT_PIPE;
    }

    if let Some(mut buf) = EVENTS.reserve::<RawHeaderEvent>(0) {
        let p = buf.as_mut_ptr();
        let dst = unsafe {
            core::slice::from_raw_parts_mut(ptr::addr_of_mut!((*p).data) as *mut u8, CAPTURE_LEN)
        };
        // `load_bytes` clamps to the frame length, so short frames copy less.
        match ctx.load_bytes(EthHdr::LEN, dst) {
            Ok(copied) => {
                unsafe {
                    ptr::write(ptr::addr_of_mut!((*p).stage), stage);
                    ptr::write(ptr::addr_of_mut!((*p)._pad), 0);
                    ptr::write(ptr::addr_of_mut!((*p).len), copied as u16);
                }
                buf.submit(0);
            }
            Err(_) => buf.discard(0),
        }
    }

    TC_ACT_PIPE
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
