//! The guest-initiated vsock wire protocol ([`protocol`]), the host-side
//! multi-port listener that speaks it ([`listener`]), and the line-framed
//! serial fallback ([`serial`]) used when vsock registration doesn't arrive
//! in time (spec §4.4/§4.5).

pub mod listener;
pub mod protocol;
pub mod serial;
