//! Everything tied to the external VMM process: spawning/signaling it
//! ([`process`]) and talking to its HTTP-over-UDS control API ([`client`]).

pub mod client;
pub mod process;
