//! Traffic obfuscation layer.
//!
//! Applied on top of the outer TLS stream so payload sizes and structure
//! resist pattern analysis even where the outer channel terminates early:
//!
//! 1. **Packet codec**: random padding, decoy address/port fields, AEAD
//!    sealing with a fresh nonce, and a camouflage trailer
//! 2. **Fragmenter**: each encoded packet is written as timed fragments

mod fragment;
mod packet;

pub use fragment::{
    split_fragments, FragmentConfig, Fragmenter, DEFAULT_FRAGMENT_COUNT, DEFAULT_FRAGMENT_DELAY,
};
pub use packet::{
    decode, encode, padding_len_for, read_packet, PacketCodec, DECOY_ADDR_SIZE, DECOY_PORT_SIZE,
    LENGTH_SIZE, MAX_SEALED_LEN, MIN_PACKET_SIZE, PADDING_BASE, PADDING_MODULUS, TRAILER_SIZE,
};
