//! Obfuscated packet codec.
//!
//! Wire format (all integers big-endian):
//! ```text
//! ┌──────────────┬────────────┬──────────────┬───────────┬────────────┬────────────────────┬─────────────┐
//! │ Padding (P)  │ Decoy IP 4 │ Decoy Port 2 │ Nonce 12  │ Length 2   │ Ciphertext‖Tag (L) │ Trailer 8   │
//! └──────────────┴────────────┴──────────────┴───────────┴────────────┴────────────────────┴─────────────┘
//! ```
//!
//! `P = 4 + (key[0] mod 13)` is fixed for a session. The padding length is not
//! transmitted as a field: the receiver recovers it as `4 + (byte0 mod 13)`,
//! so the encoder rewrites the first padding byte to a random value with the
//! matching residue. The trailer repeats the last 8 bytes of the sealed block
//! and is never checked on decode; like the padding and decoy fields it only
//! shapes the byte pattern on the wire.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::crypto::random::random_byte_with_residue;
use crate::crypto::{ciphertext_len, random_padding, Aead, AeadKey, Nonce, SecureRandom, NONCE_SIZE};
use crate::error::{Error, Result};

/// Minimum padding length
pub const PADDING_BASE: usize = 4;

/// Padding length varies over `PADDING_BASE..PADDING_BASE + PADDING_MODULUS`
pub const PADDING_MODULUS: u8 = 13;

/// Decoy "IP address" field size
pub const DECOY_ADDR_SIZE: usize = 4;

/// Decoy "port" field size
pub const DECOY_PORT_SIZE: usize = 2;

/// Length field size
pub const LENGTH_SIZE: usize = 2;

/// Trailing copy of the sealed block's last bytes
pub const TRAILER_SIZE: usize = 8;

/// Smallest input `decode` will look at.
pub const MIN_PACKET_SIZE: usize = 26;

/// Largest sealed block the length field can describe.
pub const MAX_SEALED_LEN: usize = u16::MAX as usize;

const DECOY_SIZE: usize = DECOY_ADDR_SIZE + DECOY_PORT_SIZE;

/// Padding length announced by a packet's first byte.
pub fn padding_len_for(first_byte: u8) -> usize {
    PADDING_BASE + (first_byte % PADDING_MODULUS) as usize
}

/// Bytes from the start of a frame up to and including the length field.
fn header_len(padding_len: usize) -> usize {
    padding_len + DECOY_SIZE + NONCE_SIZE + LENGTH_SIZE
}

/// Packet codec bound to one session key.
pub struct PacketCodec {
    aead: Aead,
    padding_len: usize,
}

impl PacketCodec {
    /// Create a codec for the given session key.
    pub fn new(key: &AeadKey) -> Self {
        Self {
            aead: Aead::new(key),
            padding_len: padding_len_for(key.first_byte()),
        }
    }

    /// Padding length used for every packet this codec encodes.
    pub fn padding_len(&self) -> usize {
        self.padding_len
    }

    /// Total wire size of a packet carrying `plaintext_len` bytes.
    pub fn encoded_len(&self, plaintext_len: usize) -> usize {
        header_len(self.padding_len) + ciphertext_len(plaintext_len) + TRAILER_SIZE
    }

    /// Wrap a plaintext payload into an obfuscated wire packet.
    pub fn encode(&self, plaintext: &[u8]) -> Result<Bytes> {
        if ciphertext_len(plaintext.len()) > MAX_SEALED_LEN {
            return Err(Error::PayloadTooLarge(plaintext.len()));
        }

        let nonce = Nonce::random();
        let sealed = self.aead.seal(&nonce, plaintext)?;

        let mut buf = BytesMut::with_capacity(self.encoded_len(plaintext.len()));

        let mut padding = random_padding(self.padding_len);
        padding[0] = random_byte_with_residue(
            (self.padding_len - PADDING_BASE) as u8,
            PADDING_MODULUS,
        );
        buf.put_slice(&padding);

        buf.put_slice(&SecureRandom::bytes::<DECOY_ADDR_SIZE>());
        buf.put_slice(&SecureRandom::bytes::<DECOY_PORT_SIZE>());
        buf.put_slice(nonce.as_bytes());
        buf.put_u16(sealed.len() as u16);
        buf.put_slice(&sealed);
        buf.put_slice(&sealed[sealed.len() - TRAILER_SIZE..]);

        Ok(buf.freeze())
    }

    /// Recover the plaintext from a wire packet.
    ///
    /// # Errors
    ///
    /// - [`Error::PacketTooShort`] below [`MIN_PACKET_SIZE`]
    /// - [`Error::InvalidStructure`] when nonce, length or ciphertext run past
    ///   the end of the input
    /// - [`Error::DecryptFailed`] when authentication fails
    pub fn decode(&self, packet: &[u8]) -> Result<Vec<u8>> {
        if packet.len() < MIN_PACKET_SIZE {
            return Err(Error::PacketTooShort {
                minimum: MIN_PACKET_SIZE,
                actual: packet.len(),
            });
        }

        let nonce_start = padding_len_for(packet[0]) + DECOY_SIZE;
        let nonce_end = nonce_start + NONCE_SIZE;
        let nonce = packet
            .get(nonce_start..nonce_end)
            .and_then(Nonce::from_slice)
            .ok_or(Error::InvalidStructure("nonce exceeds packet"))?;

        let length_end = nonce_end + LENGTH_SIZE;
        let length = match packet.get(nonce_end..length_end) {
            Some(&[hi, lo]) => u16::from_be_bytes([hi, lo]) as usize,
            _ => return Err(Error::InvalidStructure("length field exceeds packet")),
        };

        let sealed = packet
            .get(length_end..length_end + length)
            .ok_or(Error::InvalidStructure("ciphertext exceeds packet"))?;

        self.aead.open(&nonce, sealed)
    }
}

/// Encode `plaintext` under `key`.
pub fn encode(plaintext: &[u8], key: &AeadKey) -> Result<Bytes> {
    PacketCodec::new(key).encode(plaintext)
}

/// Decode `packet` under `key`.
pub fn decode(packet: &[u8], key: &AeadKey) -> Result<Vec<u8>> {
    PacketCodec::new(key).decode(packet)
}

/// Read one whole wire packet from a byte stream.
///
/// The frame is self-describing: the first byte gives the padding length,
/// the length field gives the sealed block size, and the trailer follows.
/// Returns `Ok(None)` on a clean end of stream at a frame boundary.
pub async fn read_packet<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let first = match reader.read_u8().await {
        Ok(byte) => byte,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Network(e)),
    };

    let header = header_len(padding_len_for(first));
    let mut frame = vec![0u8; header];
    frame[0] = first;
    reader.read_exact(&mut frame[1..]).await?;

    let length = u16::from_be_bytes([frame[header - 2], frame[header - 1]]) as usize;
    frame.resize(header + length + TRAILER_SIZE, 0);
    reader.read_exact(&mut frame[header..]).await?;

    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KEY_SIZE, TAG_SIZE};

    fn key_with_first(byte: u8) -> AeadKey {
        let mut bytes = [0x5au8; KEY_SIZE];
        bytes[0] = byte;
        AeadKey::from_bytes(bytes)
    }

    #[test]
    fn test_roundtrip_every_padding_length() {
        for first in 0..PADDING_MODULUS {
            let key = key_with_first(first);
            let packet = encode(b"ping", &key).unwrap();
            assert_eq!(decode(&packet, &key).unwrap(), b"ping");
        }
    }

    #[test]
    fn test_roundtrip_random_keys_and_sizes() {
        for size in [0usize, 1, 15, 16, 17, 255, 1200, 4096] {
            let key = AeadKey::generate();
            let payload: Vec<u8> = (0..size).map(|i| (i * 7) as u8).collect();
            let packet = encode(&payload, &key).unwrap();
            assert_eq!(decode(&packet, &key).unwrap(), payload);
        }
    }

    #[test]
    fn test_layout() {
        let key = key_with_first(200);
        let codec = PacketCodec::new(&key);
        // 200 mod 13 = 5
        assert_eq!(codec.padding_len(), 9);

        let packet = codec.encode(b"hello").unwrap();
        assert_eq!(packet.len(), codec.encoded_len(5));
        assert_eq!(padding_len_for(packet[0]), 9);

        let length_at = 9 + DECOY_SIZE + NONCE_SIZE;
        let length = u16::from_be_bytes([packet[length_at], packet[length_at + 1]]) as usize;
        assert_eq!(length, 5 + TAG_SIZE);

        let sealed_end = length_at + LENGTH_SIZE + length;
        assert_eq!(&packet[sealed_end..], &packet[sealed_end - TRAILER_SIZE..sealed_end]);
    }

    #[test]
    fn test_padding_length_is_constant_per_session() {
        let codec = PacketCodec::new(&key_with_first(3));
        let sizes: Vec<usize> = (0..20).map(|_| codec.encode(b"abc").unwrap().len()).collect();
        assert!(sizes.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_decoy_bytes_vary() {
        let codec = PacketCodec::new(&key_with_first(0));
        let a = codec.encode(b"same").unwrap();
        let b = codec.encode(b"same").unwrap();
        assert_eq!(a.len(), b.len());
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = AeadKey::generate();
        let codec = PacketCodec::new(&key);
        let packet = codec.encode(b"tamper me please").unwrap();

        let start = header_len(codec.padding_len());
        let end = start + ciphertext_len(16);
        for i in start..end {
            let mut tampered = packet.to_vec();
            tampered[i] ^= 0x01;
            assert!(matches!(codec.decode(&tampered), Err(Error::DecryptFailed)));
        }
    }

    #[test]
    fn test_trailer_is_not_checked() {
        let key = AeadKey::generate();
        let codec = PacketCodec::new(&key);
        let mut packet = codec.encode(b"payload").unwrap().to_vec();
        let len = packet.len();
        for byte in &mut packet[len - TRAILER_SIZE..] {
            *byte ^= 0xff;
        }
        assert_eq!(codec.decode(&packet).unwrap(), b"payload");
    }

    #[test]
    fn test_too_short() {
        let key = AeadKey::generate();
        for len in 0..MIN_PACKET_SIZE {
            let result = decode(&vec![0u8; len], &key);
            assert!(matches!(result, Err(Error::PacketTooShort { actual, .. }) if actual == len));
        }
    }

    #[test]
    fn test_invalid_structure() {
        let key = AeadKey::generate();

        // padding 16: nonce would end at 34
        let mut packet = vec![0u8; 30];
        packet[0] = 12;
        assert!(matches!(
            decode(&packet, &key),
            Err(Error::InvalidStructure("nonce exceeds packet"))
        ));

        // padding 8: nonce ends exactly at 26, no room for the length
        let mut packet = vec![0u8; MIN_PACKET_SIZE];
        packet[0] = 4;
        assert!(matches!(
            decode(&packet, &key),
            Err(Error::InvalidStructure("length field exceeds packet"))
        ));

        // padding 4: length claims far more than is present
        let mut packet = vec![0u8; MIN_PACKET_SIZE];
        packet[0] = 26;
        packet[22] = 0xff;
        packet[23] = 0xff;
        assert!(matches!(
            decode(&packet, &key),
            Err(Error::InvalidStructure("ciphertext exceeds packet"))
        ));
    }

    #[test]
    fn test_wrong_key() {
        let packet = encode(b"secret", &key_with_first(1)).unwrap();
        let mut other = [0x11u8; KEY_SIZE];
        other[0] = 1;
        let result = decode(&packet, &AeadKey::from_bytes(other));
        assert!(matches!(result, Err(Error::DecryptFailed)));
    }

    #[test]
    fn test_payload_too_large() {
        let key = AeadKey::generate();
        let payload = vec![0u8; MAX_SEALED_LEN];
        assert!(matches!(encode(&payload, &key), Err(Error::PayloadTooLarge(_))));

        let largest = vec![0u8; MAX_SEALED_LEN - TAG_SIZE];
        assert!(encode(&largest, &key).is_ok());
    }

    #[tokio::test]
    async fn test_read_packet_frames_back_to_back() {
        let key = AeadKey::generate();
        let codec = PacketCodec::new(&key);
        let first = codec.encode(b"one").unwrap();
        let second = codec.encode(b"second packet").unwrap();

        let mut stream = Vec::new();
        stream.extend_from_slice(&first);
        stream.extend_from_slice(&second);
        let mut reader = &stream[..];

        let a = read_packet(&mut reader).await.unwrap().unwrap();
        let b = read_packet(&mut reader).await.unwrap().unwrap();
        assert_eq!(a, first.to_vec());
        assert_eq!(codec.decode(&b).unwrap(), b"second packet");
        assert!(read_packet(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_packet_truncated() {
        let key = AeadKey::generate();
        let packet = encode(b"cut short", &key).unwrap();
        let mut reader = &packet[..packet.len() - 3];
        assert!(matches!(read_packet(&mut reader).await, Err(Error::Network(_))));
    }
}
