//! The `A01` message frame used by the vendor's appliance family on the MQTT session.
//!
//! ```text
//! "A01" | seq: u32 | random: u32 | timestamp: u32 | protocol: u16 | len: u16 | payload | crc32: u32
//! ```
//!
//! All integers are big endian. The payload is AES-128-CBC encrypted with the device local key;
//! the IV is derived from the frame's `random` field. The trailing CRC-32 covers every byte
//! before it.

use aes::cipher::{BlockDecryptMut as _, BlockEncryptMut as _, KeyIvInit as _, block_padding::Pkcs7};
use md5::Digest as _;
use tokio_util::bytes::{Buf as _, BufMut as _, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

const VERSION: &[u8; 3] = b"A01";
const IV_SALT: &str = "726f626f726f636b2d67a6d6da";
const HEADER_LEN: usize = 3 + 4 + 4 + 4 + 2 + 2;
const CRC_LEN: usize = 4;

pub const RPC_REQUEST: u16 = 101;
pub const RPC_RESPONSE: u16 = 102;

/// Data point id under which the list of queried fields is sent.
pub const ID_QUERY: u32 = 10000;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("frame does not start with the A01 version tag")]
    Version,
    #[error("frame checksum mismatch (expected {expected:#010x}, computed {computed:#010x})")]
    Checksum { expected: u32, computed: u32 },
    #[error("device local key must be 16 bytes long, not {0}")]
    LocalKey(usize),
    #[error("payload could not be decrypted")]
    Decrypt,
    #[error("payload of {0} bytes does not fit into a frame")]
    PayloadTooLarge(usize),
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub seq: u32,
    pub random: u32,
    pub timestamp: u32,
    pub protocol: u16,
    /// Plaintext payload, usually JSON.
    pub payload: Vec<u8>,
}

impl Message {
    /// An RPC request asking the device to report the given data points.
    pub fn query(seq: u32, random: u32, timestamp: u32, ids: impl IntoIterator<Item = u32>) -> Self {
        let list = ids.into_iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ");
        let payload = serde_json::json!({ "dps": { ID_QUERY.to_string(): format!("[{list}]") } });
        Self { seq, random, timestamp, protocol: RPC_REQUEST, payload: payload.to_string().into_bytes() }
    }
}

fn iv_for(random: u32) -> [u8; 16] {
    let digest = format!("{:x}", md5::Md5::digest(format!("{random:08x}{IV_SALT}").as_bytes()));
    let mut iv = [0; 16];
    iv.copy_from_slice(&digest.as_bytes()[8..24]);
    iv
}

/// Encodes and decodes A01 frames for one device.
#[derive(Clone)]
pub struct A01Codec {
    local_key: [u8; 16],
}

impl A01Codec {
    pub fn new(local_key: &str) -> Result<Self, Error> {
        let local_key = <[u8; 16]>::try_from(local_key.as_bytes())
            .map_err(|_| Error::LocalKey(local_key.len()))?;
        Ok(Self { local_key })
    }

    fn encrypt(&self, random: u32, plaintext: &[u8]) -> Vec<u8> {
        Aes128CbcEnc::new(&self.local_key.into(), &iv_for(random).into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    fn decrypt(&self, random: u32, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        Aes128CbcDec::new(&self.local_key.into(), &iv_for(random).into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| Error::Decrypt)
    }
}

impl Encoder<&Message> for A01Codec {
    type Error = std::io::Error;
    fn encode(&mut self, msg: &Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = self.encrypt(msg.random, &msg.payload);
        let len = u16::try_from(payload.len()).map_err(|_| Error::PayloadTooLarge(payload.len()))?;
        let start = dst.len();
        dst.reserve(HEADER_LEN + payload.len() + CRC_LEN);
        dst.put_slice(VERSION);
        dst.put_u32(msg.seq);
        dst.put_u32(msg.random);
        dst.put_u32(msg.timestamp);
        dst.put_u16(msg.protocol);
        dst.put_u16(len);
        dst.put_slice(&payload);
        let crc = crc32fast::hash(&dst[start..]);
        dst.put_u32(crc);
        trace!(message = "encoded A01 frame", seq = msg.seq, protocol = msg.protocol, len);
        Ok(())
    }
}

impl Decoder for A01Codec {
    type Item = Message;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        if &src[..3] != VERSION {
            return Err(Error::Version.into());
        }
        let Some((header, rest)) = src.split_first_chunk::<HEADER_LEN>() else {
            return Ok(None);
        };
        let payload_len = usize::from(u16::from_be_bytes([header[17], header[18]]));
        let Some((payload, rest)) = rest.split_at_checked(payload_len) else {
            return Ok(None);
        };
        let Some((crc, _)) = rest.split_first_chunk::<CRC_LEN>() else {
            return Ok(None);
        };
        let expected = u32::from_be_bytes(*crc);
        let computed = crc32fast::hash(&src[..HEADER_LEN + payload_len]);
        if expected != computed {
            return Err(Error::Checksum { expected, computed }.into());
        }
        let mut header = &header[3..];
        let seq = header.get_u32();
        let random = header.get_u32();
        let timestamp = header.get_u32();
        let protocol = header.get_u16();
        let payload = self.decrypt(random, payload)?;
        src.advance(HEADER_LEN + payload_len + CRC_LEN);
        trace!(message = "decoded A01 frame", seq, protocol, len = payload.len());
        Ok(Some(Message { seq, random, timestamp, protocol, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0123456789abcdef";

    #[test]
    fn query_payload_lists_ids() {
        let msg = Message::query(1, 2, 3, [203, 204, 220]);
        let payload: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(payload, serde_json::json!({ "dps": { "10000": "[203, 204, 220]" } }));
        assert_eq!(msg.protocol, RPC_REQUEST);
    }

    #[test]
    fn frame_layout() {
        let mut codec = A01Codec::new(KEY).unwrap();
        let msg = Message::query(0x01020304, 0x0a0b0c0d, 0x11223344, [203]);
        let mut buf = BytesMut::new();
        codec.encode(&msg, &mut buf).unwrap();
        assert_eq!(&buf[..3], b"A01");
        assert_eq!(&buf[3..7], &[1, 2, 3, 4]);
        assert_eq!(&buf[7..11], &[0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(&buf[15..17], &RPC_REQUEST.to_be_bytes());
        let len = usize::from(u16::from_be_bytes([buf[17], buf[18]]));
        assert_eq!(len % 16, 0);
        assert_eq!(buf.len(), HEADER_LEN + len + CRC_LEN);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let mut codec = A01Codec::new(KEY).unwrap();
        let mut buf = BytesMut::new();
        codec.encode(&Message::query(1, 2, 3, [203]), &mut buf).unwrap();
        let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn corrupted_frame_is_rejected() {
        let mut codec = A01Codec::new(KEY).unwrap();
        let mut buf = BytesMut::new();
        codec.encode(&Message::query(1, 2, 3, [203]), &mut buf).unwrap();
        buf[HEADER_LEN] ^= 0xff;
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn local_key_must_be_sixteen_bytes() {
        assert!(matches!(A01Codec::new("short"), Err(Error::LocalKey(5))));
    }
}
