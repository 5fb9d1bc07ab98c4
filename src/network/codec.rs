//! Message Codec
//!
//! Turns a [`NetworkMessage`] into a binary frame and back.
//!
//! ```text
//! frame = [flags: u8] [body]
//! body  = encrypt?( compress?( serialize(message) ) )
//! ```
//!
//! `flags` bit 0 marks LZ4 compression, bit 1 marks AES-128-CBC/PKCS7
//! encryption. Every decode failure is a typed [`CodecError`]; the caller
//! drops the message and carries on.

use aes::Aes128;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use thiserror::Error;

use crate::config::{ConfigError, SyncConfig, WireFormat};
use crate::network::protocol::NetworkMessage;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Frame flag: body is LZ4-compressed.
pub const FLAG_COMPRESSED: u8 = 0x01;

/// Frame flag: body is encrypted.
pub const FLAG_ENCRYPTED: u8 = 0x02;

const KNOWN_FLAGS: u8 = FLAG_COMPRESSED | FLAG_ENCRYPTED;

/// Upper bound on a decompressed body (16 MiB).
pub const MAX_DECOMPRESSED_SIZE: usize = 16 * 1024 * 1024;

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Frame had no bytes.
    #[error("empty frame")]
    EmptyFrame,
    /// Flags byte has bits this codec does not understand.
    #[error("unknown frame flags: 0x{0:02X}")]
    UnknownFlags(u8),
    /// Encryption is required but the frame is plaintext.
    #[error("plaintext frame rejected: encryption required")]
    EncryptionRequired,
    /// Encrypted frame but no key configured.
    #[error("encrypted frame but no key configured")]
    MissingKey,
    /// Decryption or unpadding failed.
    #[error("decryption failed")]
    Decrypt,
    /// LZ4 decompression failed.
    #[error("decompression failed: {0}")]
    Decompress(String),
    /// Body did not deserialize into a message.
    #[error("malformed message: {0}")]
    Malformed(String),
    /// Message could not be serialized.
    #[error("encode failed: {0}")]
    Encode(String),
    /// Typed payload could not be (de)serialized.
    #[error("invalid payload: {0}")]
    Payload(String),
}

impl CodecError {
    pub(crate) fn payload(e: serde_json::Error) -> Self {
        CodecError::Payload(e.to_string())
    }
}

/// Pre-shared AES key and IV.
#[derive(Clone)]
struct CipherKey {
    key: [u8; 16],
    iv: [u8; 16],
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Only a fingerprint, never the key itself
        write!(f, "CipherKey({}..)", hex::encode(&self.key[..2]))
    }
}

/// Frame encoder/decoder.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    format: WireFormat,
    compression_threshold: Option<usize>,
    cipher: Option<CipherKey>,
}

impl MessageCodec {
    /// Plain codec: no compression, no encryption.
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            compression_threshold: None,
            cipher: None,
        }
    }

    /// Build the codec described by a configuration.
    pub fn from_config(config: &SyncConfig) -> Result<Self, ConfigError> {
        let mut codec = Self::new(config.wire_format);
        if config.compression {
            codec = codec.with_compression(config.compression_threshold);
        }
        if config.encryption {
            let (key, iv) = config.key_material()?;
            codec = codec.with_encryption(key, iv);
        }
        Ok(codec)
    }

    /// Compress bodies of at least `threshold` bytes.
    pub fn with_compression(mut self, threshold: usize) -> Self {
        self.compression_threshold = Some(threshold);
        self
    }

    /// Encrypt every frame; reject plaintext frames on decode.
    pub fn with_encryption(mut self, key: [u8; 16], iv: [u8; 16]) -> Self {
        self.cipher = Some(CipherKey { key, iv });
        self
    }

    /// Whether frames are encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encode a message into a frame.
    pub fn encode(&self, message: &NetworkMessage) -> Result<Vec<u8>, CodecError> {
        let mut body = match self.format {
            WireFormat::Json => {
                serde_json::to_vec(message).map_err(|e| CodecError::Encode(e.to_string()))?
            }
            WireFormat::Binary => {
                bincode::serialize(message).map_err(|e| CodecError::Encode(e.to_string()))?
            }
        };
        let mut flags = 0u8;

        if let Some(threshold) = self.compression_threshold {
            if body.len() >= threshold {
                body = compress_prepend_size(&body);
                flags |= FLAG_COMPRESSED;
            }
        }

        if let Some(cipher) = &self.cipher {
            let enc = Aes128CbcEnc::new_from_slices(&cipher.key, &cipher.iv)
                .map_err(|e| CodecError::Encode(e.to_string()))?;
            body = enc.encrypt_padded_vec_mut::<Pkcs7>(&body);
            flags |= FLAG_ENCRYPTED;
        }

        let mut frame = Vec::with_capacity(1 + body.len());
        frame.push(flags);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode a frame into a message. Atomic: the whole frame or an error.
    pub fn decode(&self, frame: &[u8]) -> Result<NetworkMessage, CodecError> {
        let (&flags, body) = frame.split_first().ok_or(CodecError::EmptyFrame)?;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(CodecError::UnknownFlags(flags));
        }

        let mut body = body.to_vec();

        if flags & FLAG_ENCRYPTED != 0 {
            let cipher = self.cipher.as_ref().ok_or(CodecError::MissingKey)?;
            let dec = Aes128CbcDec::new_from_slices(&cipher.key, &cipher.iv)
                .map_err(|_| CodecError::Decrypt)?;
            body = dec
                .decrypt_padded_vec_mut::<Pkcs7>(&body)
                .map_err(|_| CodecError::Decrypt)?;
        } else if self.cipher.is_some() {
            return Err(CodecError::EncryptionRequired);
        }

        if flags & FLAG_COMPRESSED != 0 {
            let declared = body
                .get(..4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
                .ok_or_else(|| CodecError::Decompress("missing size prefix".into()))?;
            if declared > MAX_DECOMPRESSED_SIZE {
                return Err(CodecError::Decompress(format!(
                    "declared size {declared} exceeds limit"
                )));
            }
            body = decompress_size_prepended(&body)
                .map_err(|e| CodecError::Decompress(e.to_string()))?;
        }

        self.deserialize(&body)
    }

    /// Decode a WebSocket text frame (plain JSON, unencrypted only).
    pub fn decode_text(&self, text: &str) -> Result<NetworkMessage, CodecError> {
        if self.cipher.is_some() {
            return Err(CodecError::EncryptionRequired);
        }
        serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    fn deserialize(&self, body: &[u8]) -> Result<NetworkMessage, CodecError> {
        match self.format {
            WireFormat::Json => {
                serde_json::from_slice(body).map_err(|e| CodecError::Malformed(e.to_string()))
            }
            WireFormat::Binary => {
                bincode::deserialize(body).map_err(|e| CodecError::Malformed(e.to_string()))
            }
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(WireFormat::Json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::math::Vec3;
    use crate::network::protocol::{MessageType, MovementSample};
    use proptest::prelude::*;

    const KEY: [u8; 16] = [7; 16];
    const IV: [u8; 16] = [9; 16];

    fn sample_message() -> NetworkMessage {
        NetworkMessage::movement("session-a", &MovementSample::at(Vec3::new(1.0, 2.0, 3.0)))
            .unwrap()
    }

    fn all_codecs() -> Vec<MessageCodec> {
        let mut codecs = Vec::new();
        for format in [WireFormat::Json, WireFormat::Binary] {
            codecs.push(MessageCodec::new(format));
            codecs.push(MessageCodec::new(format).with_compression(0));
            codecs.push(MessageCodec::new(format).with_encryption(KEY, IV));
            codecs.push(MessageCodec::new(format).with_compression(0).with_encryption(KEY, IV));
        }
        codecs
    }

    #[test]
    fn test_roundtrip_every_pipeline() {
        let msg = sample_message();
        for codec in all_codecs() {
            let frame = codec.encode(&msg).unwrap();
            assert_eq!(codec.decode(&frame).unwrap(), msg, "codec {:?}", codec);
        }
    }

    #[test]
    fn test_small_body_not_compressed() {
        let codec = MessageCodec::new(WireFormat::Json).with_compression(10_000);
        let frame = codec.encode(&sample_message()).unwrap();
        assert_eq!(frame[0] & FLAG_COMPRESSED, 0);
    }

    #[test]
    fn test_large_body_compressed() {
        let codec = MessageCodec::new(WireFormat::Binary).with_compression(64);
        let msg = NetworkMessage::new(MessageType::Chat, "s", vec![b'a'; 4096]);
        let frame = codec.encode(&msg).unwrap();
        assert_eq!(frame[0] & FLAG_COMPRESSED, FLAG_COMPRESSED);
        assert!(frame.len() < 4096);
        assert_eq!(codec.decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_empty_frame() {
        let codec = MessageCodec::default();
        assert_eq!(codec.decode(&[]), Err(CodecError::EmptyFrame));
    }

    #[test]
    fn test_unknown_flags() {
        let codec = MessageCodec::default();
        assert_eq!(codec.decode(&[0x80, b'{']), Err(CodecError::UnknownFlags(0x80)));
    }

    #[test]
    fn test_malformed_body() {
        let codec = MessageCodec::default();
        let frame = [0u8, b'{', b'x'];
        assert!(matches!(codec.decode(&frame), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_truncated_ciphertext() {
        let codec = MessageCodec::default().with_encryption(KEY, IV);
        let frame = codec.encode(&sample_message()).unwrap();
        let truncated = &frame[..frame.len() - 3];
        assert_eq!(codec.decode(truncated), Err(CodecError::Decrypt));
    }

    #[test]
    fn test_wrong_key_fails() {
        let sender = MessageCodec::default().with_encryption(KEY, IV);
        let receiver = MessageCodec::default().with_encryption([1; 16], IV);
        let frame = sender.encode(&sample_message()).unwrap();
        assert!(receiver.decode(&frame).is_err());
    }

    #[test]
    fn test_plaintext_rejected_when_encrypted() {
        let plain = MessageCodec::default();
        let secure = MessageCodec::default().with_encryption(KEY, IV);
        let frame = plain.encode(&sample_message()).unwrap();
        assert_eq!(secure.decode(&frame), Err(CodecError::EncryptionRequired));
        assert_eq!(secure.decode_text("{}"), Err(CodecError::EncryptionRequired));
    }

    #[test]
    fn test_encrypted_frame_without_key() {
        let secure = MessageCodec::default().with_encryption(KEY, IV);
        let plain = MessageCodec::default();
        let frame = secure.encode(&sample_message()).unwrap();
        assert_eq!(plain.decode(&frame), Err(CodecError::MissingKey));
    }

    #[test]
    fn test_decode_text() {
        let codec = MessageCodec::default();
        let msg = sample_message();
        let text = serde_json::to_string(&msg).unwrap();
        assert_eq!(codec.decode_text(&text).unwrap(), msg);
    }

    fn arb_type() -> impl Strategy<Value = MessageType> {
        prop_oneof![
            Just(MessageType::Connect),
            Just(MessageType::Disconnect),
            Just(MessageType::PlayerSpawn),
            Just(MessageType::Movement),
            Just(MessageType::Action),
            Just(MessageType::WorldState),
            Just(MessageType::Damage),
            Just(MessageType::ResourceUpdate),
            Just(MessageType::Chat),
        ]
    }

    proptest! {
        #[test]
        fn prop_codec_roundtrip(
            message_type in arb_type(),
            sender in "[a-z0-9-]{0,40}",
            timestamp in any::<i64>(),
            payload in proptest::collection::vec(any::<u8>(), 0..512),
            pipeline in 0usize..8,
        ) {
            let msg = NetworkMessage { message_type, sender_id: sender, timestamp, payload };
            let codec = all_codecs().swap_remove(pipeline);
            let frame = codec.encode(&msg).unwrap();
            let decoded = codec.decode(&frame).unwrap();
            prop_assert_eq!(&decoded, &msg);
            prop_assert_eq!(codec.encode(&decoded).unwrap(), frame);
        }

        #[test]
        fn prop_garbage_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            for codec in all_codecs() {
                let _ = codec.decode(&bytes);
            }
        }
    }
}
