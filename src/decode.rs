//! Packet decryption and ALAC decoding.
//!
//! Payloads are optionally AES-128-CBC encrypted: all leading whole
//! blocks are ciphered, a tail of fewer than 16 bytes passes through
//! in the clear. Decoding goes through the [`StreamDecoder`] seam;
//! [`AlacStreamDecoder`] is the production implementation, built on
//! Symphonia's pure Rust ALAC codec.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use aes::Aes128;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions, CODEC_TYPE_ALAC};
use symphonia::core::formats::Packet;

use crate::error::PlayerError;

/// Largest encoded payload a packet may carry.
pub const MAX_PACKET: usize = 2048;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Decodes one packet's payload into interleaved stereo 16-bit PCM.
pub trait StreamDecoder: Send {
    /// Decode `packet` into `pcm`, returning the number of samples
    /// written. The pipeline rejects anything other than exactly one
    /// frame's worth.
    fn decode(&mut self, packet: &[u8], pcm: &mut [i16]) -> Result<usize, PlayerError>;
}

/// Session key material for encrypted streams.
#[derive(Clone)]
pub(crate) struct PacketCipher {
    key: [u8; 16],
    iv: [u8; 16],
}

impl PacketCipher {
    pub fn new(key: [u8; 16], iv: [u8; 16]) -> Self {
        Self { key, iv }
    }

    /// Decrypt whole blocks in place. The chain starts from a fresh
    /// copy of the session IV for every packet.
    fn decrypt_blocks(&self, buf: &mut [u8]) {
        let mut dec = Aes128CbcDec::new(&self.key.into(), &self.iv.into());
        for block in buf.chunks_exact_mut(16) {
            dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

/// ALAC decoder configured from the twelve fmtp values.
///
/// The fmtp table is, field for field, the ALAC magic cookie: frame
/// length, compatible version, bit depth, the three Rice parameters,
/// channel count, max run, max frame bytes, average bit rate and
/// sample rate. It is serialized big-endian and handed to Symphonia as
/// codec extra data.
pub struct AlacStreamDecoder {
    decoder: Box<dyn Decoder>,
    frame_samples: usize,
    sample_buf: Option<SampleBuffer<i16>>,
}

impl AlacStreamDecoder {
    pub fn new(fmtp: &[u32; 12]) -> Result<Self, PlayerError> {
        let frame_samples = fmtp[1] as usize;
        let sample_rate = fmtp[11];
        if frame_samples == 0 || sample_rate == 0 {
            return Err(PlayerError::UnsupportedFormat(fmtp[3]));
        }

        let cookie = magic_cookie(fmtp);
        let mut params = CodecParameters::new();
        params
            .for_codec(CODEC_TYPE_ALAC)
            .with_sample_rate(sample_rate)
            .with_extra_data(cookie.to_vec().into_boxed_slice());

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| PlayerError::Decode(e.to_string()))?;

        Ok(Self {
            decoder,
            frame_samples,
            sample_buf: None,
        })
    }
}

impl StreamDecoder for AlacStreamDecoder {
    fn decode(&mut self, packet: &[u8], pcm: &mut [i16]) -> Result<usize, PlayerError> {
        let packet = Packet::new_from_slice(0, 0, self.frame_samples as u64, packet);
        let decoded = self
            .decoder
            .decode(&packet)
            .map_err(|e| PlayerError::Decode(e.to_string()))?;

        let spec = *decoded.spec();
        let frames = decoded.frames();
        let samples = frames * spec.channels.count();

        let needs_alloc = match &self.sample_buf {
            Some(buf) => buf.capacity() < samples,
            None => true,
        };
        if needs_alloc {
            self.sample_buf = Some(SampleBuffer::new(frames as u64, spec));
        }
        let buf = self.sample_buf.as_mut().unwrap();
        buf.copy_interleaved_ref(decoded);

        let data = buf.samples();
        if data.len() > pcm.len() {
            return Err(PlayerError::DecodeMismatch {
                got: data.len(),
                expected: pcm.len(),
            });
        }
        pcm[..data.len()].copy_from_slice(data);
        Ok(data.len())
    }
}

/// Serialize the fmtp table as a 24-byte ALAC magic cookie.
fn magic_cookie(fmtp: &[u32; 12]) -> [u8; 24] {
    let mut cookie = [0u8; 24];
    cookie[0..4].copy_from_slice(&fmtp[1].to_be_bytes()); // frame length
    cookie[4] = fmtp[2] as u8; // compatible version
    cookie[5] = fmtp[3] as u8; // bit depth
    cookie[6] = fmtp[4] as u8; // rice history mult
    cookie[7] = fmtp[5] as u8; // rice initial history
    cookie[8] = fmtp[6] as u8; // rice k modifier
    cookie[9] = fmtp[7] as u8; // channels
    cookie[10..12].copy_from_slice(&(fmtp[8] as u16).to_be_bytes()); // max run
    cookie[12..16].copy_from_slice(&fmtp[9].to_be_bytes()); // max frame bytes
    cookie[16..20].copy_from_slice(&fmtp[10].to_be_bytes()); // average bit rate
    cookie[20..24].copy_from_slice(&fmtp[11].to_be_bytes()); // sample rate
    cookie
}

/// The full per-packet path: optional decrypt, then decode into a
/// slot's PCM buffer.
pub(crate) struct DecodePipeline {
    cipher: Option<PacketCipher>,
    decoder: Box<dyn StreamDecoder>,
    frame_samples: usize,
    scratch: Vec<u8>,
}

impl DecodePipeline {
    pub fn new(
        cipher: Option<PacketCipher>,
        decoder: Box<dyn StreamDecoder>,
        frame_samples: usize,
    ) -> Self {
        Self {
            cipher,
            decoder,
            frame_samples,
            scratch: vec![0u8; MAX_PACKET],
        }
    }

    /// Decrypt and decode one payload into `out`, which must hold at
    /// least one frame of stereo samples.
    pub fn decode_packet(&mut self, payload: &[u8], out: &mut [i16]) -> Result<(), PlayerError> {
        if payload.len() > MAX_PACKET {
            return Err(PlayerError::PacketTooLarge(payload.len()));
        }

        let expected = 2 * self.frame_samples;
        let written = if let Some(cipher) = &self.cipher {
            let buf = &mut self.scratch[..payload.len()];
            buf.copy_from_slice(payload);
            let whole_blocks = payload.len() & !0xf;
            cipher.decrypt_blocks(&mut buf[..whole_blocks]);
            self.decoder.decode(&self.scratch[..payload.len()], out)?
        } else {
            self.decoder.decode(payload, out)?
        };

        if written != expected {
            return Err(PlayerError::DecodeMismatch {
                got: written,
                expected,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncryptMut;

    type Aes128CbcEnc = cbc::Encryptor<Aes128>;

    /// Test decoder that checks what it was handed and emits silence.
    struct CaptureDecoder {
        frame_samples: usize,
        expected: Option<Vec<u8>>,
    }

    impl StreamDecoder for CaptureDecoder {
        fn decode(&mut self, packet: &[u8], pcm: &mut [i16]) -> Result<usize, PlayerError> {
            if let Some(expected) = &self.expected {
                assert_eq!(packet, &expected[..], "decoder saw wrong payload");
            }
            let n = 2 * self.frame_samples;
            pcm[..n].fill(0);
            Ok(n)
        }
    }

    fn encrypt(key: [u8; 16], iv: [u8; 16], plain: &[u8]) -> Vec<u8> {
        let mut data = plain.to_vec();
        let whole = plain.len() & !0xf;
        let mut enc = Aes128CbcEnc::new(&key.into(), &iv.into());
        for block in data[..whole].chunks_exact_mut(16) {
            enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        data
    }

    #[test]
    fn test_magic_cookie_layout() {
        let fmtp = [96, 352, 0, 16, 40, 10, 14, 2, 255, 0, 0, 44100];
        let cookie = magic_cookie(&fmtp);
        assert_eq!(&cookie[0..4], &352u32.to_be_bytes());
        assert_eq!(cookie[5], 16); // bit depth
        assert_eq!(cookie[9], 2); // channels
        assert_eq!(&cookie[20..24], &44100u32.to_be_bytes());
    }

    #[test]
    fn test_decrypt_recovers_plaintext_with_clear_tail() {
        let key = [7u8; 16];
        let iv = [3u8; 16];
        // 37 bytes: two whole blocks encrypted, 5-byte tail in the clear
        let plain: Vec<u8> = (0u8..37).collect();
        let wire = encrypt(key, iv, &plain);
        assert_ne!(&wire[..32], &plain[..32]);
        assert_eq!(&wire[32..], &plain[32..]);

        let mut pipeline = DecodePipeline::new(
            Some(PacketCipher::new(key, iv)),
            Box::new(CaptureDecoder {
                frame_samples: 4,
                expected: Some(plain),
            }),
            4,
        );
        let mut out = [0i16; 8];
        pipeline.decode_packet(&wire, &mut out).unwrap();
    }

    #[test]
    fn test_unencrypted_payload_passes_through() {
        let plain: Vec<u8> = (0u8..32).collect();
        let mut pipeline = DecodePipeline::new(
            None,
            Box::new(CaptureDecoder {
                frame_samples: 4,
                expected: Some(plain.clone()),
            }),
            4,
        );
        let mut out = [0i16; 8];
        pipeline.decode_packet(&plain, &mut out).unwrap();
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let mut pipeline = DecodePipeline::new(
            None,
            Box::new(CaptureDecoder {
                frame_samples: 4,
                expected: None,
            }),
            4,
        );
        let big = vec![0u8; MAX_PACKET + 1];
        let mut out = [0i16; 8];
        assert!(matches!(
            pipeline.decode_packet(&big, &mut out),
            Err(PlayerError::PacketTooLarge(_))
        ));
    }

    #[test]
    fn test_size_mismatch_detected() {
        struct ShortDecoder;
        impl StreamDecoder for ShortDecoder {
            fn decode(&mut self, _packet: &[u8], pcm: &mut [i16]) -> Result<usize, PlayerError> {
                pcm[..4].fill(0);
                Ok(4)
            }
        }
        let mut pipeline = DecodePipeline::new(None, Box::new(ShortDecoder), 352);
        let mut out = [0i16; 704];
        assert!(matches!(
            pipeline.decode_packet(&[0u8; 16], &mut out),
            Err(PlayerError::DecodeMismatch { got: 4, .. })
        ));
    }
}
