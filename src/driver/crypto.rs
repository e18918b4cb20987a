//! Encryption schemes supported by the voice service's secure RTP negotiation.

use aes_gcm::{
    aead::{generic_array::GenericArray, AeadInPlace, KeyInit},
    Aes256Gcm,
};
use byteorder::{ByteOrder, NetworkEndian};
use chacha20poly1305::XChaCha20Poly1305;
use crypto_secretbox::XSalsa20Poly1305;
use discortp::{MutablePacket, Packet};
use std::{error::Error as StdError, fmt};

/// Byte length of the symmetric key for every supported mode.
pub const KEY_SIZE: usize = 32;

/// Byte length of the Poly1305/GHASH authentication tag.
pub const TAG_SIZE: usize = 16;

/// Byte length of the plaintext counter suffix used by the `_rtpsize` modes.
pub const NONCE_SUFFIX_SIZE: usize = 4;

/// Widest nonce used by any mode (XChaCha20 and XSalsa20).
const WIDE_NONCE_SIZE: usize = 24;

/// Fixed RTP header length; the nonce source for the legacy mode.
const RTP_HEADER_SIZE: usize = 12;

/// Variants of the AEAD framing negotiated with the voice server.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CryptoMode {
    /// AES-256-GCM, with a 32-bit counter nonce appended (in clear) to each
    /// packet.
    ///
    /// Nonce width of 4B (32b), at an extra 4B per packet (~0.2 kB/s).
    Aes256Gcm,
    /// XChaCha20-Poly1305, with a 32-bit counter nonce appended (in clear)
    /// to each packet.
    ///
    /// Nonce width of 4B (32b), at an extra 4B per packet (~0.2 kB/s).
    XChaCha20Poly1305,
    /// Legacy XSalsa20-Poly1305. The RTP header is used as the source of
    /// nonce bytes for the packet at no extra packet overhead: the RTP
    /// sequence number and timestamp are the varying quantities.
    XSalsa20Poly1305,
}

/// Preference order used during mode negotiation.
const MODE_PREFERENCE: [CryptoMode; 3] = [
    CryptoMode::Aes256Gcm,
    CryptoMode::XChaCha20Poly1305,
    CryptoMode::XSalsa20Poly1305,
];

impl CryptoMode {
    /// Returns the name of a mode as it will appear during negotiation.
    #[must_use]
    pub fn to_request_str(self) -> &'static str {
        match self {
            Self::Aes256Gcm => "aead_aes256_gcm_rtpsize",
            Self::XChaCha20Poly1305 => "aead_xchacha20_poly1305_rtpsize",
            Self::XSalsa20Poly1305 => "xsalsa20_poly1305",
        }
    }

    /// Maps a negotiation string back onto a mode.
    #[must_use]
    pub fn from_request_str(value: &str) -> Option<Self> {
        MODE_PREFERENCE
            .into_iter()
            .find(|m| m.to_request_str() == value)
    }

    /// Picks the client's mode from the server's offered set.
    ///
    /// `preferred` is tried first, then the remaining modes in default
    /// preference order (strongest AEAD first, legacy last).
    #[must_use]
    pub fn negotiate<S: AsRef<str>>(offered: &[S], preferred: Self) -> Option<Self> {
        let offers = |mode: Self| {
            offered
                .iter()
                .any(|o| o.as_ref() == mode.to_request_str())
        };

        if offers(preferred) {
            return Some(preferred);
        }

        MODE_PREFERENCE.into_iter().find(|m| offers(*m))
    }

    /// Returns the AEAD nonce width of this mode.
    #[must_use]
    pub fn nonce_size(self) -> usize {
        match self {
            Self::Aes256Gcm => 12,
            Self::XChaCha20Poly1305 | Self::XSalsa20Poly1305 => WIDE_NONCE_SIZE,
        }
    }

    /// Returns the number of bytes occupied by the encryption scheme which
    /// fall after the payload.
    #[must_use]
    pub fn payload_suffix_len(self) -> usize {
        match self {
            Self::Aes256Gcm | Self::XChaCha20Poly1305 => NONCE_SUFFIX_SIZE,
            Self::XSalsa20Poly1305 => 0,
        }
    }

    /// Calculates the number of additional bytes required compared to an
    /// unencrypted payload.
    #[must_use]
    pub fn payload_overhead(self) -> usize {
        TAG_SIZE + self.payload_suffix_len()
    }

    /// Decrypts an RTP packet in place using the given cipher, returning the
    /// plaintext length.
    ///
    /// On success the plaintext occupies the first returned-length bytes of
    /// the packet payload. Failures leave the session untouched: the caller
    /// drops the packet and counts it.
    pub(crate) fn decrypt_in_place(
        self,
        packet: &mut impl MutablePacket,
        cipher: &Cipher,
    ) -> Result<usize, CryptoError> {
        let header_len = packet.packet().len() - packet.payload().len();
        let (header, body) = packet.packet_mut().split_at_mut(header_len);

        if body.len() < self.payload_overhead() {
            return Err(CryptoError::Malformed);
        }

        let mut nonce = [0u8; WIDE_NONCE_SIZE];
        let body = match self {
            Self::Aes256Gcm | Self::XChaCha20Poly1305 => {
                let ct_end = body.len() - NONCE_SUFFIX_SIZE;
                let n = self.nonce_size();
                nonce[n - NONCE_SUFFIX_SIZE..n].copy_from_slice(&body[ct_end..]);
                &mut body[..ct_end]
            },
            Self::XSalsa20Poly1305 => {
                // Zero-padded fixed header; csrc/extension words never feed
                // the nonce.
                nonce[..RTP_HEADER_SIZE].copy_from_slice(&header[..RTP_HEADER_SIZE]);
                body
            },
        };

        let ct_len = body.len() - TAG_SIZE;
        let (data, tag) = body.split_at_mut(ct_len);

        cipher.decrypt(&nonce[..self.nonce_size()], self.aad(header), data, tag)?;

        Ok(ct_len)
    }

    /// The associated data authenticated alongside the payload.
    ///
    /// The secretbox construction has no AAD channel, so the legacy mode
    /// relies on the header-as-nonce binding instead.
    fn aad(self, header: &[u8]) -> &[u8] {
        match self {
            Self::Aes256Gcm | Self::XChaCha20Poly1305 => header,
            Self::XSalsa20Poly1305 => b"",
        }
    }
}

/// Errors produced while encrypting or decrypting RTP packets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CryptoError {
    /// A packet failed authentication during decryption.
    DecryptFailed,
    /// A packet or buffer was too small for the negotiated layout.
    Malformed,
    /// The 32-bit nonce counter is spent; the session must be closed
    /// before any counter value repeats.
    NonceExhausted,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DecryptFailed => write!(f, "packet failed authentication"),
            Self::Malformed => write!(f, "packet too small for encryption layout"),
            Self::NonceExhausted => write!(f, "nonce counter exhausted"),
        }
    }
}

impl StdError for CryptoError {}

impl From<aes_gcm::aead::Error> for CryptoError {
    fn from(_: aes_gcm::aead::Error) -> Self {
        Self::DecryptFailed
    }
}

/// A keyed cipher for one of the supported modes.
#[derive(Clone)]
pub enum Cipher {
    #[allow(missing_docs)]
    Aes256Gcm(Aes256Gcm),
    #[allow(missing_docs)]
    XChaCha20Poly1305(XChaCha20Poly1305),
    #[allow(missing_docs)]
    XSalsa20Poly1305(XSalsa20Poly1305),
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mode().to_request_str())
    }
}

impl Cipher {
    /// Builds a cipher for `mode` from the server-supplied key.
    pub fn new(mode: CryptoMode, key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::Malformed);
        }

        Ok(match mode {
            CryptoMode::Aes256Gcm => Self::Aes256Gcm(
                Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Malformed)?,
            ),
            CryptoMode::XChaCha20Poly1305 => Self::XChaCha20Poly1305(
                XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Malformed)?,
            ),
            CryptoMode::XSalsa20Poly1305 => Self::XSalsa20Poly1305(
                XSalsa20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Malformed)?,
            ),
        })
    }

    /// The mode this cipher was keyed for.
    #[must_use]
    pub fn mode(&self) -> CryptoMode {
        match self {
            Self::Aes256Gcm(_) => CryptoMode::Aes256Gcm,
            Self::XChaCha20Poly1305(_) => CryptoMode::XChaCha20Poly1305,
            Self::XSalsa20Poly1305(_) => CryptoMode::XSalsa20Poly1305,
        }
    }

    fn encrypt(
        &self,
        nonce: &[u8],
        aad: &[u8],
        buffer: &mut [u8],
        tag_out: &mut [u8],
    ) -> Result<(), CryptoError> {
        let tag = match self {
            Self::Aes256Gcm(c) =>
                c.encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buffer)?,
            Self::XChaCha20Poly1305(c) =>
                c.encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buffer)?,
            Self::XSalsa20Poly1305(c) =>
                c.encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buffer)?,
        };

        tag_out.copy_from_slice(tag.as_slice());
        Ok(())
    }

    fn decrypt(
        &self,
        nonce: &[u8],
        aad: &[u8],
        buffer: &mut [u8],
        tag: &[u8],
    ) -> Result<(), CryptoError> {
        match self {
            Self::Aes256Gcm(c) => c.decrypt_in_place_detached(
                GenericArray::from_slice(nonce),
                aad,
                buffer,
                GenericArray::from_slice(tag),
            )?,
            Self::XChaCha20Poly1305(c) => c.decrypt_in_place_detached(
                GenericArray::from_slice(nonce),
                aad,
                buffer,
                GenericArray::from_slice(tag),
            )?,
            Self::XSalsa20Poly1305(c) => c.decrypt_in_place_detached(
                GenericArray::from_slice(nonce),
                aad,
                buffer,
                GenericArray::from_slice(tag),
            )?,
        }

        Ok(())
    }
}

/// Per-session encryption state: the mode plus its nonce counter.
///
/// The counter is independent of the RTP sequence, increments once per
/// encrypted packet, and never repeats within a session. Rekeying (a new
/// session description) replaces this state wholesale.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CryptoState {
    mode: CryptoMode,
    counter: u32,
    exhausted: bool,
}

impl From<CryptoMode> for CryptoState {
    fn from(mode: CryptoMode) -> Self {
        Self {
            mode,
            counter: 0,
            exhausted: false,
        }
    }
}

impl CryptoState {
    /// Returns the underlying (stateless) type of the active crypto mode.
    #[must_use]
    pub fn kind(&self) -> CryptoMode {
        self.mode
    }

    /// Number of nonces handed out so far (equals packets encrypted).
    #[must_use]
    pub fn nonces_used(&self) -> u64 {
        u64::from(self.counter) + u64::from(self.exhausted)
    }

    fn next_nonce(&mut self) -> Result<u32, CryptoError> {
        if self.exhausted {
            return Err(CryptoError::NonceExhausted);
        }

        let value = self.counter;
        match self.counter.checked_add(1) {
            Some(next) => self.counter = next,
            None => self.exhausted = true,
        }

        Ok(value)
    }

    /// Encrypts an RTP packet in place, filling in the tag and (for the
    /// `_rtpsize` modes) the plaintext nonce suffix.
    ///
    /// `payload_len` is the plaintext length already written at the start of
    /// the packet payload; the returned value is the final payload length
    /// including tag and suffix.
    pub fn encrypt_in_place(
        &mut self,
        packet: &mut impl MutablePacket,
        cipher: &Cipher,
        payload_len: usize,
    ) -> Result<usize, CryptoError> {
        let mode = self.mode;
        let header_len = packet.packet().len() - packet.payload().len();
        let (header, body) = packet.packet_mut().split_at_mut(header_len);

        let total = payload_len + mode.payload_overhead();
        if body.len() < total {
            return Err(CryptoError::Malformed);
        }

        let mut nonce = [0u8; WIDE_NONCE_SIZE];
        match mode {
            CryptoMode::Aes256Gcm | CryptoMode::XChaCha20Poly1305 => {
                let counter = self.next_nonce()?;
                let n = mode.nonce_size();
                NetworkEndian::write_u32(&mut nonce[n - NONCE_SUFFIX_SIZE..n], counter);
                NetworkEndian::write_u32(
                    &mut body[payload_len + TAG_SIZE..total],
                    counter,
                );
            },
            CryptoMode::XSalsa20Poly1305 => {
                nonce[..RTP_HEADER_SIZE].copy_from_slice(&header[..RTP_HEADER_SIZE]);
            },
        }

        let (data, rest) = body.split_at_mut(payload_len);
        cipher.encrypt(
            &nonce[..mode.nonce_size()],
            mode.aad(header),
            data,
            &mut rest[..TAG_SIZE],
        )?;

        Ok(total)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::constants::RTP_PROFILE_TYPE;
    use discortp::rtp::{MutableRtpPacket, RtpPacket};

    const MODES: [CryptoMode; 3] = MODE_PREFERENCE;

    fn filled_packet(buf: &mut [u8], payload: &[u8]) -> usize {
        let mut pkt = MutableRtpPacket::new(buf).unwrap();
        pkt.set_version(2);
        pkt.set_payload_type(RTP_PROFILE_TYPE);
        pkt.set_sequence(17u16.into());
        pkt.set_timestamp(960u32.into());
        pkt.set_ssrc(0xDEAD_BEEF);
        pkt.payload_mut()[..payload.len()].copy_from_slice(payload);
        payload.len()
    }

    #[test]
    fn symmetric_encrypt_decrypt() {
        const TRUE_PAYLOAD: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];

        for mode in MODES {
            let cipher = Cipher::new(mode, &[7u8; KEY_SIZE]).unwrap();
            let mut state = CryptoState::from(mode);

            let mut buf =
                [0u8; RtpPacket::minimum_packet_size() + TRUE_PAYLOAD.len() + TAG_SIZE + 4];
            let payload_len = filled_packet(&mut buf, &TRUE_PAYLOAD);

            let mut pkt = MutableRtpPacket::new(&mut buf[..]).unwrap();
            let total = state
                .encrypt_in_place(&mut pkt, &cipher, payload_len)
                .unwrap();
            assert_eq!(total, payload_len + mode.payload_overhead());

            let wire_len = RtpPacket::minimum_packet_size() + total;
            let mut pkt = MutableRtpPacket::new(&mut buf[..wire_len]).unwrap();
            let plain_len = mode.decrypt_in_place(&mut pkt, &cipher).unwrap();

            assert_eq!(plain_len, TRUE_PAYLOAD.len());
            let pkt = RtpPacket::new(&buf[..wire_len]).unwrap();
            assert_eq!(&pkt.payload()[..plain_len], &TRUE_PAYLOAD[..]);
        }
    }

    #[test]
    fn ciphertext_differs_from_plaintext() {
        const TRUE_PAYLOAD: [u8; 16] = [0x55; 16];

        for mode in MODES {
            let cipher = Cipher::new(mode, &[1u8; KEY_SIZE]).unwrap();
            let mut state = CryptoState::from(mode);

            let mut buf =
                [0u8; RtpPacket::minimum_packet_size() + TRUE_PAYLOAD.len() + TAG_SIZE + 4];
            let payload_len = filled_packet(&mut buf, &TRUE_PAYLOAD);

            let mut pkt = MutableRtpPacket::new(&mut buf[..]).unwrap();
            state
                .encrypt_in_place(&mut pkt, &cipher, payload_len)
                .unwrap();

            let pkt = RtpPacket::new(&buf[..]).unwrap();
            assert_ne!(&pkt.payload()[..TRUE_PAYLOAD.len()], &TRUE_PAYLOAD[..]);
        }
    }

    #[test]
    fn tampered_packets_fail_authentication() {
        const TRUE_PAYLOAD: [u8; 8] = [9; 8];

        for mode in MODES {
            let cipher = Cipher::new(mode, &[3u8; KEY_SIZE]).unwrap();
            let mut state = CryptoState::from(mode);

            let mut buf =
                [0u8; RtpPacket::minimum_packet_size() + TRUE_PAYLOAD.len() + TAG_SIZE + 4];
            let payload_len = filled_packet(&mut buf, &TRUE_PAYLOAD);

            let mut pkt = MutableRtpPacket::new(&mut buf[..]).unwrap();
            let total = state
                .encrypt_in_place(&mut pkt, &cipher, payload_len)
                .unwrap();
            let wire_len = RtpPacket::minimum_packet_size() + total;

            // Flip one bit of the tag.
            buf[RtpPacket::minimum_packet_size() + payload_len] ^= 1;

            let mut pkt = MutableRtpPacket::new(&mut buf[..wire_len]).unwrap();
            assert_eq!(
                mode.decrypt_in_place(&mut pkt, &cipher),
                Err(CryptoError::DecryptFailed)
            );
        }
    }

    #[test]
    fn small_packet_decrypts_error() {
        let mut buf = [0u8; RtpPacket::minimum_packet_size()];
        let mut pkt = MutableRtpPacket::new(&mut buf[..]).unwrap();

        for mode in MODES {
            let cipher = Cipher::new(mode, &[1u8; KEY_SIZE]).unwrap();
            // AIM: should error, and not panic.
            assert_eq!(
                mode.decrypt_in_place(&mut pkt, &cipher),
                Err(CryptoError::Malformed)
            );
        }
    }

    #[test]
    fn nonces_never_repeat() {
        let mut state = CryptoState::from(CryptoMode::Aes256Gcm);
        let mut seen = std::collections::HashSet::new();

        for _ in 0..1024 {
            assert!(seen.insert(state.next_nonce().unwrap()));
        }
        assert_eq!(state.nonces_used(), 1024);
    }

    #[test]
    fn counter_exhaustion_is_fatal_not_wrapping() {
        let mut state = CryptoState {
            mode: CryptoMode::XChaCha20Poly1305,
            counter: u32::MAX - 1,
            exhausted: false,
        };

        assert_eq!(state.next_nonce(), Ok(u32::MAX - 1));
        assert_eq!(state.next_nonce(), Ok(u32::MAX));
        assert_eq!(state.next_nonce(), Err(CryptoError::NonceExhausted));
        assert_eq!(state.next_nonce(), Err(CryptoError::NonceExhausted));
    }

    #[test]
    fn negotiation_prefers_strongest_offered() {
        let offered = vec![
            "xsalsa20_poly1305".to_string(),
            "aead_xchacha20_poly1305_rtpsize".to_string(),
        ];
        assert_eq!(
            CryptoMode::negotiate(&offered, CryptoMode::Aes256Gcm),
            Some(CryptoMode::XChaCha20Poly1305)
        );

        let offered = vec!["aead_aes256_gcm_rtpsize".to_string()];
        assert_eq!(
            CryptoMode::negotiate(&offered, CryptoMode::XSalsa20Poly1305),
            Some(CryptoMode::Aes256Gcm)
        );

        let offered = vec!["something_else".to_string()];
        assert_eq!(CryptoMode::negotiate(&offered, CryptoMode::Aes256Gcm), None);
    }
}
