//! OCB2-AES128: the authenticated cipher Mumble uses for UDP voice
//! datagrams. Each session gets one 128-bit key shared between client and
//! Edge (handed out in `CryptSetup`), plus two independent 128-bit IVs — one
//! for the direction this side encrypts, one for the direction it decrypts.
//! Every packet carries one plaintext IV byte plus a 3-byte truncated OCB
//! tag; the full IV is reconstructed from that single byte against the
//! receiver's own running counter, which is what lets the scheme tolerate
//! UDP's reordering and loss without carrying a full 16-byte IV on the wire.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::CryptoError;

const BLOCK: usize = 16;
/// 1 plaintext IV byte + a 3-byte truncated tag, per Mumble's wire format.
pub const OVERHEAD: usize = 4;
/// How many of the trailing decrypt history slots get checked as
/// "reasonably late but still acceptable" before a gap is an outright resync.
const HISTORY_LEN: usize = 0x100;

fn xor_block(dst: &mut [u8; BLOCK], src: &[u8; BLOCK]) {
    for i in 0..BLOCK {
        dst[i] ^= src[i];
    }
}

/// In-place double in GF(2^128) with the OCB reduction polynomial.
fn double(block: &mut [u8; BLOCK]) {
    let carry = block[0] >> 7;
    for i in 0..BLOCK - 1 {
        block[i] = (block[i] << 1) | (block[i + 1] >> 7);
    }
    block[BLOCK - 1] = (block[BLOCK - 1] << 1) ^ (carry * 0x87);
}

/// In-place `block ^= double(block)`, i.e. a "times 3" step in GF(2^128).
fn double_xor(block: &mut [u8; BLOCK]) {
    let mut doubled = *block;
    double(&mut doubled);
    xor_block(block, &doubled);
}

struct Prf {
    cipher: Aes128,
}

impl Prf {
    fn new(key: &[u8; BLOCK]) -> Self {
        Self {
            cipher: Aes128::new(key.into()),
        }
    }

    fn encrypt(&self, block: &mut [u8; BLOCK]) {
        self.cipher.encrypt_block(block.into());
    }

    fn decrypt(&self, block: &mut [u8; BLOCK]) {
        self.cipher.decrypt_block(block.into());
    }
}

/// Encrypt `plain` under `key`, using `nonce` as the OCB "R" value. Returns
/// `(ciphertext, tag)`. `plain` may be any length; OCB handles the final
/// partial block via the usual pad-with-encrypted-zero trick.
fn ocb_encrypt(prf: &Prf, plain: &[u8], nonce: &[u8; BLOCK]) -> (Vec<u8>, [u8; BLOCK]) {
    let mut delta = *nonce;
    prf.encrypt(&mut delta);

    let mut checksum = [0u8; BLOCK];
    let mut out = Vec::with_capacity(plain.len());
    let mut chunks = plain.chunks_exact(BLOCK);

    for chunk in &mut chunks {
        double(&mut delta);
        let mut tmp = [0u8; BLOCK];
        tmp.copy_from_slice(chunk);
        xor_block(&mut tmp, &delta);
        prf.encrypt(&mut tmp);
        xor_block(&mut tmp, &delta);
        for i in 0..BLOCK {
            checksum[i] ^= chunk[i];
        }
        out.extend_from_slice(&tmp);
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        double(&mut delta);
        let mut len_block = [0u8; BLOCK];
        len_block[BLOCK - 2..].copy_from_slice(&((remainder.len() as u16) * 8).to_be_bytes());
        xor_block(&mut len_block, &delta);
        let mut pad = len_block;
        prf.encrypt(&mut pad);

        let mut padded_plain = [0u8; BLOCK];
        padded_plain[..remainder.len()].copy_from_slice(remainder);
        padded_plain[remainder.len()..].copy_from_slice(&pad[remainder.len()..]);
        for i in 0..BLOCK {
            checksum[i] ^= padded_plain[i];
        }

        let mut cipher_partial = pad;
        xor_block(&mut cipher_partial, &padded_plain);
        out.extend_from_slice(&cipher_partial[..remainder.len()]);
    }

    double_xor(&mut delta);
    xor_block(&mut checksum, &delta);
    prf.encrypt(&mut checksum);

    (out, checksum)
}

fn ocb_decrypt(prf: &Prf, cipher: &[u8], nonce: &[u8; BLOCK]) -> (Vec<u8>, [u8; BLOCK]) {
    let mut delta = *nonce;
    prf.encrypt(&mut delta);

    let mut checksum = [0u8; BLOCK];
    let mut out = Vec::with_capacity(cipher.len());
    let mut chunks = cipher.chunks_exact(BLOCK);

    for chunk in &mut chunks {
        double(&mut delta);
        let mut tmp = [0u8; BLOCK];
        tmp.copy_from_slice(chunk);
        xor_block(&mut tmp, &delta);
        prf.decrypt(&mut tmp);
        xor_block(&mut tmp, &delta);
        for i in 0..BLOCK {
            checksum[i] ^= tmp[i];
        }
        out.extend_from_slice(&tmp);
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        double(&mut delta);
        let mut len_block = [0u8; BLOCK];
        len_block[BLOCK - 2..].copy_from_slice(&((remainder.len() as u16) * 8).to_be_bytes());
        xor_block(&mut len_block, &delta);
        // The partial-block pad is always produced with the forward
        // permutation (it's OCB's keystream-style tail, not a block to
        // invert), matching `ocb_encrypt`'s partial-block handling.
        let mut pad = len_block;
        prf.encrypt(&mut pad);

        let mut plain_partial = [0u8; BLOCK];
        for (i, &c) in remainder.iter().enumerate() {
            plain_partial[i] = c ^ pad[i];
        }
        plain_partial[remainder.len()..].copy_from_slice(&pad[remainder.len()..]);
        for i in 0..BLOCK {
            checksum[i] ^= plain_partial[i];
        }
        out.extend_from_slice(&plain_partial[..remainder.len()]);
    }

    double_xor(&mut delta);
    xor_block(&mut checksum, &delta);
    prf.encrypt(&mut checksum);

    (out, checksum)
}

/// Per-session OCB2 state: the shared key plus this side's independent
/// send/receive IVs. `good`/`late`/`lost`/`resync` mirror the counters
/// Mumble reports in `Ping`/`UserStats` for link-quality display.
pub struct CryptState {
    key: [u8; BLOCK],
    encrypt_iv: [u8; BLOCK],
    decrypt_iv: [u8; BLOCK],
    decrypt_history: [u8; HISTORY_LEN],
    prf: Prf,
    pub good: u32,
    pub late: u32,
    pub lost: u32,
    pub resync: u32,
}

impl CryptState {
    /// Generate a fresh random key and pair of IVs, as the Edge does when
    /// issuing a `CryptSetup` to a newly authenticated client.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut key = [0u8; BLOCK];
        let mut encrypt_iv = [0u8; BLOCK];
        let mut decrypt_iv = [0u8; BLOCK];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut encrypt_iv);
        rng.fill_bytes(&mut decrypt_iv);
        Self::from_parts(key, encrypt_iv, decrypt_iv)
    }

    pub fn from_parts(key: [u8; BLOCK], encrypt_iv: [u8; BLOCK], decrypt_iv: [u8; BLOCK]) -> Self {
        let prf = Prf::new(&key);
        Self {
            key,
            encrypt_iv,
            decrypt_iv,
            decrypt_history: [0u8; HISTORY_LEN],
            prf,
            good: 0,
            late: 0,
            lost: 0,
            resync: 0,
        }
    }

    pub fn key(&self) -> &[u8; BLOCK] {
        &self.key
    }

    pub fn encrypt_iv(&self) -> &[u8; BLOCK] {
        &self.encrypt_iv
    }

    pub fn decrypt_iv(&self) -> &[u8; BLOCK] {
        &self.decrypt_iv
    }

    fn bump_iv(iv: &mut [u8; BLOCK]) {
        for byte in iv.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }
    }

    /// Encrypt one voice packet's plaintext. Output is `1 + 3 + plain.len()`
    /// bytes: IV byte 0, truncated tag, ciphertext.
    pub fn encrypt(&mut self, plain: &[u8]) -> Vec<u8> {
        Self::bump_iv(&mut self.encrypt_iv);
        let (cipher, tag) = ocb_encrypt(&self.prf, plain, &self.encrypt_iv);

        let mut out = Vec::with_capacity(OVERHEAD + cipher.len());
        out.push(self.encrypt_iv[0]);
        out.extend_from_slice(&tag[..3]);
        out.extend_from_slice(&cipher);
        out
    }

    /// Decrypt one voice datagram, reconstructing the full IV from the
    /// single leading byte against this side's running decrypt IV and
    /// checking the truncated tag. Returns the plaintext, updating the
    /// good/late/lost/resync counters as a side effect.
    pub fn decrypt(&mut self, packet: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if packet.len() < OVERHEAD {
            return Err(CryptoError::DecryptFailed("packet shorter than overhead".into()));
        }

        let got_byte = packet[0];
        let tag_prefix = &packet[1..4];
        let cipher = &packet[4..];

        let mut candidate_iv = self.decrypt_iv;
        let expected_next = self.decrypt_iv[0].wrapping_add(1);

        if got_byte == expected_next {
            candidate_iv = self.decrypt_iv;
            Self::bump_iv(&mut candidate_iv);
        } else {
            let diff = got_byte.wrapping_sub(self.decrypt_iv[0]);
            if diff > 0 && diff < 0x80 {
                // A handful of packets ahead: fast-forward.
                candidate_iv = self.decrypt_iv;
                for _ in 0..diff {
                    Self::bump_iv(&mut candidate_iv);
                }
            } else {
                // Behind or far ahead: could be a stray late/reordered
                // packet. Try the single-byte-patched current IV and let
                // tag verification be the final word.
                candidate_iv[0] = got_byte;
            }
        }

        let (plain, tag) = ocb_decrypt(&self.prf, cipher, &candidate_iv);
        if &tag[..3] != tag_prefix {
            self.late += 1;
            return Err(CryptoError::DecryptFailed(
                "OCB tag mismatch, dropping desynced packet".into(),
            ));
        }

        let history_slot = (candidate_iv[0] as usize) % HISTORY_LEN;
        if self.decrypt_history[history_slot] == candidate_iv[1] {
            return Err(CryptoError::DecryptFailed("replayed voice packet".into()));
        }
        self.decrypt_history[history_slot] = candidate_iv[1];

        if candidate_iv[0] > self.decrypt_iv[0]
            || (candidate_iv[0] == 0 && self.decrypt_iv[0] == 0xFF)
        {
            let advanced = candidate_iv[0].wrapping_sub(self.decrypt_iv[0]);
            if advanced > 1 {
                self.lost += (advanced - 1) as u32;
            }
            self.decrypt_iv = candidate_iv;
            self.good += 1;
        } else {
            self.late += 1;
        }

        Ok(plain)
    }
}

impl Drop for CryptState {
    fn drop(&mut self) {
        self.key.zeroize();
        self.encrypt_iv.zeroize();
        self.decrypt_iv.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_states() -> (CryptState, CryptState) {
        let key = [7u8; BLOCK];
        let iv_a = [1u8; BLOCK];
        let iv_b = [2u8; BLOCK];
        // a's encrypt IV is b's decrypt IV, and vice versa, as the two
        // sides of one session agree via CryptSetup.
        let a = CryptState::from_parts(key, iv_a, iv_b);
        let b = CryptState::from_parts(key, iv_b, iv_a);
        (a, b)
    }

    #[test]
    fn roundtrips_a_full_block_multiple_payload() {
        let (mut a, mut b) = paired_states();
        let plain = vec![0x42u8; 32];
        let packet = a.encrypt(&plain);
        let decrypted = b.decrypt(&packet).unwrap();
        assert_eq!(decrypted, plain);
    }

    #[test]
    fn roundtrips_a_partial_block_payload() {
        let (mut a, mut b) = paired_states();
        let plain = vec![0xAAu8; 11];
        let packet = a.encrypt(&plain);
        let decrypted = b.decrypt(&packet).unwrap();
        assert_eq!(decrypted, plain);
    }

    #[test]
    fn sequential_packets_keep_counters_sane() {
        let (mut a, mut b) = paired_states();
        for i in 0..5u8 {
            let plain = vec![i; 20];
            let packet = a.encrypt(&plain);
            let decrypted = b.decrypt(&packet).unwrap();
            assert_eq!(decrypted, plain);
        }
        assert_eq!(b.good, 5);
        assert_eq!(b.lost, 0);
    }

    #[test]
    fn tampered_tag_is_rejected() {
        let (mut a, mut b) = paired_states();
        let mut packet = a.encrypt(b"hello world");
        packet[1] ^= 0xFF;
        assert!(b.decrypt(&packet).is_err());
    }

    #[test]
    fn truncated_packet_is_rejected() {
        let (_a, mut b) = paired_states();
        assert!(b.decrypt(&[0u8; 2]).is_err());
    }
}
