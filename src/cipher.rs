use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::{Error, Result};

/// AES block size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;

/// Fixed AES-128 key used to wrap flash contents.
///
/// Blocks are processed independently (ECB, no IV, no chaining) in ascending
/// offset order.
pub const AES_KEY: [u8; 16] = [
    0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0xFF, 0xEE,
    0xDD, 0xCC, 0xBB, 0xAA, 0xAA, 0xBB, 0xCC, 0xDD,
];

/// Number of whole AES blocks in `length` bytes.
///
/// Partial blocks are never padded, so a length which is not a multiple of
/// the block size is rejected.
pub fn block_count(length: usize) -> Result<usize> {
    if length % AES_BLOCK_SIZE != 0 {
        log::error!("Length {} is not a whole number of {}-byte blocks", length, AES_BLOCK_SIZE);
        return Err(Error::InvalidLength { length });
    }
    Ok(length / AES_BLOCK_SIZE)
}

/// Trait for block cipher engines, whether software or a hardware crypto block.
///
/// Each call processes exactly `blocks` 16-byte blocks from `input` into `output`.
/// Engines which need a key schedule set up and torn down must do so once around
/// all the blocks of a call.
pub trait CipherEngine {
    fn encrypt_blocks(&mut self, input: &[u8], output: &mut [u8], blocks: usize) -> Result<()>;
    fn decrypt_blocks(&mut self, input: &[u8], output: &mut [u8], blocks: usize) -> Result<()>;
}

/// Software AES-128 engine.
#[derive(Clone)]
pub struct SoftAes {
    key: [u8; 16],
}

impl SoftAes {
    /// Create an engine using the fixed `AES_KEY`.
    pub fn new() -> Self {
        Self::with_key(AES_KEY)
    }

    pub fn with_key(key: [u8; 16]) -> Self {
        SoftAes { key }
    }

    /// Check both buffers hold `blocks` whole blocks, returning the byte length.
    fn check_lengths(input: &[u8], output: &[u8], blocks: usize) -> Result<usize> {
        let length = match blocks.checked_mul(AES_BLOCK_SIZE) {
            Some(length) => length,
            None => {
                log::error!("{} blocks is too many to address", blocks);
                return Err(Error::InvalidLength { length: usize::MAX });
            },
        };
        if input.len() < length {
            return Err(Error::InvalidLength { length: input.len() });
        }
        if output.len() < length {
            return Err(Error::InvalidLength { length: output.len() });
        }
        Ok(length)
    }
}

impl Default for SoftAes {
    fn default() -> Self {
        Self::new()
    }
}

impl CipherEngine for SoftAes {
    fn encrypt_blocks(&mut self, input: &[u8], output: &mut [u8], blocks: usize) -> Result<()> {
        let length = Self::check_lengths(input, output, blocks)?;
        log::trace!("AES encrypting {} blocks", blocks);
        let aes = Aes128::new(GenericArray::from_slice(&self.key));
        let input = input[..length].chunks_exact(AES_BLOCK_SIZE);
        let output = output[..length].chunks_exact_mut(AES_BLOCK_SIZE);
        for (src, dst) in input.zip(output) {
            aes.encrypt_block_b2b(GenericArray::from_slice(src), GenericArray::from_mut_slice(dst));
        }
        Ok(())
    }

    fn decrypt_blocks(&mut self, input: &[u8], output: &mut [u8], blocks: usize) -> Result<()> {
        let length = Self::check_lengths(input, output, blocks)?;
        log::trace!("AES decrypting {} blocks", blocks);
        let aes = Aes128::new(GenericArray::from_slice(&self.key));
        let input = input[..length].chunks_exact(AES_BLOCK_SIZE);
        let output = output[..length].chunks_exact_mut(AES_BLOCK_SIZE);
        for (src, dst) in input.zip(output) {
            aes.decrypt_block_b2b(GenericArray::from_slice(src), GenericArray::from_mut_slice(dst));
        }
        Ok(())
    }
}

#[test]
fn test_fips197_vector() {
    let key = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07,
        0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
    ];
    let plain = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77,
        0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff,
    ];
    let expected = [
        0x69, 0xc4, 0xe0, 0xd8, 0x6a, 0x7b, 0x04, 0x30,
        0xd8, 0xcd, 0xb7, 0x80, 0x70, 0xb4, 0xc5, 0x5a,
    ];
    let mut aes = SoftAes::with_key(key);
    let mut out = [0u8; 16];
    aes.encrypt_blocks(&plain, &mut out, 1).unwrap();
    assert_eq!(out, expected);
    let mut back = [0u8; 16];
    aes.decrypt_blocks(&out, &mut back, 1).unwrap();
    assert_eq!(back, plain);
}

#[test]
fn test_page_round_trip() {
    let mut plain = [0u8; 64];
    for (i, b) in plain.iter_mut().enumerate() {
        *b = i as u8;
    }
    let mut aes = SoftAes::new();
    let mut cipher = [0u8; 64];
    let mut back = [0u8; 64];
    aes.encrypt_blocks(&plain, &mut cipher, 4).unwrap();
    assert_ne!(cipher, plain);
    aes.decrypt_blocks(&cipher, &mut back, 4).unwrap();
    assert_eq!(back, plain);
}

#[test]
fn test_blocks_are_independent() {
    // Identical plaintext blocks give identical ciphertext blocks at every offset.
    let plain = [0x5Au8; 64];
    let mut cipher = [0u8; 64];
    SoftAes::new().encrypt_blocks(&plain, &mut cipher, 4).unwrap();
    for block in cipher.chunks(16) {
        assert_eq!(block, &cipher[..16]);
    }

    // Encrypting only the first two blocks leaves the rest of the output untouched.
    let mut partial = [0u8; 64];
    SoftAes::new().encrypt_blocks(&plain, &mut partial, 2).unwrap();
    assert_eq!(&partial[..32], &cipher[..32]);
    assert!(partial[32..].iter().all(|&b| b == 0));
}

#[test]
fn test_block_count() {
    assert_eq!(block_count(64).unwrap(), 4);
    assert_eq!(block_count(0).unwrap(), 0);
    assert!(block_count(60).is_err());
}

#[test]
fn test_short_buffers_rejected() {
    let mut out = [0u8; 64];
    assert!(SoftAes::new().encrypt_blocks(&[0u8; 48], &mut out, 4).is_err());
    let mut short = [0u8; 32];
    assert!(SoftAes::new().decrypt_blocks(&[0u8; 64], &mut short, 4).is_err());
}

#[test]
fn test_block_count_overflow_rejected() {
    let mut out = [0u8; 64];
    let blocks = usize::MAX / AES_BLOCK_SIZE + 1;
    let err = SoftAes::new().encrypt_blocks(&[0u8; 64], &mut out, blocks).unwrap_err();
    assert!(matches!(err, Error::InvalidLength { length: usize::MAX }));
    assert!(SoftAes::new().decrypt_blocks(&[0u8; 64], &mut out, usize::MAX).is_err());
    // Nothing was written.
    assert_eq!(out, [0u8; 64]);
}
