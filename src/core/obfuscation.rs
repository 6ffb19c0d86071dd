//! Secondary obfuscation pass applied to client frame bodies.
//!
//! The pass runs before the stream cipher on encode and after it on decode.
//! It is pluggable and versioned so deployments can match whatever their
//! reference client expects; the version is selected in
//! [`ProtocolSettings`](crate::config::ProtocolSettings).

use std::fmt::Debug;

/// An in-place, order-dependent, invertible byte transform.
pub trait Obfuscator: Send + Sync + Debug {
    /// Version tag this transform is selected by.
    fn version(&self) -> u8;

    fn encrypt(&self, data: &mut [u8]);

    fn decrypt(&self, data: &mut [u8]);
}

/// Version 0: no secondary pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Obfuscator for Passthrough {
    fn version(&self) -> u8 {
        0
    }

    fn encrypt(&self, _data: &mut [u8]) {}

    fn decrypt(&self, _data: &mut [u8]) {}
}

/// Version 1: six alternating forward/backward rotate-add-xor passes.
///
/// Each byte's output feeds the next byte's input through a running
/// `remember` value, and the per-byte counter starts at the body length, so
/// the result depends on both byte order and total length.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteShuffle;

const SHUFFLE_ROUNDS: usize = 6;

impl Obfuscator for ByteShuffle {
    fn version(&self) -> u8 {
        1
    }

    fn encrypt(&self, data: &mut [u8]) {
        let len = data.len();
        for round in 0..SHUFFLE_ROUNDS {
            let mut remember = 0u8;
            let mut counter = len as u8;
            if round % 2 == 0 {
                for byte in data.iter_mut() {
                    let mut cur = byte.rotate_left(3);
                    cur = cur.wrapping_add(counter);
                    cur ^= remember;
                    remember = cur;
                    cur = cur.rotate_right(u32::from(counter) % 8);
                    cur = !cur;
                    cur = cur.wrapping_add(0x48);
                    *byte = cur;
                    counter = counter.wrapping_sub(1);
                }
            } else {
                for byte in data.iter_mut().rev() {
                    let mut cur = byte.rotate_left(4);
                    cur = cur.wrapping_add(counter);
                    cur ^= remember;
                    remember = cur;
                    cur ^= 0x13;
                    cur = cur.rotate_right(3);
                    *byte = cur;
                    counter = counter.wrapping_sub(1);
                }
            }
        }
    }

    fn decrypt(&self, data: &mut [u8]) {
        let len = data.len();
        for round in 1..=SHUFFLE_ROUNDS {
            let mut remember = 0u8;
            let mut counter = len as u8;
            if round % 2 == 0 {
                for byte in data.iter_mut() {
                    let mut cur = byte.wrapping_sub(0x48);
                    cur = !cur;
                    cur = cur.rotate_left(u32::from(counter) % 8);
                    let next_remember = cur;
                    cur ^= remember;
                    remember = next_remember;
                    cur = cur.wrapping_sub(counter);
                    cur = cur.rotate_right(3);
                    *byte = cur;
                    counter = counter.wrapping_sub(1);
                }
            } else {
                for byte in data.iter_mut().rev() {
                    let mut cur = byte.rotate_left(3);
                    cur ^= 0x13;
                    let next_remember = cur;
                    cur ^= remember;
                    remember = next_remember;
                    cur = cur.wrapping_sub(counter);
                    cur = cur.rotate_right(4);
                    *byte = cur;
                    counter = counter.wrapping_sub(1);
                }
            }
        }
    }
}

/// Resolve a configured version to its transform.
pub fn by_version(version: u8) -> Option<Box<dyn Obfuscator>> {
    match version {
        0 => Some(Box::new(Passthrough)),
        1 => Some(Box::new(ByteShuffle)),
        _ => None,
    }
}
