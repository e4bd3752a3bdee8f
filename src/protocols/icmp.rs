//! ICMP payload extraction.
//!
//! `retina-core` does not parse ICMP at all; this module exists purely to support the
//! anti-ping-abuse heuristic (drop any ICMP packet whose payload isn't exactly 60 bytes),
//! so the "parse" here is just slicing off the 8-byte ICMP header.

use super::DecodeError;

const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct Icmp<'a> {
    data: &'a [u8],
}

impl<'a> Icmp<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, DecodeError> {
        if data.len() < HEADER_LEN {
            return Err(DecodeError::TooShort {
                need: HEADER_LEN,
                have: data.len(),
            });
        }
        Ok(Icmp { data })
    }

    #[inline]
    pub fn icmp_type(&self) -> u8 {
        self.data[0]
    }

    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        &self.data[HEADER_LEN..]
    }
}
