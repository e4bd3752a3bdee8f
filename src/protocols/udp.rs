//! UDP header view over a borrowed byte slice, mirroring `retina-core::protocols::packet::udp::Udp`.

use super::DecodeError;

const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct Udp<'a> {
    data: &'a [u8],
}

impl<'a> Udp<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, DecodeError> {
        if data.len() < HEADER_LEN {
            return Err(DecodeError::TooShort {
                need: HEADER_LEN,
                have: data.len(),
            });
        }
        Ok(Udp { data })
    }

    #[inline]
    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    #[inline]
    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        &self.data[HEADER_LEN..]
    }
}
