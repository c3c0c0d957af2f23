//! Kademlia node Id or a lookup target
use rand::Rng;
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits, the widest key space supported.
pub const ID_BITS: u8 = ID_SIZE as u8 * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash, Default)]
/// Kademlia node Id or a lookup target.
///
/// A 160 bit unsigned integer stored big endian, so the derived ordering
/// is the numeric ordering.
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    pub const MIN: Id = Id([0; ID_SIZE]);

    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Uniformly random Id in `[0, 2^key_space_bits)`.
    pub fn random_within(key_space_bits: u8) -> Id {
        Id::random().truncate(key_space_bits)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE](crate::common::ID_SIZE).
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// XOR distance between this Id and a target Id.
    ///
    /// The result is itself an [Id], comparing it to another distance
    /// compares the two as unsigned integers.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(result)
    }

    /// Number of leading zero bits out of [ID_BITS].
    pub fn leading_zeros(&self) -> u8 {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return (i as u32 * 8 + byte.leading_zeros()) as u8;
            }
        }

        ID_BITS
    }

    /// Number of leading bits shared with `other`.
    pub fn common_prefix_len(&self, other: &Id) -> u8 {
        self.xor(other).leading_zeros()
    }

    /// Returns true if this Id is smaller than `2^key_space_bits`.
    pub fn fits(&self, key_space_bits: u8) -> bool {
        ID_BITS - self.leading_zeros() <= key_space_bits
    }

    /// Clear every bit above the lowest `key_space_bits`.
    pub fn truncate(&self, key_space_bits: u8) -> Id {
        let cleared = ID_BITS.saturating_sub(key_space_bits) as usize;
        let mut bytes = self.0;

        for (i, byte) in bytes.iter_mut().enumerate() {
            let start = i * 8;

            if start + 8 <= cleared {
                *byte = 0;
            } else if start < cleared {
                *byte &= 0xff >> (cleared - start);
            }
        }

        Id(bytes)
    }

    /// Copy of this Id with the bit at `index` (counted from the most
    /// significant bit) set.
    pub(crate) fn with_bit(&self, index: u8) -> Id {
        let mut bytes = self.0;
        let index = index as usize;

        if index < ID_SIZE * 8 {
            bytes[index / 8] |= 0x80 >> (index % 8);
        }

        Id(bytes)
    }

    /// Copy of this Id with every bit from `index` (counted from the most
    /// significant bit) to the end set.
    pub(crate) fn with_trailing_ones(&self, index: u8) -> Id {
        let mut bytes = self.0;
        let index = index as usize;

        for (i, byte) in bytes.iter_mut().enumerate() {
            let start = i * 8;

            if start >= index {
                *byte = 0xff;
            } else if start + 8 > index {
                *byte |= 0xff >> (index - start);
            }
        }

        Id(bytes)
    }

    /// `self + 1`, or None on overflow.
    pub fn checked_increment(&self) -> Option<Id> {
        let mut bytes = self.0;

        for byte in bytes.iter_mut().rev() {
            let (value, overflow) = byte.overflowing_add(1);
            *byte = value;

            if !overflow {
                return Some(Id(bytes));
            }
        }

        None
    }

    /// `self - 1`, or None if this is zero.
    pub fn checked_decrement(&self) -> Option<Id> {
        let mut bytes = self.0;

        for byte in bytes.iter_mut().rev() {
            let (value, overflow) = byte.overflowing_sub(1);
            *byte = value;

            if !overflow {
                return Some(Id(bytes));
            }
        }

        None
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

impl From<u64> for Id {
    /// Convenient for small key spaces, the value lands in the low 8 bytes.
    fn from(value: u64) -> Id {
        let mut bytes = [0_u8; ID_SIZE];
        bytes[ID_SIZE - 8..].copy_from_slice(&value.to_be_bytes());

        Id(bytes)
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        if s.len() != ID_SIZE * 2 || !s.is_ascii() {
            return Err(Error::InvalidIdEncoding(s.to_string()));
        }

        let mut bytes = [0_u8; ID_SIZE];

        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidIdEncoding(s.to_string()))?;
        }

        Ok(Id(bytes))
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn distance_to_self_is_zero() {
        let id = Id::random();

        assert_eq!(id.xor(&id), Id::MIN);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = Id::random();
        let b = Id::random();

        assert_eq!(a.xor(&b), b.xor(&a));
    }

    #[test]
    fn distance_is_numeric_xor() {
        let a = Id::from(0b1100_u64);
        let b = Id::from(0b1010_u64);

        assert_eq!(a.xor(&b), Id::from(0b0110_u64));
        assert!(a.xor(&b) < a.xor(&Id::from(0b0011_u64)));
    }

    #[test]
    fn from_str_round_trip() {
        let str = "ba3042eb2d373b19e7c411ce6826e31b37be0b2e";
        let id = Id::from_str(str).unwrap();

        assert_eq!(id.to_string(), str);
        assert!(Id::from_str("ba30").is_err());
        assert!(Id::from_str("zz3042eb2d373b19e7c411ce6826e31b37be0b2e").is_err());
    }

    #[test]
    fn from_bytes_checks_size() {
        assert!(matches!(
            Id::from_bytes([0_u8; 19]),
            Err(Error::InvalidIdSize(19))
        ));
        assert_eq!(Id::from_bytes([7_u8; 20]).unwrap(), Id([7; 20]));
    }

    #[test]
    fn fits_and_truncate() {
        assert!(Id::from(255_u64).fits(8));
        assert!(!Id::from(256_u64).fits(8));
        assert!(Id::random().fits(ID_BITS));

        assert_eq!(Id::from(0x1ff_u64).truncate(8), Id::from(0xff_u64));
        assert_eq!(Id::from(0x1ff_u64).truncate(5), Id::from(0x1f_u64));

        for _ in 0..100 {
            assert!(Id::random_within(8).fits(8));
        }
    }

    #[test]
    fn bit_helpers() {
        let offset = ID_BITS - 8;

        assert_eq!(Id::MIN.with_bit(offset), Id::from(128_u64));
        assert_eq!(Id::from(128_u64).with_bit(offset + 1), Id::from(192_u64));
        assert_eq!(Id::MIN.with_trailing_ones(offset), Id::from(255_u64));
        assert_eq!(Id::from(128_u64).with_trailing_ones(offset + 1), Id::from(255_u64));
        assert_eq!(Id::MIN.with_trailing_ones(offset + 3), Id::from(31_u64));
        assert_eq!(Id::MIN.with_trailing_ones(0), Id([0xff; ID_SIZE]));
    }

    #[test]
    fn increment_and_decrement() {
        assert_eq!(Id::from(255_u64).checked_increment(), Some(Id::from(256_u64)));
        assert_eq!(Id::from(256_u64).checked_decrement(), Some(Id::from(255_u64)));
        assert_eq!(Id::MIN.checked_decrement(), None);
        assert_eq!(Id([0xff; ID_SIZE]).checked_increment(), None);
    }

    #[test]
    fn common_prefix() {
        let offset = ID_BITS - 8;

        assert_eq!(
            Id::from(224_u64).common_prefix_len(&Id::from(255_u64)),
            offset + 3
        );
        assert_eq!(Id::MIN.common_prefix_len(&Id::MIN), ID_BITS);
    }
}
