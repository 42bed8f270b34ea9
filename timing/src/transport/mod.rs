//! Defines the bus access trait that every timing transport must implement, along with the serde
//! traits for values moved over it.
//!
//! The wire protocol itself lives below this layer. A transport only has to move 32-bit words to
//! and from word addresses; naming, masking and batching happen in [`crate::hw`].

pub mod local;
pub mod mock;

use packed_struct::PackingResult;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Requested register doesn't exist - `{0}`")]
    MissingRegister(String),
    #[error("Register `{0}` is write-only")]
    NotReadable(String),
    #[error("Register `{0}` is read-only")]
    NotWritable(String),
    #[error("Value {value:#x} doesn't fit in the mask {mask:#x} of `{name}`")]
    ValueOutOfRange { name: String, value: u32, mask: u32 },
    #[error("Block access of {requested} words exceeds the {size} word size of `{name}`")]
    BlockSize {
        name: String,
        requested: usize,
        size: u32,
    },
    #[error("Expected {expected} words from `{name}`, but the transport returned {got}")]
    WordCount {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("Bus error at address {addr:#x} - {msg}")]
    Bus { addr: u32, msg: String },
    #[error(transparent)]
    Packing(#[from] packed_struct::PackingError),
    #[error(transparent)]
    Local(#[from] local::Error),
    #[error("The hardware handle this node points to has been dropped")]
    Disconnected,
    #[error("The hardware handle was poisoned by a panicking thread")]
    Poisoned,
}

pub type TransportResult<T> = Result<T, Error>;

/// Types that implement this trait can be serialized such that they can be written to device
/// registers
pub trait Serialize {
    type Chunk;
    /// # Errors
    /// Returns an error if the value can't be represented in its packed form
    fn serialize(&self) -> PackingResult<Self::Chunk>;
}

/// Types that implement this trait can be deserialized from the contents of device registers
pub trait Deserialize: Sized {
    type Chunk;
    /// # Errors
    /// Returns an error if the bytes aren't a valid representation
    fn deserialize(chunk: Self::Chunk) -> PackingResult<Self>;
}

macro_rules! ser_num {
    ($num:ty) => {
        impl Serialize for $num {
            type Chunk = [u8; core::mem::size_of::<$num>()];
            fn serialize(&self) -> PackingResult<Self::Chunk> {
                Ok(self.to_be_bytes())
            }
        }
    };
}

macro_rules! deser_num {
    ($num:ty) => {
        impl Deserialize for $num {
            type Chunk = [u8; core::mem::size_of::<$num>()];
            fn deserialize(chunk: Self::Chunk) -> PackingResult<Self> {
                Ok(<$num>::from_be_bytes(chunk))
            }
        }
    };
}

// Implement serdes for all builtin numeric types
ser_num!(u8);
ser_num!(u16);
ser_num!(u32);
ser_num!(u64);
ser_num!(i8);
ser_num!(i16);
ser_num!(i32);
ser_num!(i64);
ser_num!(f32);

deser_num!(u8);
deser_num!(u16);
deser_num!(u32);
deser_num!(u64);
deser_num!(i8);
deser_num!(i16);
deser_num!(i32);
deser_num!(i64);
deser_num!(f32);

/// The trait that is implemented for timing bus transports.
/// The methods of this trait *assume* that the device is already connected.
pub trait Transport {
    /// Read `n` consecutive words starting at word address `addr`
    /// # Errors
    /// Returns an error on bus failures
    fn read_words(&mut self, addr: u32, n: usize) -> TransportResult<Vec<u32>>;

    /// Write `data` to consecutive words starting at word address `addr`
    /// # Errors
    /// Returns an error on bus failures
    fn write_words(&mut self, addr: u32, data: &[u32]) -> TransportResult<()>;

    /// Read `n` words from the single (non-incrementing) port at `addr`
    /// # Errors
    /// Returns an error on bus failures
    fn read_fifo(&mut self, addr: u32, n: usize) -> TransportResult<Vec<u32>>;

    /// Write every word of `data` to the single (non-incrementing) port at `addr`
    /// # Errors
    /// Returns an error on bus failures
    fn write_fifo(&mut self, addr: u32, data: &[u32]) -> TransportResult<()>;

    /// Read one word
    /// # Errors
    /// Returns an error on bus failures or if the transport returned nothing
    fn read_word(&mut self, addr: u32) -> TransportResult<u32> {
        self.read_words(addr, 1)?
            .first()
            .copied()
            .ok_or_else(|| Error::Bus {
                addr,
                msg: "empty read".to_owned(),
            })
    }

    /// Write one word
    /// # Errors
    /// Returns an error on bus failures
    fn write_word(&mut self, addr: u32, value: u32) -> TransportResult<()> {
        self.write_words(addr, &[value])
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read_words(&mut self, addr: u32, n: usize) -> TransportResult<Vec<u32>> {
        (**self).read_words(addr, n)
    }

    fn write_words(&mut self, addr: u32, data: &[u32]) -> TransportResult<()> {
        (**self).write_words(addr, data)
    }

    fn read_fifo(&mut self, addr: u32, n: usize) -> TransportResult<Vec<u32>> {
        (**self).read_fifo(addr, n)
    }

    fn write_fifo(&mut self, addr: u32, data: &[u32]) -> TransportResult<()> {
        (**self).write_fifo(addr, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paste::paste;

    macro_rules! test_serde_num {
        ($num:ty, $v:literal) => {
            paste! {
                #[test]
                #[allow(clippy::float_cmp)]
                fn [<test_serde_$num>]() {
                    let num: $num = $v;
                    let chunk = num.serialize().unwrap();
                    assert_eq!(chunk.len(), core::mem::size_of::<$num>());
                    let back = <$num>::deserialize(chunk).unwrap();
                    assert_eq!(back, num);
                }
            }
        };
    }

    test_serde_num!(u8, 42);
    test_serde_num!(u16, 0xDEAD);
    test_serde_num!(u32, 0xDEAD_BEEF);
    test_serde_num!(i16, -0xDEA);
    test_serde_num!(f32, 1.618);

    #[test]
    fn test_big_endian() {
        assert_eq!(0x0102u16.serialize().unwrap(), [1, 2]);
        assert_eq!(i16::deserialize([0xff, 0x00]).unwrap(), -256);
    }
}
