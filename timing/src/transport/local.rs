//! "Local" transport where we have access to the firmware's register space mapped through
//! `/dev/mem` (e.g. a Zynq carrier running Linux)

use super::{
    Transport,
    TransportResult,
};
use memmap2::{
    MmapMut,
    MmapOptions,
};
use nix::libc::O_SYNC;
use std::{
    fs::File,
    os::unix::fs::OpenOptionsExt,
    path::Path,
};
use timing_utils::address_table::AddressTable;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("File IO error")]
    IO(#[from] std::io::Error),
    #[error("The address table doesn't contain any registers to map")]
    EmptyTable,
    #[error("Word address {0:#x} is outside of the mapped window")]
    OutOfWindow(u32),
}

#[derive(Debug)]
/// A local connection to the register bus via a memory map
pub struct Local {
    mem: MmapMut,
    /// Number of words in the window
    words: u32,
}

impl Local {
    /// Map the register space described by `table`, whose word address 0 sits at the physical
    /// byte address `base_addr`, through `/dev/mem`.
    ///
    /// Note: This may require some file permission bologna
    /// # Errors
    /// Returns errors on file IO errors and on empty address tables
    pub fn new(table: &AddressTable, base_addr: u64) -> Result<Self, Error> {
        Self::from_file("/dev/mem", table, base_addr)
    }

    /// Same as [`Local::new`] but mapping an arbitrary file, `base_addr` being the byte offset in
    /// that file. `base_addr` must be page aligned.
    /// # Errors
    /// Returns errors on file IO errors and on empty address tables
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        table: &AddressTable,
        base_addr: u64,
    ) -> Result<Self, Error> {
        // The window spans from word 0 to the end of the highest register
        let words = table
            .registers
            .values()
            .map(|r| r.addr + r.size)
            .max()
            .ok_or(Error::EmptyTable)?;
        let file = File::options()
            .read(true)
            .write(true)
            .custom_flags(O_SYNC)
            .open(path)?;
        // Safety: the mapping is only accessed through volatile word reads and writes below
        let mem = unsafe {
            MmapOptions::new()
                .len(words as usize * 4)
                .offset(base_addr)
                .map_mut(&file)?
        };
        Ok(Self { mem, words })
    }

    fn word_ptr(&self, addr: u32) -> Result<*const u32, Error> {
        if addr >= self.words {
            return Err(Error::OutOfWindow(addr));
        }
        // Safety: bounds checked above, the map is page aligned so every word is aligned
        Ok(unsafe { self.mem.as_ptr().add(addr as usize * 4).cast::<u32>() })
    }

    fn word_ptr_mut(&mut self, addr: u32) -> Result<*mut u32, Error> {
        if addr >= self.words {
            return Err(Error::OutOfWindow(addr));
        }
        Ok(unsafe { self.mem.as_mut_ptr().add(addr as usize * 4).cast::<u32>() })
    }

    fn load(&self, addr: u32) -> Result<u32, Error> {
        let ptr = self.word_ptr(addr)?;
        Ok(unsafe { ptr.read_volatile() })
    }

    fn store(&mut self, addr: u32, value: u32) -> Result<(), Error> {
        let ptr = self.word_ptr_mut(addr)?;
        unsafe { ptr.write_volatile(value) };
        Ok(())
    }
}

impl Transport for Local {
    fn read_words(&mut self, addr: u32, n: usize) -> TransportResult<Vec<u32>> {
        Ok((addr..)
            .take(n)
            .map(|a| self.load(a))
            .collect::<Result<_, _>>()?)
    }

    fn write_words(&mut self, addr: u32, data: &[u32]) -> TransportResult<()> {
        for (a, v) in (addr..).zip(data) {
            self.store(a, *v)?;
        }
        Ok(())
    }

    fn read_fifo(&mut self, addr: u32, n: usize) -> TransportResult<Vec<u32>> {
        Ok((0..n)
            .map(|_| self.load(addr))
            .collect::<Result<_, _>>()?)
    }

    fn write_fifo(&mut self, addr: u32, data: &[u32]) -> TransportResult<()> {
        for v in data {
            self.store(addr, *v)?;
        }
        Ok(())
    }
}
