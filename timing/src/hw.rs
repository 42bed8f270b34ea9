//! The hardware handle: a transport paired with the address table that names its registers.
//!
//! Writes are queued and only reach the bus on [`Hw::dispatch`], so a node can stage a whole
//! control sequence and send it in one go. Writes to masked fields become read-modify-write
//! cycles at dispatch time, leaving the other fields of the word untouched. Reads flush the queue
//! before touching the bus so that they always observe every write issued before them.

use crate::transport::{
    Error,
    Transport,
    TransportResult,
};
use kstring::KString;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
    },
};
use timing_utils::address_table::{
    AddressTable,
    Mode,
    Register,
};
use tracing::{
    trace,
    warn,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingWrite {
    /// A (possibly masked) single word write, `value` already shifted into place
    Field { addr: u32, mask: u32, value: u32 },
    Block {
        addr: u32,
        mode: Mode,
        data: Vec<u32>,
    },
}

/// A transport and the register map of the firmware behind it
#[derive(Debug)]
pub struct Hw<T> {
    transport: T,
    table: AddressTable,
    pending: Vec<PendingWrite>,
}

impl<T> Hw<T>
where
    T: Transport,
{
    #[must_use]
    pub fn new(transport: T, table: AddressTable) -> Self {
        Self {
            transport,
            table,
            pending: vec![],
        }
    }

    /// Construct the handle behind the shared pointer nodes hold on to
    #[must_use]
    pub fn shared(transport: T, table: AddressTable) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new(transport, table)))
    }

    #[must_use]
    pub fn table(&self) -> &AddressTable {
        &self.table
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Number of writes waiting for [`Hw::dispatch`]
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn register(&self, name: &str) -> TransportResult<Register> {
        self.table
            .register(name)
            .copied()
            .ok_or_else(|| Error::MissingRegister(name.to_owned()))
    }

    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.table.contains_node(name)
    }

    /// Size in words of register `name`
    /// # Errors
    /// Returns an error if the register doesn't exist
    pub fn size(&self, name: &str) -> TransportResult<u32> {
        Ok(self.register(name)?.size)
    }

    /// Immediate children of the node at `name`
    #[must_use]
    pub fn children(&self, name: &str) -> Vec<KString> {
        self.table.children(name)
    }

    /// Named slaves of the I2C master at `bus`
    #[must_use]
    pub fn i2c_slaves(&self, bus: &str) -> Option<&HashMap<KString, u8>> {
        self.table.i2c_slaves(bus)
    }

    /// Queue a write of `value` to the field `name`
    /// # Errors
    /// Returns an error if the register doesn't exist, is read-only or `value` doesn't fit its
    /// mask. Nothing touches the bus until dispatch.
    pub fn write(&mut self, name: &str, value: u32) -> TransportResult<()> {
        let reg = self.register(name)?;
        if !reg.permission.writable() {
            return Err(Error::NotWritable(name.to_owned()));
        }
        if value > reg.max_value() {
            return Err(Error::ValueOutOfRange {
                name: name.to_owned(),
                value,
                mask: reg.mask,
            });
        }
        self.pending.push(PendingWrite::Field {
            addr: reg.addr,
            mask: reg.mask,
            value: value << reg.shift(),
        });
        Ok(())
    }

    /// Queue a block write of `data` into `name`
    /// # Errors
    /// Returns an error if the register doesn't exist, is read-only or too small for `data`
    pub fn write_block(&mut self, name: &str, data: &[u32]) -> TransportResult<()> {
        let reg = self.register(name)?;
        if !reg.permission.writable() {
            return Err(Error::NotWritable(name.to_owned()));
        }
        if reg.mode != Mode::NonIncremental && data.len() > reg.size as usize {
            return Err(Error::BlockSize {
                name: name.to_owned(),
                requested: data.len(),
                size: reg.size,
            });
        }
        self.pending.push(PendingWrite::Block {
            addr: reg.addr,
            mode: reg.mode,
            data: data.to_vec(),
        });
        Ok(())
    }

    /// Send every queued write to the bus, in the order they were issued
    /// # Errors
    /// Returns an error on transport errors. The queue is emptied either way.
    pub fn dispatch(&mut self) -> TransportResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        trace!(writes = pending.len(), "Dispatching");
        for write in pending {
            match write {
                PendingWrite::Field { addr, mask, value } => {
                    if mask == u32::MAX {
                        self.transport.write_word(addr, value)?;
                    } else {
                        let current = self.transport.read_word(addr)?;
                        self.transport
                            .write_word(addr, (current & !mask) | (value & mask))?;
                    }
                }
                PendingWrite::Block { addr, mode, data } => match mode {
                    Mode::NonIncremental => self.transport.write_fifo(addr, &data)?,
                    Mode::Single | Mode::Incremental => self.transport.write_words(addr, &data)?,
                },
            }
        }
        Ok(())
    }

    /// Drop every queued write without sending it
    pub fn discard(&mut self) {
        self.pending.clear();
    }

    /// Read the field `name`, flushing queued writes first
    /// # Errors
    /// Returns an error if the register doesn't exist, is write-only, or on transport errors
    pub fn read(&mut self, name: &str) -> TransportResult<u32> {
        let reg = self.register(name)?;
        if !reg.permission.readable() {
            return Err(Error::NotReadable(name.to_owned()));
        }
        self.dispatch()?;
        let word = self.transport.read_word(reg.addr)?;
        Ok((word & reg.mask) >> reg.shift())
    }

    /// Read exactly `n` words from `name`, flushing queued writes first
    /// # Errors
    /// Returns an error if the register doesn't exist, is write-only, if `n` exceeds the size of an
    /// incrementing register or if the transport returned a different number of words than requested
    pub fn read_block(&mut self, name: &str, n: usize) -> TransportResult<Vec<u32>> {
        let reg = self.register(name)?;
        if !reg.permission.readable() {
            return Err(Error::NotReadable(name.to_owned()));
        }
        if reg.mode != Mode::NonIncremental && n > reg.size as usize {
            return Err(Error::BlockSize {
                name: name.to_owned(),
                requested: n,
                size: reg.size,
            });
        }
        self.dispatch()?;
        let words = match reg.mode {
            Mode::NonIncremental => self.transport.read_fifo(reg.addr, n)?,
            Mode::Single | Mode::Incremental => self.transport.read_words(reg.addr, n)?,
        };
        if words.len() != n {
            return Err(Error::WordCount {
                name: name.to_owned(),
                expected: n,
                got: words.len(),
            });
        }
        Ok(words)
    }
}

impl<T> Drop for Hw<T> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            warn!(
                writes = self.pending.len(),
                "Hardware handle dropped with writes that were never dispatched"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{
        Access,
        Mock,
    };
    use timing_utils::address_table::parse_address_table;

    const TABLE: &str = "
?register csr.ctrl 0x0 0xffffffff 1
?register csr.ctrl.en 0x0 0x1 1
?register csr.ctrl.sel 0x0 0xf0 1
?register csr.stat 0x1 0xffffffff 1 r
?register cmd 0x2 0xffffffff 1 w
?register ctrs 0x10 0xffffffff 4 r
?register buf.data 0x20 0xffffffff 64 r fifo
?register evt.data 0x30 0xffffffff 1 r fifo
";

    fn hw() -> Hw<Mock> {
        Hw::new(Mock::new(), parse_address_table(TABLE).unwrap())
    }

    #[test]
    fn test_deferred_write() {
        let mut hw = hw();
        hw.write("csr.ctrl.sel", 0xa).unwrap();
        assert!(hw.transport().log().is_empty());
        assert_eq!(hw.pending(), 1);
        hw.dispatch().unwrap();
        assert_eq!(hw.pending(), 0);
        assert_eq!(hw.transport().peek(0), 0xa0);
    }

    #[test]
    fn test_masked_rmw() {
        let mut hw = hw();
        hw.transport_mut().poke(0, 0xffff_ff0e);
        hw.write("csr.ctrl.sel", 0x3).unwrap();
        hw.write("csr.ctrl.en", 1).unwrap();
        hw.dispatch().unwrap();
        assert_eq!(hw.transport().peek(0), 0xffff_ff3f);
        assert_eq!(
            hw.transport().log(),
            &[
                Access::Read(0),
                Access::Write(0, 0xffff_ff3e),
                Access::Read(0),
                Access::Write(0, 0xffff_ff3f)
            ]
        );
    }

    #[test]
    fn test_full_word_skips_read() {
        let mut hw = hw();
        hw.write("cmd", 0x1234).unwrap();
        hw.dispatch().unwrap();
        assert_eq!(hw.transport().log(), &[Access::Write(2, 0x1234)]);
    }

    #[test]
    fn test_pulse_order_preserved() {
        let mut hw = hw();
        hw.write("csr.ctrl.en", 1).unwrap();
        hw.write("csr.ctrl.en", 0).unwrap();
        hw.dispatch().unwrap();
        assert_eq!(hw.transport().writes_to(0), vec![1, 0]);
    }

    #[test]
    fn test_read_flushes() {
        let mut hw = hw();
        hw.write("csr.ctrl.sel", 0x5).unwrap();
        assert_eq!(hw.read("csr.ctrl.sel").unwrap(), 0x5);
        assert_eq!(hw.read("csr.ctrl").unwrap(), 0x50);
    }

    #[test]
    fn test_value_out_of_range() {
        let mut hw = hw();
        assert!(matches!(
            hw.write("csr.ctrl.sel", 0x10),
            Err(Error::ValueOutOfRange { value: 0x10, .. })
        ));
        assert_eq!(hw.pending(), 0);
    }

    #[test]
    fn test_permissions() {
        let mut hw = hw();
        assert!(matches!(hw.write("csr.stat", 1), Err(Error::NotWritable(_))));
        assert!(matches!(hw.read("cmd"), Err(Error::NotReadable(_))));
        assert!(matches!(
            hw.read("nope"),
            Err(Error::MissingRegister(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_block_read() {
        let mut hw = hw();
        hw.transport_mut().write_words(0x10, &[1, 2, 3, 4]).unwrap();
        assert_eq!(hw.read_block("ctrs", 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(hw.read_block("ctrs", 2).unwrap(), vec![1, 2]);
        assert!(matches!(
            hw.read_block("ctrs", 5),
            Err(Error::BlockSize { requested: 5, size: 4, .. })
        ));
    }

    #[test]
    fn test_fifo_word_count() {
        let mut hw = hw();
        hw.transport_mut().fill_fifo(0x20, [7, 8, 9]);
        assert_eq!(hw.read_block("buf.data", 2).unwrap(), vec![7, 8]);
        assert!(matches!(
            hw.read_block("buf.data", 2),
            Err(Error::WordCount {
                expected: 2,
                got: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_fifo_ignores_declared_size() {
        let mut hw = hw();
        hw.transport_mut().fill_fifo(0x30, 1..=12);
        assert_eq!(hw.read_block("evt.data", 6).unwrap(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(hw.transport().fifo_len(0x30), 6);
    }

    #[test]
    fn test_discard() {
        let mut hw = hw();
        hw.write("cmd", 1).unwrap();
        hw.discard();
        hw.dispatch().unwrap();
        assert!(hw.transport().log().is_empty());
    }

    #[test]
    fn test_children() {
        let hw = hw();
        assert_eq!(
            hw.children("csr"),
            vec![KString::from_static("ctrl"), KString::from_static("stat")]
        );
        assert!(hw.exists("buf"));
        assert!(!hw.exists("buf.count"));
    }
}
