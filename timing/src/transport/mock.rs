//! Mock transport implementations used in testing the interface

pub mod i2c;

use super::{
    Transport,
    TransportResult,
};
use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    fmt::Debug,
    ops::Range,
};

/// A simulated piece of firmware that owns a range of word addresses
pub trait Peripheral: Debug + Send {
    /// Read the word at `offset` words from the start of the peripheral
    fn read(&mut self, offset: u32) -> u32;
    /// Write the word at `offset` words from the start of the peripheral
    fn write(&mut self, offset: u32, value: u32);
}

/// A single bus access, as seen by the mock
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    Read(u32),
    Write(u32, u32),
}

/// A platform that mocks reads and writes, useful for testing
#[derive(Debug, Default)]
pub struct Mock {
    /// Plain memory, zero until written
    memory: HashMap<u32, u32>,
    /// Values handed out (in order) by reads of an address before falling back to memory
    scripted: HashMap<u32, VecDeque<u32>>,
    /// Contents of non-incrementing ports
    fifos: HashMap<u32, VecDeque<u32>>,
    peripherals: Vec<(Range<u32>, Box<dyn Peripheral>)>,
    log: Vec<Access>,
}

impl Mock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the memory backing `addr` without going through the bus
    pub fn poke(&mut self, addr: u32, value: u32) {
        self.memory.insert(addr, value);
    }

    /// Inspect the memory backing `addr` without going through the bus
    #[must_use]
    pub fn peek(&self, addr: u32) -> u32 {
        self.memory.get(&addr).copied().unwrap_or_default()
    }

    /// Queue up values for successive reads of `addr`. Once they run out, reads see memory again.
    pub fn script<I>(&mut self, addr: u32, values: I)
    where
        I: IntoIterator<Item = u32>,
    {
        self.scripted.entry(addr).or_default().extend(values);
    }

    /// Push words into the port at `addr`
    pub fn fill_fifo<I>(&mut self, addr: u32, values: I)
    where
        I: IntoIterator<Item = u32>,
    {
        self.fifos.entry(addr).or_default().extend(values);
    }

    /// Words currently sitting in the port at `addr`
    #[must_use]
    pub fn fifo_len(&self, addr: u32) -> usize {
        self.fifos.get(&addr).map_or(0, VecDeque::len)
    }

    /// Map `peripheral` onto `len` words starting at `base`
    pub fn attach<P>(&mut self, base: u32, len: u32, peripheral: P)
    where
        P: Peripheral + 'static,
    {
        self.peripherals.push((base..base + len, Box::new(peripheral)));
    }

    /// Every access made so far, in order
    #[must_use]
    pub fn log(&self) -> &[Access] {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// Values written to `addr`, in order
    #[must_use]
    pub fn writes_to(&self, addr: u32) -> Vec<u32> {
        self.log
            .iter()
            .filter_map(|a| match a {
                Access::Write(a, v) if *a == addr => Some(*v),
                _ => None,
            })
            .collect()
    }

    fn read_one(&mut self, addr: u32) -> u32 {
        self.log.push(Access::Read(addr));
        if let Some((range, p)) = self.peripherals.iter_mut().find(|(r, _)| r.contains(&addr)) {
            return p.read(addr - range.start);
        }
        if let Some(v) = self.scripted.get_mut(&addr).and_then(VecDeque::pop_front) {
            return v;
        }
        self.peek(addr)
    }

    fn write_one(&mut self, addr: u32, value: u32) {
        self.log.push(Access::Write(addr, value));
        if let Some((range, p)) = self.peripherals.iter_mut().find(|(r, _)| r.contains(&addr)) {
            p.write(addr - range.start, value);
            return;
        }
        self.poke(addr, value);
    }
}

impl Transport for Mock {
    fn read_words(&mut self, addr: u32, n: usize) -> TransportResult<Vec<u32>> {
        Ok((addr..).take(n).map(|a| self.read_one(a)).collect())
    }

    fn write_words(&mut self, addr: u32, data: &[u32]) -> TransportResult<()> {
        for (a, v) in (addr..).zip(data) {
            self.write_one(a, *v);
        }
        Ok(())
    }

    fn read_fifo(&mut self, addr: u32, n: usize) -> TransportResult<Vec<u32>> {
        // A port that runs dry ends the transaction early, like a short IPbus reply
        let fifo = self.fifos.entry(addr).or_default();
        let words: Vec<u32> = (0..n).map_while(|_| fifo.pop_front()).collect();
        self.log
            .extend(std::iter::repeat(Access::Read(addr)).take(words.len()));
        Ok(words)
    }

    fn write_fifo(&mut self, addr: u32, data: &[u32]) -> TransportResult<()> {
        self.log.extend(data.iter().map(|v| Access::Write(addr, *v)));
        self.fifos.entry(addr).or_default().extend(data);
        Ok(())
    }
}
