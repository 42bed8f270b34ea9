//! The common base of every register-map node: a position in the register hierarchy plus an
//! upwards pointer to the shared hardware handle.

use crate::{
    hw::Hw,
    transport::{
        Deserialize,
        Error,
        Serialize,
        Transport,
        TransportResult,
    },
};
use kstring::KString;
use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    sync::{
        Arc,
        Mutex,
        Weak,
    },
    time::{
        Duration,
        Instant,
    },
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Transport(#[from] Error),
    #[error("Timed out after {timeout:?} waiting on `{register}`")]
    Timeout { register: String, timeout: Duration },
}

/// Nodes that can summarise their state as a human-readable report
pub trait TimingNode {
    type Error;

    /// Build a status report of this node
    /// # Errors
    /// Returns an error if the state couldn't be read
    fn get_status(&self) -> Result<String, Self::Error>;
}

/// A node at `path` in the register hierarchy
#[derive(Debug)]
pub struct Node<T> {
    /// Upwards pointer to the shared hardware handle
    hw: Weak<Mutex<Hw<T>>>,
    /// Dotted path of this node, empty for the root
    path: KString,
}

impl<T> Clone for Node<T> {
    fn clone(&self) -> Self {
        Self {
            hw: self.hw.clone(),
            path: self.path.clone(),
        }
    }
}

impl<T> Node<T>
where
    T: Transport,
{
    #[must_use]
    pub fn new(hw: &Arc<Mutex<Hw<T>>>, path: &str) -> Self {
        Self::from_weak(Arc::downgrade(hw), path)
    }

    #[must_use]
    pub fn from_weak(hw: Weak<Mutex<Hw<T>>>, path: &str) -> Self {
        Self {
            hw,
            path: KString::from_ref(path),
        }
    }

    /// Full dotted path of this node
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last component of the path
    #[must_use]
    pub fn id(&self) -> &str {
        self.path.rsplit('.').next().unwrap_or_default()
    }

    /// Full path of the descendant `name`
    #[must_use]
    pub fn full_path(&self, name: &str) -> String {
        match (self.path.is_empty(), name.is_empty()) {
            (_, true) => self.path.to_string(),
            (true, false) => name.to_owned(),
            (false, false) => format!("{}.{name}", self.path),
        }
    }

    /// The descendant node `name`
    #[must_use]
    pub fn child(&self, name: &str) -> Self {
        Self::from_weak(self.hw.clone(), &self.full_path(name))
    }

    /// Run `f` with exclusive access to the hardware handle
    /// # Errors
    /// Returns an error if the handle is gone or poisoned, or whatever `f` returns
    pub fn with_hw<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut Hw<T>) -> Result<R, E>,
        E: From<Error>,
    {
        let hw = self.hw.upgrade().ok_or(Error::Disconnected)?;
        let mut hw = hw.lock().map_err(|_| Error::Poisoned)?;
        f(&mut *hw)
    }

    /// Whether `name` exists below this node
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        let path = self.full_path(name);
        self.with_hw(|hw| Ok::<_, Error>(hw.exists(&path)))
            .unwrap_or(false)
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn read(&self, name: &str) -> TransportResult<u32> {
        let path = self.full_path(name);
        self.with_hw(|hw| hw.read(&path))
    }

    /// Read a whole-word register and reinterpret it as `D`
    /// # Errors
    /// Returns an error on transport errors or if the word doesn't unpack
    pub fn read_as<D>(&self, name: &str) -> TransportResult<D>
    where
        D: Deserialize<Chunk = [u8; 4]>,
    {
        Ok(D::deserialize(self.read(name)?.to_be_bytes())?)
    }

    /// Queue a write, see [`Hw::write`]
    /// # Errors
    /// Returns an error on bad register names or values
    pub fn write(&self, name: &str, value: u32) -> TransportResult<()> {
        let path = self.full_path(name);
        self.with_hw(|hw| hw.write(&path, value))
    }

    /// Queue a write of a whole-word register from `S`
    /// # Errors
    /// Returns an error on bad register names or if the value doesn't pack
    pub fn write_as<S>(&self, name: &str, value: &S) -> TransportResult<()>
    where
        S: Serialize<Chunk = [u8; 4]>,
    {
        self.write(name, u32::from_be_bytes(value.serialize()?))
    }

    /// Queue a write of 1 followed by a write of 0
    /// # Errors
    /// Returns an error on bad register names
    pub fn pulse(&self, name: &str) -> TransportResult<()> {
        self.write(name, 1)?;
        self.write(name, 0)
    }

    /// Read exactly `n` words
    /// # Errors
    /// Returns an error on transport errors or word count mismatches
    pub fn read_block(&self, name: &str, n: usize) -> TransportResult<Vec<u32>> {
        let path = self.full_path(name);
        self.with_hw(|hw| hw.read_block(&path, n))
    }

    /// Read every word of a block register
    /// # Errors
    /// Returns an error on transport errors or word count mismatches
    pub fn read_block_all(&self, name: &str) -> TransportResult<Vec<u32>> {
        let path = self.full_path(name);
        self.with_hw(|hw| {
            let n = hw.size(&path)? as usize;
            hw.read_block(&path, n)
        })
    }

    /// Queue a block write
    /// # Errors
    /// Returns an error on bad register names or oversized data
    pub fn write_block(&self, name: &str, data: &[u32]) -> TransportResult<()> {
        let path = self.full_path(name);
        self.with_hw(|hw| hw.write_block(&path, data))
    }

    /// Send the queued writes
    /// # Errors
    /// Returns an error on transport errors
    pub fn dispatch(&self) -> TransportResult<()> {
        self.with_hw(Hw::dispatch)
    }

    /// Size in words of `name`
    /// # Errors
    /// Returns an error if the register doesn't exist
    pub fn size(&self, name: &str) -> TransportResult<u32> {
        let path = self.full_path(name);
        self.with_hw(|hw| hw.size(&path))
    }

    /// Names of the immediate children of `name`
    /// # Errors
    /// Returns an error if the hardware handle is gone
    pub fn children(&self, name: &str) -> TransportResult<Vec<KString>> {
        let path = self.full_path(name);
        self.with_hw(|hw| Ok(hw.children(&path)))
    }

    /// Read every readable register directly below `name`, sorted by name
    /// # Errors
    /// Returns an error on transport errors
    pub fn read_sub_nodes(&self, name: &str) -> TransportResult<BTreeMap<String, u32>> {
        let path = self.full_path(name);
        self.with_hw(|hw| {
            let mut values = BTreeMap::new();
            for child in hw.children(&path) {
                let child_path = format!("{path}.{child}");
                let readable = hw
                    .table()
                    .register(&child_path)
                    .map_or(false, |r| r.permission.readable());
                if readable {
                    values.insert(child.to_string(), hw.read(&child_path)?);
                }
            }
            Ok(values)
        })
    }

    /// Write `value` to every writable register directly below `name`
    /// # Errors
    /// Returns an error on transport errors or if `value` doesn't fit one of the fields
    pub fn reset_sub_nodes(&self, name: &str, value: u32, dispatch: bool) -> TransportResult<()> {
        let path = self.full_path(name);
        self.with_hw(|hw| {
            for child in hw.children(&path) {
                let child_path = format!("{path}.{child}");
                let writable = hw
                    .table()
                    .register(&child_path)
                    .map_or(false, |r| r.permission.writable());
                if writable {
                    hw.write(&child_path, value)?;
                }
            }
            if dispatch {
                hw.dispatch()?;
            }
            Ok(())
        })
    }

    /// Named slaves of the I2C master at `name`
    /// # Errors
    /// Returns an error if the hardware handle is gone
    pub fn i2c_slaves(&self, name: &str) -> TransportResult<HashMap<KString, u8>> {
        let path = self.full_path(name);
        self.with_hw(|hw| Ok(hw.i2c_slaves(&path).cloned().unwrap_or_default()))
    }

    /// Read `name` every `interval` until `done` accepts the value, giving up after `timeout`.
    /// The register is always read at least once.
    /// # Errors
    /// Returns an error on transport errors or timeout
    pub fn poll<F>(
        &self,
        name: &str,
        done: F,
        timeout: Duration,
        interval: Duration,
    ) -> Result<u32, PollError>
    where
        F: Fn(u32) -> bool,
    {
        let start = Instant::now();
        loop {
            let value = self.read(name)?;
            if done(value) {
                return Ok(value);
            }
            if start.elapsed() >= timeout {
                return Err(PollError::Timeout {
                    register: self.full_path(name),
                    timeout,
                });
            }
            std::thread::sleep(interval);
        }
    }

    /// Weak pointer to the hardware handle, for building other node kinds from this one
    #[must_use]
    pub fn hw(&self) -> Weak<Mutex<Hw<T>>> {
        self.hw.clone()
    }
}
