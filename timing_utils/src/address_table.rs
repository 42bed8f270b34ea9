//! Parser for the flat, line-oriented address tables that describe a timing firmware register map.
//!
//! Each non-comment line is one of
//! ```text
//! ?register <path> 0x<addr> 0x<mask> <size> [r|w|rw] [fifo]
//! ?i2c <bus path> <slave name> 0x<addr>
//! ```
//! where `path` is a dot-separated hierarchical name (`endpoint0.csr.ctrl.ep_en`), `size` is
//! counted in 32-bit words and `fifo` marks a port that does not auto-increment on block access.
use kstring::KString;
use nom::{
    branch::alt,
    bytes::complete::{
        tag,
        take_while1,
    },
    character::complete::{
        digit1,
        hex_digit1,
        space0,
        space1,
    },
    combinator::{
        all_consuming,
        map_res,
        opt,
        value,
    },
    sequence::{
        preceded,
        terminated,
    },
    IResult,
};
use std::{
    collections::{
        BTreeSet,
        HashMap,
    },
    path::Path,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Line {line}: parsing failed to match the grammar - `{content}`")]
    Syntax { line: usize, content: String },
    #[error("Line {line}: malformed node path `{path}`")]
    BadPath { line: usize, path: String },
    #[error("Line {line}: register `{name}` has an empty mask")]
    ZeroMask { line: usize, name: String },
    #[error("Line {line}: register `{name}` has zero size")]
    ZeroSize { line: usize, name: String },
    #[error("Line {line}: register `{name}` is defined twice")]
    DuplicateRegister { line: usize, name: String },
    #[error("Line {line}: slave `{name}` on bus `{bus}` is defined twice")]
    DuplicateSlave {
        line: usize,
        bus: String,
        name: String,
    },
    #[error("Line {line}: I2C address {addr:#x} is not a 7-bit address")]
    SlaveAddress { line: usize, addr: u32 },
}

/// Access permission of a register, as seen from software
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Permission {
    Read,
    Write,
    #[default]
    ReadWrite,
}

impl Permission {
    #[must_use]
    pub fn readable(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    #[must_use]
    pub fn writable(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// How block transfers walk the address space of a register
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    /// A single 32-bit word (possibly a masked field of one)
    Single,
    /// A memory-like region, block transfers increment the address
    Incremental,
    /// A port (FIFO), block transfers hit the same address repeatedly
    NonIncremental,
}

/// A named location on the register bus
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Register {
    /// Word address on the bus
    pub addr: u32,
    /// Bits of the word this node owns
    pub mask: u32,
    /// Size in 32-bit words
    pub size: u32,
    pub permission: Permission,
    pub mode: Mode,
}

impl Register {
    /// Position of the least-significant bit of the mask
    #[must_use]
    pub fn shift(&self) -> u32 {
        self.mask.trailing_zeros()
    }

    /// Largest value that fits in the masked field
    #[must_use]
    pub fn max_value(&self) -> u32 {
        self.mask >> self.shift()
    }

    /// Whether this node covers whole words
    #[must_use]
    pub fn is_full_word(&self) -> bool {
        self.mask == u32::MAX
    }
}

/// A parsed address table
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AddressTable {
    /// Every register by its full dotted path
    pub registers: HashMap<KString, Register>,
    /// Named I2C slave addresses for each I2C master (keyed by the master's path)
    pub i2c: HashMap<KString, HashMap<KString, u8>>,
}

impl AddressTable {
    #[must_use]
    pub fn register(&self, path: &str) -> Option<&Register> {
        self.registers.get(path)
    }

    /// Names of the immediate children of `prefix`, sorted. An empty prefix lists the top level.
    #[must_use]
    pub fn children(&self, prefix: &str) -> Vec<KString> {
        let names: BTreeSet<&str> = self
            .registers
            .keys()
            .filter_map(|k| {
                let rest = if prefix.is_empty() {
                    k.as_str()
                } else {
                    k.strip_prefix(prefix)?.strip_prefix('.')?
                };
                rest.split('.').next()
            })
            .collect();
        names.into_iter().map(|s| KString::from_ref(s)).collect()
    }

    /// Whether `path` names a register or an intermediate node of the hierarchy
    #[must_use]
    pub fn contains_node(&self, path: &str) -> bool {
        self.registers.contains_key(path) || !self.children(path).is_empty()
    }

    #[must_use]
    pub fn i2c_slaves(&self, bus: &str) -> Option<&HashMap<KString, u8>> {
        self.i2c.get(bus)
    }
}

enum Line<'a> {
    Register {
        path: &'a str,
        addr: u32,
        mask: u32,
        size: u32,
        permission: Option<Permission>,
        fifo: bool,
    },
    I2c {
        bus: &'a str,
        name: &'a str,
        addr: u32,
    },
}

fn hex_number(input: &str) -> IResult<&str, u32> {
    map_res(preceded(tag("0x"), hex_digit1), |s| {
        u32::from_str_radix(s, 16)
    })(input)
}

fn dec_number(input: &str) -> IResult<&str, u32> {
    map_res(digit1, str::parse::<u32>)(input)
}

fn node_path(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.')(input)
}

fn permission(input: &str) -> IResult<&str, Permission> {
    alt((
        value(Permission::ReadWrite, tag("rw")),
        value(Permission::Read, tag("r")),
        value(Permission::Write, tag("w")),
    ))(input)
}

fn register_line(input: &str) -> IResult<&str, Line> {
    let (remaining, _) = tag("?register")(input)?;
    let (remaining, path) = preceded(space1, node_path)(remaining)?;
    let (remaining, addr) = preceded(space1, hex_number)(remaining)?;
    let (remaining, mask) = preceded(space1, hex_number)(remaining)?;
    let (remaining, size) = preceded(space1, dec_number)(remaining)?;
    let (remaining, permission) = opt(preceded(space1, permission))(remaining)?;
    let (remaining, fifo) = opt(preceded(space1, tag("fifo")))(remaining)?;
    Ok((
        remaining,
        Line::Register {
            path,
            addr,
            mask,
            size,
            permission,
            fifo: fifo.is_some(),
        },
    ))
}

fn i2c_line(input: &str) -> IResult<&str, Line> {
    let (remaining, _) = tag("?i2c")(input)?;
    let (remaining, bus) = preceded(space1, node_path)(remaining)?;
    let (remaining, name) = preceded(space1, node_path)(remaining)?;
    let (remaining, addr) = preceded(space1, hex_number)(remaining)?;
    Ok((remaining, Line::I2c { bus, name, addr }))
}

fn line(input: &str) -> IResult<&str, Line> {
    all_consuming(terminated(alt((register_line, i2c_line)), space0))(input)
}

fn valid_path(path: &str) -> bool {
    path.split('.').all(|c| !c.is_empty())
}

/// Parse the text of an address table
/// # Errors
/// Returns an error on the first malformed or inconsistent line
pub fn parse_address_table(input: &str) -> Result<AddressTable, Error> {
    let mut table = AddressTable::default();
    for (idx, raw) in input.lines().enumerate() {
        let line_no = idx + 1;
        let content = raw.trim();
        if content.is_empty() || content.starts_with('#') {
            continue;
        }
        let (_, parsed) = line(content).map_err(|_| Error::Syntax {
            line: line_no,
            content: content.to_owned(),
        })?;
        match parsed {
            Line::Register {
                path,
                addr,
                mask,
                size,
                permission,
                fifo,
            } => {
                if !valid_path(path) {
                    return Err(Error::BadPath {
                        line: line_no,
                        path: path.to_owned(),
                    });
                }
                if mask == 0 {
                    return Err(Error::ZeroMask {
                        line: line_no,
                        name: path.to_owned(),
                    });
                }
                if size == 0 {
                    return Err(Error::ZeroSize {
                        line: line_no,
                        name: path.to_owned(),
                    });
                }
                let mode = if fifo {
                    Mode::NonIncremental
                } else if size > 1 {
                    Mode::Incremental
                } else {
                    Mode::Single
                };
                let reg = Register {
                    addr,
                    mask,
                    size,
                    permission: permission.unwrap_or_default(),
                    mode,
                };
                if table
                    .registers
                    .insert(KString::from_ref(path), reg)
                    .is_some()
                {
                    return Err(Error::DuplicateRegister {
                        line: line_no,
                        name: path.to_owned(),
                    });
                }
            }
            Line::I2c { bus, name, addr } => {
                if !valid_path(bus) {
                    return Err(Error::BadPath {
                        line: line_no,
                        path: bus.to_owned(),
                    });
                }
                let addr = u8::try_from(addr)
                    .ok()
                    .filter(|a| *a <= 0x7f)
                    .ok_or(Error::SlaveAddress { line: line_no, addr })?;
                let slaves = table.i2c.entry(KString::from_ref(bus)).or_default();
                if slaves.insert(KString::from_ref(name), addr).is_some() {
                    return Err(Error::DuplicateSlave {
                        line: line_no,
                        bus: bus.to_owned(),
                        name: name.to_owned(),
                    });
                }
            }
        }
    }
    Ok(table)
}

/// Read and parse an address table from disk
/// # Errors
/// Returns errors on IO failures and on malformed tables
pub fn read_address_table<P: AsRef<Path>>(path: P) -> Result<AddressTable, Error> {
    let contents = std::fs::read_to_string(path)?;
    parse_address_table(&contents)
}
