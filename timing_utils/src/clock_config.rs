//! Parser for the register-list exports of the Skyworks/Silicon Labs ClockBuilder Pro tool, used
//! to program the SI534x jitter-cleaner PLLs found on timing boards.
//!
//! These look like
//! ```text
//! # Part: Si5345
//! # Design ID: PDTS0003
//! Address,Data
//! # Start configuration preamble
//! 0x0B24,0xC0
//! # End configuration preamble
//! # Delay 300 msec
//! # Start configuration registers
//! 0x0006,0x00
//! # End configuration registers
//! # Start configuration postamble
//! 0x001C,0x01
//! # End configuration postamble
//! ```
use nom::{
    bytes::complete::tag,
    character::complete::{
        char,
        hex_digit1,
        space0,
    },
    combinator::{
        all_consuming,
        map_res,
    },
    sequence::{
        delimited,
        preceded,
        separated_pair,
    },
    IResult,
};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Line {line}: expected an `0xADDR,0xDATA` pair - `{content}`")]
    Syntax { line: usize, content: String },
    #[error("Line {line}: section `{section}` was not opened before being closed")]
    UnbalancedSection { line: usize, section: String },
    #[error("Section `{0}` was never closed")]
    UnterminatedSection(String),
    #[error("The configuration doesn't contain any register writes")]
    Empty,
}

/// A single byte written to a 16-bit (page + offset) register address
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegisterWrite {
    pub addr: u16,
    pub data: u8,
}

impl RegisterWrite {
    /// The page this register lives on
    #[must_use]
    pub fn page(&self) -> u8 {
        self.addr.to_be_bytes()[0]
    }

    /// The register offset within its page
    #[must_use]
    pub fn offset(&self) -> u8 {
        self.addr.to_be_bytes()[1]
    }
}

/// A parsed clock configuration
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClockConfig {
    /// The part number from the file header, if present
    pub part: Option<String>,
    /// The design ID from the file header, if present. This is what the chip reports back once
    /// programmed.
    pub design_id: Option<String>,
    /// Delay requested between preamble and register writes, in milliseconds
    pub delay_ms: Option<u32>,
    pub preamble: Vec<RegisterWrite>,
    pub registers: Vec<RegisterWrite>,
    pub postamble: Vec<RegisterWrite>,
}

impl ClockConfig {
    /// Total number of register writes in the file
    #[must_use]
    pub fn len(&self) -> usize {
        self.preamble.len() + self.registers.len() + self.postamble.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every write, in programming order
    pub fn iter(&self) -> impl Iterator<Item = &RegisterWrite> {
        self.preamble
            .iter()
            .chain(self.registers.iter())
            .chain(self.postamble.iter())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Section {
    Preamble,
    Registers,
    Postamble,
}

impl Section {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "preamble" => Some(Self::Preamble),
            "registers" => Some(Self::Registers),
            "postamble" => Some(Self::Postamble),
            _ => None,
        }
    }
}

fn hex_u16(input: &str) -> IResult<&str, u16> {
    map_res(preceded(tag("0x"), hex_digit1), |s| {
        u16::from_str_radix(s, 16)
    })(input)
}

fn hex_u8(input: &str) -> IResult<&str, u8> {
    map_res(preceded(tag("0x"), hex_digit1), |s| u8::from_str_radix(s, 16))(input)
}

fn register_write(input: &str) -> IResult<&str, RegisterWrite> {
    let (remaining, (addr, data)) = all_consuming(separated_pair(
        hex_u16,
        delimited(space0, char(','), space0),
        hex_u8,
    ))(input)?;
    Ok((remaining, RegisterWrite { addr, data }))
}

/// The value of a `Key: value` header comment
fn header_value<'a>(comment: &'a str, key: &str) -> Option<&'a str> {
    comment
        .strip_prefix(key)
        .map(|v| v.trim_start_matches(':').trim())
        .filter(|v| !v.is_empty())
}

/// Parse the text of a clock configuration export
/// # Errors
/// Returns an error on malformed data lines, unbalanced section markers or an empty file
pub fn parse_clock_config(input: &str) -> Result<ClockConfig, Error> {
    let mut config = ClockConfig::default();
    let mut section: Option<Section> = None;
    for (idx, raw) in input.lines().enumerate() {
        let line_no = idx + 1;
        let content = raw.trim();
        if content.is_empty() || content.eq_ignore_ascii_case("address,data") {
            continue;
        }
        if let Some(comment) = content.strip_prefix('#') {
            let comment = comment.trim();
            if let Some(name) = comment.strip_prefix("Start configuration ") {
                section = Section::from_name(name.trim());
            } else if let Some(name) = comment.strip_prefix("End configuration ") {
                let closing = Section::from_name(name.trim());
                if closing.is_none() || closing != section {
                    return Err(Error::UnbalancedSection {
                        line: line_no,
                        section: name.trim().to_owned(),
                    });
                }
                section = None;
            } else if let Some(part) = header_value(comment, "Part") {
                config.part = Some(part.to_owned());
            } else if let Some(id) = header_value(comment, "Design ID") {
                config.design_id = Some(id.to_owned());
            } else if let Some(delay) = comment.strip_prefix("Delay ") {
                config.delay_ms = delay
                    .split_whitespace()
                    .next()
                    .and_then(|v| v.parse().ok());
            }
            continue;
        }
        let (_, write) = register_write(content).map_err(|_| Error::Syntax {
            line: line_no,
            content: content.to_owned(),
        })?;
        match section {
            Some(Section::Preamble) => config.preamble.push(write),
            Some(Section::Postamble) => config.postamble.push(write),
            // Writes outside of any marker are plain configuration registers
            Some(Section::Registers) | None => config.registers.push(write),
        }
    }
    if let Some(open) = section {
        return Err(Error::UnterminatedSection(format!("{open:?}").to_lowercase()));
    }
    if config.is_empty() {
        return Err(Error::Empty);
    }
    Ok(config)
}

/// Read and parse a clock configuration file from disk
/// # Errors
/// Returns errors on IO failures and on malformed files
pub fn read_clock_config<P: AsRef<Path>>(path: P) -> Result<ClockConfig, Error> {
    let contents = std::fs::read_to_string(path)?;
    parse_clock_config(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = "\
# Si534x/7x/8x/9x Registers Script
#
# Part: Si5345
# Design ID: PDTS0003
Address,Data
#
# Start configuration preamble
0x0B24,0xC0
0x0B25,0x00
# End configuration preamble
#
# Delay 300 msec
#
# Start configuration registers
0x0006,0x00
0x0113, 0x09
# End configuration registers
#
# Start configuration postamble
0x001C,0x01
# End configuration postamble
";

    #[test]
    fn test_parse_sections() {
        let config = parse_clock_config(CONFIG).unwrap();
        assert_eq!(config.part.as_deref(), Some("Si5345"));
        assert_eq!(config.design_id.as_deref(), Some("PDTS0003"));
        assert_eq!(config.delay_ms, Some(300));
        assert_eq!(
            config.preamble,
            vec![
                RegisterWrite {
                    addr: 0x0B24,
                    data: 0xC0
                },
                RegisterWrite {
                    addr: 0x0B25,
                    data: 0x00
                }
            ]
        );
        assert_eq!(config.registers.len(), 2);
        assert_eq!(config.postamble.len(), 1);
        assert_eq!(config.len(), 5);
        let order: Vec<u16> = config.iter().map(|w| w.addr).collect();
        assert_eq!(order, vec![0x0B24, 0x0B25, 0x0006, 0x0113, 0x001C]);
    }

    #[test]
    fn test_page_offset() {
        let w = RegisterWrite {
            addr: 0x0B24,
            data: 0,
        };
        assert_eq!(w.page(), 0x0B);
        assert_eq!(w.offset(), 0x24);
    }

    #[test]
    fn test_bare_registers() {
        let config = parse_clock_config("0x0001,0x02\n0x0203,0x04\n").unwrap();
        assert!(config.preamble.is_empty());
        assert_eq!(config.registers.len(), 2);
        assert_eq!(config.part, None);
    }

    #[test]
    fn test_bad_line() {
        let err = parse_clock_config("0x0001,0x02\n0x0001;0x02\n").unwrap_err();
        assert!(matches!(err, Error::Syntax { line: 2, .. }));
    }

    #[test]
    fn test_data_overflow() {
        assert!(parse_clock_config("0x0001,0x1FF").is_err());
    }

    #[test]
    fn test_unbalanced() {
        let err = parse_clock_config(
            "# Start configuration preamble\n0x0001,0x02\n# End configuration postamble\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnbalancedSection { line: 3, .. }));
        let err =
            parse_clock_config("# Start configuration preamble\n0x0001,0x02\n").unwrap_err();
        assert!(matches!(err, Error::UnterminatedSection(s) if s == "preamble"));
    }

    #[test]
    fn test_empty() {
        assert!(matches!(
            parse_clock_config("# Part: Si5344\nAddress,Data\n"),
            Err(Error::Empty)
        ));
    }
}
