//! Identifiers shared by the firmware and software: board, carrier and design codes, endpoint
//! states, timing commands and the registry of known boards.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::fmt;

/// Number of timing commands, and so the length of every per-command counter block
pub const COMMAND_NUMBER: usize = 16;

/// Words in one event record of a readout buffer
pub const WORDS_PER_EVENT: usize = 6;

macro_rules! code_enum {
    ($name:ident { $($variant:ident = $code:literal => $label:literal),+ $(,)? }) => {
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive)]
        pub enum $name {
            $($variant = $code),+
        }

        impl $name {
            /// Look up the entry with the firmware code `code`
            #[must_use]
            pub fn from_code(code: u32) -> Option<Self> {
                <Self as FromPrimitive>::from_u32(code)
            }

            #[must_use]
            pub fn code(self) -> u32 {
                self as u32
            }

            #[must_use]
            pub fn label(self) -> &'static str {
                match self {
                    $(Self::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.label())
            }
        }
    };
}

code_enum!(BoardType {
    Fmc = 0 => "fmc",
    Sim = 1 => "sim",
    Pc059 = 2 => "pc059",
    Microzed = 3 => "microzed",
    Tlu = 4 => "tlu",
    Gib = 8 => "gib",
});

code_enum!(CarrierType {
    EnclustraA35 = 0 => "enclustra-a35",
    Kc705 = 1 => "kc705",
    Microzed = 2 => "microzed",
});

code_enum!(DesignType {
    Master = 0 => "master",
    Ouroboros = 1 => "ouroboros",
    OuroborosSim = 2 => "ouroboros-sim",
    Endpoint = 4 => "endpoint",
    Fanout = 5 => "fanout",
});

code_enum!(EndpointState {
    StandingBy = 0x0 => "Standing by (0x0)",
    WaitingSfpSignal = 0x1 => "Waiting SFP for signal (0x1)",
    WaitingCdrLock = 0x2 => "Waiting CDR lock (0x2)",
    WaitingFrequencyCheck = 0x3 => "Waiting for good frequency check (0x3)",
    WaitingCommaAlignment = 0x4 => "Waiting for comma alignment (0x4)",
    Waiting8b10bDecoder = 0x5 => "Waiting for 8b10 decoder good packet (0x5)",
    WaitingPhaseAdjust = 0x6 => "Waiting for phase adjustment command (0x6)",
    WaitingTimestampInit = 0x7 => "Waiting for time stamp initialisation (0x7)",
    Ready = 0x8 => "Ready (0x8)",
    RxError = 0xc => "Error in Rx (0xc)",
    TimestampError = 0xd => "Error in time stamp reception (0xd)",
    PhysicalLayerError = 0xe => "Error in physical layer after lock (0xe)",
});

code_enum!(Command {
    TimeSync = 0 => "TimeSync",
    Echo = 1 => "Echo",
    SpillStart = 2 => "SpillStart",
    SpillStop = 3 => "SpillStop",
    RunStart = 4 => "RunStart",
    RunStop = 5 => "RunStop",
    WibCalib = 6 => "WibCalib",
    SspCalib = 7 => "SSPCalib",
    FakeTrig0 = 8 => "FakeTrig0",
    FakeTrig1 = 9 => "FakeTrig1",
    FakeTrig2 = 10 => "FakeTrig2",
    FakeTrig3 = 11 => "FakeTrig3",
    BeamTrig = 12 => "BeamTrig",
    NoBeamTrig = 13 => "NoBeamTrig",
    ExtFakeTrig = 14 => "ExtFakeTrig",
    Reserved = 15 => "Reserved",
});

impl EndpointState {
    /// Describe a raw state code, including ones this library doesn't know about
    #[must_use]
    pub fn describe(code: u32) -> String {
        Self::from_code(code).map_or_else(|| format!("Unknown ({code:#x})"), |s| s.to_string())
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::RxError | Self::TimestampError | Self::PhysicalLayerError
        )
    }
}

impl Command {
    /// The fake trigger command generated by channel `chan`
    #[must_use]
    pub fn fake_trigger(chan: u32) -> Option<Self> {
        match chan {
            0 => Some(Self::FakeTrig0),
            1 => Some(Self::FakeTrig1),
            2 => Some(Self::FakeTrig2),
            3 => Some(Self::FakeTrig3),
            _ => None,
        }
    }
}

/// Hardware revisions of the timing boards, each with its own clock configuration
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BoardRevision {
    FmcRev1,
    FmcRev2,
    Pc059Rev1,
    TluRev1,
    GibRev1,
    /// PC059 running as a fanout, fed over HDMI
    Pc059FanoutHdmi,
    /// PC059 running as a fanout, fed over the upstream SFP
    Pc059FanoutSfp,
}

impl BoardRevision {
    /// Path of the clock chip configuration, relative to the clock configuration directory
    #[must_use]
    pub fn clock_config(self) -> &'static str {
        match self {
            Self::FmcRev1 => "SI5344/PDTS0000.txt",
            Self::FmcRev2 => "SI5344/PDTS0003.txt",
            Self::Pc059Rev1 => "SI5345/PDTS0005.txt",
            Self::TluRev1 => "devel/PDTS_TLU_MASTER_ONLYLEMOIN.txt",
            Self::GibRev1 => "SI5395/GIB_Debug_01.txt",
            Self::Pc059FanoutHdmi => "devel/PDTS_PC059_FANOUT.txt",
            Self::Pc059FanoutSfp => "devel/PDTS_PC059_FANOUT_SFP_IN.txt",
        }
    }

    /// The revision of a board from the unique ID burned into its PROM
    #[must_use]
    pub fn from_uid(uid: u64) -> Option<Self> {
        match uid {
            0xd880_395e_720b | 0xd880_395e_501a | 0xd880_395e_50b8 | 0xd880_395e_501b
            | 0xd880_395e_7201 | 0xd880_395e_4fcc | 0xd880_395e_5069 | 0xd880_395e_7206 => {
                Some(Self::FmcRev1)
            }
            0xd880_395e_1c86 | 0xd880_395e_2630 | 0xd880_395e_262b | 0xd880_395e_2b38
            | 0xd880_395e_1a6a | 0xd880_395e_36ae | 0xd880_395e_2b2e | 0xd880_395e_2b33
            | 0xd880_395e_1c81 | 0x5410_ec64_76f1 => Some(Self::FmcRev2),
            0xd880_39d9_80cf | 0xd880_39d9_8adf | 0xd880_39d9_2491 | 0xd880_39d9_248e
            | 0xd880_39d9_8ae9 | 0xd880_39d9_2498 => Some(Self::Pc059Rev1),
            _ => None,
        }
    }

    /// The revision a PC059 takes on in fanout `mode` (1: HDMI input, 2: SFP input)
    #[must_use]
    pub fn pc059_fanout(mode: u32) -> Option<Self> {
        match mode {
            1 => Some(Self::Pc059FanoutHdmi),
            2 => Some(Self::Pc059FanoutSfp),
            _ => None,
        }
    }
}

impl fmt::Display for BoardRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FmcRev1 => "fmc-rev1",
            Self::FmcRev2 => "fmc-rev2",
            Self::Pc059Rev1 => "pc059-rev1",
            Self::TluRev1 => "tlu-rev1",
            Self::GibRev1 => "gib-rev1",
            Self::Pc059FanoutHdmi => "pc059-fanout-hdmi",
            Self::Pc059FanoutSfp => "pc059-fanout-sfp",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(BoardType::from_code(2), Some(BoardType::Pc059));
        assert_eq!(BoardType::from_code(8), Some(BoardType::Gib));
        assert_eq!(BoardType::from_code(5), None);
        assert_eq!(DesignType::Fanout.code(), 5);
        assert_eq!(CarrierType::from_code(1), Some(CarrierType::Kc705));
        assert_eq!(Command::from_code(7).unwrap().to_string(), "SSPCalib");
        assert_eq!(Command::from_code(16), None);
    }

    #[test]
    fn test_endpoint_state() {
        assert_eq!(EndpointState::describe(8), "Ready (0x8)");
        assert_eq!(EndpointState::describe(0x9), "Unknown (0x9)");
        assert!(EndpointState::RxError.is_error());
        assert!(!EndpointState::Ready.is_error());
    }

    #[test]
    fn test_revisions() {
        assert_eq!(
            BoardRevision::from_uid(0xd880_395e_501a),
            Some(BoardRevision::FmcRev1)
        );
        assert_eq!(
            BoardRevision::from_uid(0x5410_ec64_76f1),
            Some(BoardRevision::FmcRev2)
        );
        assert_eq!(
            BoardRevision::from_uid(0xd880_39d9_80cf)
                .map(BoardRevision::clock_config),
            Some("SI5345/PDTS0005.txt")
        );
        assert_eq!(BoardRevision::from_uid(0x1234), None);
        assert_eq!(
            BoardRevision::pc059_fanout(2).map(BoardRevision::clock_config),
            Some("devel/PDTS_PC059_FANOUT_SFP_IN.txt")
        );
    }
}
