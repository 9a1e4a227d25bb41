//! Errors raised by map loading and collision-model queries.
//!
//! Everything here aborts the current level load or rejects a caller
//! argument. Conditions the engine can recover from (vis overruns,
//! reflooded areas) are logged instead and never surface as an error.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CmError {
    /// No data was supplied for a non-empty map name
    #[error("couldn't load {0}")]
    CouldNotLoad(String),

    /// The buffer is shorter than the lump directory
    #[error("{0}: file too short for a BSP header")]
    TooShort(String),

    #[error("{name}: bad ident {found:#010x}")]
    BadIdent { name: String, found: i32 },

    #[error("{name} has wrong version number ({found} should be {expected})")]
    WrongVersion {
        name: String,
        found: i32,
        expected: i32,
    },

    /// A lump's offset/length points outside the file
    #[error("lump {lump} out of range (ofs {ofs}, len {len})")]
    LumpOutOfRange { lump: &'static str, ofs: i32, len: i32 },

    /// Lump length is not a multiple of its record size
    #[error("funny lump size ({0})")]
    FunnyLumpSize(&'static str),

    #[error("map with no {0}")]
    Empty(&'static str),

    #[error("map has too many {what} ({count} > {max})")]
    TooMany {
        what: &'static str,
        count: usize,
        max: usize,
    },

    #[error("map leaf 0 is not CONTENTS_SOLID")]
    Leaf0NotSolid,

    #[error("map does not have an empty leaf")]
    NoEmptyLeaf,

    #[error("bad brushside texinfo {texinfo} at side {side}")]
    BadBrushSideTexinfo { side: usize, texinfo: i32 },

    /// A node, leaf, brush or model references an index outside its array
    #[error("bad {what} reference {index}")]
    BadReference { what: &'static str, index: i64 },

    #[error("not enough room for box tree")]
    NoRoomForBoxHull,

    #[error("inline model: bad name {0:?}")]
    BadInlineModelName(String),

    #[error("inline model: bad number {0}")]
    BadInlineModelNumber(i64),

    #[error("leaf number {0} out of range")]
    BadLeafNum(usize),

    #[error("area {0} > numareas")]
    BadAreaNum(usize),

    #[error("areaportal {0} > numareaportals")]
    BadPortalNum(usize),
}

pub type CmResult<T> = std::result::Result<T, CmError>;
