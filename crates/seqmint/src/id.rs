//! # Packed 64-bit unique id layout
//!
//! Every id minted by an agent packs seven fields into a `u64`. The layout is
//! part of the external contract: clients on other hosts and in other
//! languages unpack the same bit positions, so the fields are defined with
//! explicit shifts and masks rather than any compiler-specific bit-field
//! representation.
//!
//! ```text
//!  Bit Index:  63        35 34    30 29   25 24    21 20    14 13     6 5      0
//!              +------------+--------+-------+--------+---------+--------+-------+
//!  Field:      |  seq (29)  | hr (5) | dy(5) | mo (4) | yr (7)  | lbl(8) | us(6) |
//!              +------------+--------+-------+--------+---------+--------+-------+
//!              |<--- MSB ---------------- 64 bits ---------------------- LSB --->|
//! ```
//!
//! Fields are packed from **LSB to MSB**: `user` occupies the lowest six
//! bits, `seq` the top twenty-nine. `year` is stored relative to
//! [`BASE_YEAR`], which keeps the layout valid through 2143.

use core::fmt;

/// Year zero of the id layout. A packed `year` field holds the civil year
/// minus this base.
pub const BASE_YEAR: u16 = 2016;

/// Highest label a master may lease. Label 0 means "unleased" and 255 is
/// reserved, leaving 1..=254 for agents.
pub const LABEL_MAX: u8 = 254;

/// A packed 64-bit unique id.
///
/// Construct with [`UniqId::from_parts`], inspect with the field accessors,
/// and convert to/from the raw `u64` with [`UniqId::to_raw`] /
/// [`UniqId::from_raw`].
///
/// The raw values `0` and `1` never decode from a legitimately minted id
/// (a minted id always carries a nonzero label, and the label sits above
/// the six `user` bits), so the wire protocol reserves them as the
/// store-failure and overflow sentinels respectively.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UniqId {
    id: u64,
}

impl UniqId {
    pub const USER_BITS: u64 = 6;
    pub const LABEL_BITS: u64 = 8;
    pub const YEAR_BITS: u64 = 7;
    pub const MONTH_BITS: u64 = 4;
    pub const DAY_BITS: u64 = 5;
    pub const HOUR_BITS: u64 = 5;
    pub const SEQ_BITS: u64 = 29;

    pub const USER_SHIFT: u64 = 0;
    pub const LABEL_SHIFT: u64 = Self::USER_SHIFT + Self::USER_BITS;
    pub const YEAR_SHIFT: u64 = Self::LABEL_SHIFT + Self::LABEL_BITS;
    pub const MONTH_SHIFT: u64 = Self::YEAR_SHIFT + Self::YEAR_BITS;
    pub const DAY_SHIFT: u64 = Self::MONTH_SHIFT + Self::MONTH_BITS;
    pub const HOUR_SHIFT: u64 = Self::DAY_SHIFT + Self::DAY_BITS;
    pub const SEQ_SHIFT: u64 = Self::HOUR_SHIFT + Self::HOUR_BITS;

    pub const USER_MASK: u64 = (1 << Self::USER_BITS) - 1;
    pub const LABEL_MASK: u64 = (1 << Self::LABEL_BITS) - 1;
    pub const YEAR_MASK: u64 = (1 << Self::YEAR_BITS) - 1;
    pub const MONTH_MASK: u64 = (1 << Self::MONTH_BITS) - 1;
    pub const DAY_MASK: u64 = (1 << Self::DAY_BITS) - 1;
    pub const HOUR_MASK: u64 = (1 << Self::HOUR_BITS) - 1;
    pub const SEQ_MASK: u64 = (1 << Self::SEQ_BITS) - 1;

    /// Packs the seven fields into an id.
    ///
    /// `year` is the full civil year (e.g. 2026); the stored field is
    /// `year - BASE_YEAR`. Each argument is truncated to its field width.
    pub const fn from_parts(
        user: u8,
        label: u8,
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        seq: u32,
    ) -> Self {
        let user = (user as u64 & Self::USER_MASK) << Self::USER_SHIFT;
        let label = (label as u64 & Self::LABEL_MASK) << Self::LABEL_SHIFT;
        let year = (year.wrapping_sub(BASE_YEAR) as u64 & Self::YEAR_MASK) << Self::YEAR_SHIFT;
        let month = (month as u64 & Self::MONTH_MASK) << Self::MONTH_SHIFT;
        let day = (day as u64 & Self::DAY_MASK) << Self::DAY_SHIFT;
        let hour = (hour as u64 & Self::HOUR_MASK) << Self::HOUR_SHIFT;
        let seq = (seq as u64 & Self::SEQ_MASK) << Self::SEQ_SHIFT;
        Self {
            id: user | label | year | month | day | hour | seq,
        }
    }

    /// Caller-supplied prefix, 0..=63.
    pub const fn user(&self) -> u8 {
        ((self.id >> Self::USER_SHIFT) & Self::USER_MASK) as u8
    }

    /// Machine label of the minting agent.
    pub const fn label(&self) -> u8 {
        ((self.id >> Self::LABEL_SHIFT) & Self::LABEL_MASK) as u8
    }

    /// Full civil year (the stored offset plus [`BASE_YEAR`]).
    pub const fn year(&self) -> u16 {
        ((self.id >> Self::YEAR_SHIFT) & Self::YEAR_MASK) as u16 + BASE_YEAR
    }

    pub const fn month(&self) -> u8 {
        ((self.id >> Self::MONTH_SHIFT) & Self::MONTH_MASK) as u8
    }

    pub const fn day(&self) -> u8 {
        ((self.id >> Self::DAY_SHIFT) & Self::DAY_MASK) as u8
    }

    pub const fn hour(&self) -> u8 {
        ((self.id >> Self::HOUR_SHIFT) & Self::HOUR_MASK) as u8
    }

    /// Per-hour sequence number, 0..=536_870_911.
    pub const fn seq(&self) -> u32 {
        ((self.id >> Self::SEQ_SHIFT) & Self::SEQ_MASK) as u32
    }

    /// Largest sequence value the layout can hold.
    pub const fn max_seq() -> u32 {
        Self::SEQ_MASK as u32
    }

    pub const fn to_raw(&self) -> u64 {
        self.id
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self { id: raw }
    }
}

const _: () = {
    // Compile-time check: the field widths must cover the backing integer
    // exactly, or unpacking would alias neighboring fields.
    assert!(
        UniqId::SEQ_SHIFT + UniqId::SEQ_BITS == u64::BITS as u64,
        "id layout must cover exactly 64 bits"
    );
};

impl fmt::Display for UniqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl fmt::Debug for UniqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UniqId")
            .field("id", &format_args!("{} (0x{:x})", self.id, self.id))
            .field(
                "uri",
                &format_args!(
                    "uniq://U{}/L{:02X}/{}-{}-{}_{}/S{}",
                    self.user(),
                    self.label(),
                    self.year(),
                    self.month(),
                    self.day(),
                    self.hour(),
                    self.seq()
                ),
            )
            .finish()
    }
}

/// Renders a label as two uppercase hex digits, the form used in operator
/// tooling and transaction ids.
pub fn label_to_string(label: u8) -> String {
    format!("{label:02X}")
}
