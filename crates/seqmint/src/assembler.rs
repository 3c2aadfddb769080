//! # Id assembler
//!
//! Turns a freshly allocated sequence value into a packed [`UniqId`] and
//! refuses to mint a duplicate when the per-hour sequence space wraps.
//!
//! Only the civil hour of the timestamp is encoded, so the local-time
//! decomposition is cached and reused for up to 30 seconds rather than
//! recomputed per id.

use crate::{BASE_YEAR, UniqId};
use chrono::{Datelike, Local, TimeZone, Timelike};
use thiserror::Error;

/// How long a civil-time decomposition may be reused.
pub const CIVIL_CACHE_SECONDS: u64 = 30;

/// Last civil year the 7-bit year field can represent.
pub const MAX_YEAR: u16 = BASE_YEAR + UniqId::YEAR_MASK as u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AssembleError {
    /// The hour bucket already emitted this sequence value once; minting it
    /// again would duplicate an id. Callers recover by encoding finer time
    /// (for example the minute) into the `user` prefix, or by waiting out
    /// the hour.
    #[error("per-hour sequence space exhausted")]
    Overflow,
    /// The timestamp cannot be mapped to a civil time.
    #[error("timestamp {0} has no civil representation")]
    InvalidTimestamp(u64),
    /// The timestamp's year does not fit the id layout.
    #[error("year {0} outside the id layout range {BASE_YEAR}..={MAX_YEAR}")]
    YearOutOfRange(u16),
}

/// A local-time `{year, month, day, hour}` tuple, the id's time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CivilTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
}

impl CivilTime {
    /// Decomposes a Unix timestamp in the agent's local zone.
    pub fn from_seconds_local(seconds: u64) -> Result<Self, AssembleError> {
        let secs = i64::try_from(seconds).map_err(|_| AssembleError::InvalidTimestamp(seconds))?;
        let datetime = Local
            .timestamp_opt(secs, 0)
            .single()
            .ok_or(AssembleError::InvalidTimestamp(seconds))?;
        let year = u16::try_from(datetime.year())
            .map_err(|_| AssembleError::InvalidTimestamp(seconds))?;
        if !(BASE_YEAR..=MAX_YEAR).contains(&year) {
            return Err(AssembleError::YearOutOfRange(year));
        }
        Ok(Self {
            year,
            month: datetime.month() as u8,
            day: datetime.day() as u8,
            hour: datetime.hour() as u8,
        })
    }
}

/// Stateful assembler: caches the civil-time decomposition and remembers the
/// previously emitted `(bucket, seq)` pair to detect intra-hour wrap.
///
/// One assembler instance belongs to one agent dispatcher; it is not shared
/// across threads.
#[derive(Debug, Default)]
pub struct IdAssembler {
    cached: Option<(u64, CivilTime)>,
    prev: Option<(CivilTime, u32)>,
}

impl IdAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    fn civil(&mut self, seconds: u64) -> Result<CivilTime, AssembleError> {
        if let Some((cached_at, civil)) = self.cached
            && seconds.abs_diff(cached_at) <= CIVIL_CACHE_SECONDS
        {
            return Ok(civil);
        }
        let civil = CivilTime::from_seconds_local(seconds)?;
        self.cached = Some((seconds, civil));
        Ok(civil)
    }

    /// Assembles one id.
    ///
    /// `seconds` is the caller-supplied reference time; the dispatcher
    /// substitutes its own clock when the client sent 0. `seq` is the raw
    /// allocation; only its low 29 bits are encoded, and the comparison that
    /// detects wrap is performed on the encoded value.
    ///
    /// # Errors
    ///
    /// [`AssembleError::Overflow`] when the same hour bucket would see a
    /// sequence value repeat; time decomposition errors as above. The
    /// assembler records the tuple only for ids it actually emits.
    pub fn assemble(
        &mut self,
        user: u8,
        label: u8,
        seq: u32,
        seconds: u64,
    ) -> Result<UniqId, AssembleError> {
        let civil = self.civil(seconds)?;
        let encoded_seq = seq & UniqId::SEQ_MASK as u32;
        if let Some((prev_civil, prev_seq)) = self.prev
            && prev_civil == civil
            && encoded_seq < prev_seq
        {
            return Err(AssembleError::Overflow);
        }
        self.prev = Some((civil, encoded_seq));
        Ok(UniqId::from_parts(
            user,
            label,
            civil.year,
            civil.month,
            civil.day,
            civil.hour,
            encoded_seq,
        ))
    }

}
