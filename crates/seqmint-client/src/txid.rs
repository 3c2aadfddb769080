//! # Transaction-id formatting
//!
//! Renders human-structured ids ("flow numbers") from a label, a sequence
//! value and the current civil time, driven by a printf-like format string:
//!
//! | directive | meaning |
//! |---|---|
//! | `%Y` | year, 4 digits |
//! | `%M` | month, 2 digits |
//! | `%D` | day, 2 digits |
//! | `%H` | hour, 2 digits |
//! | `%m` | minute, 2 digits |
//! | `%S` | sequence value |
//! | `%L` | label, 2 uppercase hex digits |
//! | `%d` | next integer argument, decimal |
//! | `%X` | next integer argument, uppercase hex |
//! | `%s` | next string argument |
//!
//! `%S`, `%d` and `%X` take an optional single-digit width 1..=9 (`%4S`);
//! the value is reduced modulo the width and zero-padded, so the field is
//! always exactly that wide.

use chrono::{Datelike, Local, Timelike};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TxIdError {
    #[error("invalid format directive at byte {0}")]
    BadDirective(usize),
    #[error("format consumes more arguments than were provided")]
    MissingArg,
    #[error("argument {0} has the wrong type for its directive")]
    WrongArgType(usize),
}

/// A typed argument for `%d`, `%X` and `%s` directives (the varargs of the
/// original interface).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxArg<'a> {
    Int(u32),
    Str(&'a str),
}

/// The civil-time fields a format can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
}

impl TxTime {
    pub fn now() -> Self {
        let now = Local::now();
        Self {
            year: now.year() as u16,
            month: now.month() as u8,
            day: now.day() as u8,
            hour: now.hour() as u8,
            minute: now.minute() as u8,
        }
    }
}

const fn pow10(width: u32) -> u64 {
    10u64.pow(width)
}

fn push_widthed_dec(out: &mut String, value: u64, width: u32) {
    let reduced = value % pow10(width);
    out.push_str(&format!("{reduced:0width$}", width = width as usize));
}

fn push_widthed_hex(out: &mut String, value: u64, width: u32) {
    let reduced = value % 16u64.pow(width);
    out.push_str(&format!("{reduced:0width$X}", width = width as usize));
}

/// Renders one transaction id.
pub fn format_transaction_id(
    format: &str,
    args: &[TxArg<'_>],
    label: u8,
    seq: u32,
    time: &TxTime,
) -> Result<String, TxIdError> {
    fn take_arg<'a>(args: &[TxArg<'a>], next: &mut usize) -> Result<TxArg<'a>, TxIdError> {
        let arg = args.get(*next).copied().ok_or(TxIdError::MissingArg)?;
        *next += 1;
        Ok(arg)
    }

    let mut out = String::with_capacity(format.len() + 16);
    let mut next_arg = 0usize;
    let bytes = format.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            // Copy a whole UTF-8 scalar, not just one byte.
            let rest = &format[i..];
            let ch = rest.chars().next().expect("in-bounds char");
            out.push(ch);
            i += ch.len_utf8();
            continue;
        }
        i += 1;
        let &directive = bytes.get(i).ok_or(TxIdError::BadDirective(i))?;
        if directive.is_ascii_digit() {
            let width = u32::from(directive - b'0');
            if width == 0 {
                return Err(TxIdError::BadDirective(i));
            }
            i += 1;
            match bytes.get(i) {
                Some(b'S') => push_widthed_dec(&mut out, u64::from(seq), width),
                Some(b'd') => match take_arg(args, &mut next_arg)? {
                    TxArg::Int(v) => push_widthed_dec(&mut out, u64::from(v), width),
                    TxArg::Str(_) => return Err(TxIdError::WrongArgType(next_arg - 1)),
                },
                Some(b'X') => match take_arg(args, &mut next_arg)? {
                    TxArg::Int(v) => push_widthed_hex(&mut out, u64::from(v), width),
                    TxArg::Str(_) => return Err(TxIdError::WrongArgType(next_arg - 1)),
                },
                _ => return Err(TxIdError::BadDirective(i)),
            }
            i += 1;
            continue;
        }
        match directive {
            b'S' => out.push_str(&seq.to_string()),
            b'L' => out.push_str(&format!("{label:02X}")),
            b'Y' => out.push_str(&format!("{:04}", time.year)),
            b'M' => out.push_str(&format!("{:02}", time.month)),
            b'D' => out.push_str(&format!("{:02}", time.day)),
            b'H' => out.push_str(&format!("{:02}", time.hour)),
            b'm' => out.push_str(&format!("{:02}", time.minute)),
            b'd' => match take_arg(args, &mut next_arg)? {
                TxArg::Int(v) => out.push_str(&v.to_string()),
                TxArg::Str(_) => return Err(TxIdError::WrongArgType(next_arg - 1)),
            },
            b'X' => match take_arg(args, &mut next_arg)? {
                TxArg::Int(v) => out.push_str(&format!("{v:X}")),
                TxArg::Str(_) => return Err(TxIdError::WrongArgType(next_arg - 1)),
            },
            b's' => match take_arg(args, &mut next_arg)? {
                TxArg::Str(s) => out.push_str(s),
                TxArg::Int(_) => return Err(TxIdError::WrongArgType(next_arg - 1)),
            },
            _ => return Err(TxIdError::BadDirective(i)),
        }
        i += 1;
    }
    Ok(out)
}
