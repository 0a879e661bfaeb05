//! Trailing-terminator compatibility.
//!
//! Database files exist in two physical forms: every key and value stored
//! with one trailing zero byte, or stored exactly as given. A handle starts
//! [`Encoding::Undecided`] (unless the caller pins a form at open), probes
//! the terminated form first, and settles on whichever form produced the
//! first hit. Once settled it never probes or writes the other form.

use serde::{Deserialize, Serialize};

use crate::DictFlags;

/// Physical form of keys and values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Form {
    /// One zero byte appended to every key and value.
    Terminated,
    /// Keys and values stored as given.
    Bare,
}

impl Form {
    /// Write `data` in this form into `buf`, replacing its contents.
    pub fn encode_into(self, data: &[u8], buf: &mut Vec<u8>) {
        buf.clear();
        buf.extend_from_slice(data);
        if self == Self::Terminated {
            buf.push(0);
        }
    }
}

/// Per-handle encoding state. Moves from `Undecided` to `Confirmed` once and
/// never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// Both forms are still plausible.
    Undecided,
    /// Only this form is used.
    Confirmed(Form),
}

impl Encoding {
    /// Initial state from the `TRY1NULL`/`TRY0NULL` flags. Neither or both
    /// flags leave the handle undecided.
    pub const fn from_flags(flags: DictFlags) -> Self {
        let with = flags.contains(DictFlags::TRY1NULL);
        let without = flags.contains(DictFlags::TRY0NULL);
        match (with, without) {
            (true, false) => Self::Confirmed(Form::Terminated),
            (false, true) => Self::Confirmed(Form::Bare),
            _ => Self::Undecided,
        }
    }

    /// Forms to probe, in order.
    pub const fn candidates(self) -> &'static [Form] {
        match self {
            Self::Undecided => &[Form::Terminated, Form::Bare],
            Self::Confirmed(Form::Terminated) => &[Form::Terminated],
            Self::Confirmed(Form::Bare) => &[Form::Bare],
        }
    }

    /// Whether `form` may still be probed.
    pub fn is_plausible(self, form: Form) -> bool {
        match self {
            Self::Undecided => true,
            Self::Confirmed(confirmed) => confirmed == form,
        }
    }

    /// Record a hit under `form`.
    pub fn confirm(&mut self, form: Form) {
        debug_assert!(self.is_plausible(form), "{self:?} cannot confirm {form:?}");
        if *self == Self::Undecided {
            *self = Self::Confirmed(form);
        }
    }

    /// Form to write with, settling on `default` if still undecided.
    pub fn for_write(&mut self, default: Form) -> Form {
        match *self {
            Self::Undecided => {
                *self = Self::Confirmed(default);
                default
            }
            Self::Confirmed(form) => form,
        }
    }

    /// The settled form, if any.
    pub const fn confirmed(self) -> Option<Form> {
        match self {
            Self::Undecided => None,
            Self::Confirmed(form) => Some(form),
        }
    }

    /// Equivalent `TRY1NULL`/`TRY0NULL` flag bits.
    pub const fn as_flags(self) -> DictFlags {
        match self {
            Self::Undecided => DictFlags::TRY1NULL.union(DictFlags::TRY0NULL),
            Self::Confirmed(Form::Terminated) => DictFlags::TRY1NULL,
            Self::Confirmed(Form::Bare) => DictFlags::TRY0NULL,
        }
    }
}

/// Copy `data` up to its first zero byte into `buf`, keeping `buf` zero
/// terminated, and return the copy without the terminator.
pub fn copy_terminated<'a>(buf: &'a mut Vec<u8>, data: &[u8]) -> &'a [u8] {
    let len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    buf.clear();
    buf.extend_from_slice(&data[..len]);
    buf.push(0);
    &buf[..len]
}

/// The contents of a buffer filled by [`copy_terminated`].
pub fn terminated_contents(buf: &[u8]) -> &[u8] {
    buf.split_last().map_or(buf, |(_, rest)| rest)
}
