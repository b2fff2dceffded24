//! Call-site identity of a system call.
//!
//! A fingerprint is the syscall number plus the frame keys of the stack the
//! call was issued from. In no-backtrace mode the stack degenerates to a
//! single synthetic frame, so the fingerprint reduces to `(pc, sp, syscall)`.
//! Equality and order are total and element-wise; each frame has exactly one
//! textual spelling.

use crate::error::Error;
use engine::{StackFrame, SyscallEntry};
use std::fmt;

/// Separates the syscall number from the frame list.
const FIELD_SEPARATOR: char = '\u{1e}';
/// Separates frames from each other.
const FRAME_SEPARATOR: char = '\u{1f}';
const OFFSET_SEPARATOR: char = '@';

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint {
    syscall: i64,
    frames: Vec<FrameKey>,
}

/// What identifies one frame: the resolved symbol, or the raw program
/// counter when no symbol exists. The offset field carries the function
/// offset for symbolic frames and the stack pointer for synthetic ones.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameKey {
    label: FrameLabel,
    offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FrameLabel {
    Symbol(Box<str>),
    Address(u64),
}

impl FrameKey {
    fn of(frame: &StackFrame) -> Self {
        match &frame.function {
            Some(name) => Self {
                label: FrameLabel::Symbol(name.clone()),
                offset: frame.function_offset,
            },
            None => Self {
                label: FrameLabel::Address(frame.pc),
                offset: frame.function_offset,
            },
        }
    }

    pub fn symbol(name: &str, offset: u64) -> Self {
        Self {
            label: FrameLabel::Symbol(name.into()),
            offset,
        }
    }

    pub fn address(pc: u64, offset: u64) -> Self {
        Self {
            label: FrameLabel::Address(pc),
            offset,
        }
    }

    fn parse(text: &str) -> Result<Self, Error> {
        let (label, offset) = text.rsplit_once(OFFSET_SEPARATOR).ok_or_else(|| {
            Error::Fingerprint(format!("frame {text:?} is missing its offset"))
        })?;
        let offset: u64 = offset
            .parse()
            .map_err(|_| Error::Fingerprint(format!("invalid frame offset {offset:?}")))?;
        if label.is_empty() {
            return Err(Error::Fingerprint("empty frame label".into()));
        }
        let label = match label.parse::<u64>() {
            Ok(pc) => FrameLabel::Address(pc),
            Err(_) => FrameLabel::Symbol(label.into()),
        };
        Ok(Self { label, offset })
    }
}

impl fmt::Display for FrameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            FrameLabel::Symbol(name) => write!(f, "{name}{OFFSET_SEPARATOR}{}", self.offset),
            FrameLabel::Address(pc) => write!(f, "{pc}{OFFSET_SEPARATOR}{}", self.offset),
        }
    }
}

impl Fingerprint {
    /// The fingerprint of an observed syscall entry.
    pub fn of(entry: &SyscallEntry) -> Self {
        Self {
            syscall: entry.syscall_no(),
            frames: entry.stack().iter().map(FrameKey::of).collect(),
        }
    }

    pub fn from_parts(syscall: i64, frames: Vec<FrameKey>) -> Self {
        Self { syscall, frames }
    }

    pub fn syscall(&self) -> i64 {
        self.syscall
    }

    /// The canonical one-line spelling stored in the associations file.
    pub fn serialise(&self) -> String {
        let mut line = self.syscall.to_string();
        if self.frames.is_empty() {
            return line;
        }
        line.push(FIELD_SEPARATOR);
        for (index, frame) in self.frames.iter().enumerate() {
            if index > 0 {
                line.push(FRAME_SEPARATOR);
            }
            line.push_str(&frame.to_string());
        }
        line
    }

    /// Inverse of [`Fingerprint::serialise`].
    pub fn parse(text: &str) -> Result<Self, Error> {
        let (head, frames_text) = match text.split_once(FIELD_SEPARATOR) {
            Some((head, rest)) => (head, Some(rest)),
            None => (text, None),
        };
        let syscall: i64 = head
            .parse()
            .map_err(|_| Error::Fingerprint(format!("invalid syscall number {head:?}")))?;
        if syscall < 0 {
            return Err(Error::Fingerprint(format!(
                "negative syscall number {syscall}"
            )));
        }
        let frames = match frames_text {
            Some(text) => text
                .split(FRAME_SEPARATOR)
                .map(FrameKey::parse)
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        Ok(Self { syscall, frames })
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({})",
            engine::syscalls::name(self.syscall),
            self.syscall
        )?;
        for frame in &self.frames {
            write!(f, " <- {frame}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn symbolic() -> Fingerprint {
        Fingerprint::from_parts(
            1,
            vec![
                FrameKey::symbol("write", 7),
                FrameKey::symbol("flush_buffers", 130),
                FrameKey::symbol("main", 42),
            ],
        )
    }

    #[test]
    fn serialise_parse_roundtrip() {
        let print = symbolic();
        assert_eq!(Fingerprint::parse(&print.serialise()).unwrap(), print);

        let synthetic = Fingerprint::from_parts(60, vec![FrameKey::address(0x40_1000, 0x7ffd_0000)]);
        assert_eq!(Fingerprint::parse(&synthetic.serialise()).unwrap(), synthetic);

        let frameless = Fingerprint::from_parts(2, Vec::new());
        assert_eq!(Fingerprint::parse(&frameless.serialise()).unwrap(), frameless);
    }

    #[test]
    fn canonical_form_distinguishes_symbol_from_address() {
        // An unresolved frame spells its pc in decimal; a symbolic frame
        // spells its name. The two never collide even with equal offsets.
        let symbol = Fingerprint::from_parts(0, vec![FrameKey::symbol("read", 5)]);
        let address = Fingerprint::from_parts(0, vec![FrameKey::address(99, 5)]);
        assert_ne!(symbol, address);
        assert_ne!(symbol.serialise(), address.serialise());
    }

    #[test]
    fn equality_is_element_wise() {
        let a = symbolic();
        let mut b = symbolic();
        assert_eq!(a, b);
        b = Fingerprint::from_parts(1, vec![FrameKey::symbol("write", 8)]);
        assert_ne!(a, b);
        assert_ne!(a, Fingerprint::from_parts(2, Vec::new()));
    }

    #[test]
    fn order_is_total() {
        let mut prints = vec![
            Fingerprint::from_parts(3, Vec::new()),
            Fingerprint::from_parts(1, vec![FrameKey::symbol("a", 1)]),
            Fingerprint::from_parts(1, vec![FrameKey::symbol("a", 2)]),
            Fingerprint::from_parts(2, vec![FrameKey::address(9, 0)]),
        ];
        prints.sort();
        for pair in prints.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(Fingerprint::parse("not-a-number").is_err());
        assert!(Fingerprint::parse("-3").is_err());
        assert!(Fingerprint::parse("1\u{1e}frame-without-offset").is_err());
        assert!(Fingerprint::parse("1\u{1e}name@junk").is_err());
    }

    #[test]
    fn of_entry_uses_the_stack() {
        let entry = SyscallEntry::synthetic(
            "/bin/true",
            5,
            5,
            0,
            1,
            vec![
                StackFrame::symbolic(0x10, 0x10, 0x20, "write".into(), 7),
                StackFrame::synthetic(0x30, 0x30, 0x40),
            ],
        );
        let print = Fingerprint::of(&entry);
        assert_eq!(
            print,
            Fingerprint::from_parts(
                1,
                vec![FrameKey::symbol("write", 7), FrameKey::address(0x30, 0x40)]
            )
        );
    }
}
