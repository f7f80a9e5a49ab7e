//! Kernel event masks and the coarser operations callers subscribe to.

use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// Raw inotify event mask bits, as laid out by the kernel ABI.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Mask: u32 {
        const IN_ACCESS = 0x0000_0001;
        const IN_MODIFY = 0x0000_0002;
        const IN_ATTRIB = 0x0000_0004;
        const IN_CLOSE_WRITE = 0x0000_0008;
        const IN_CLOSE_NOWRITE = 0x0000_0010;
        const IN_OPEN = 0x0000_0020;
        const IN_MOVED_FROM = 0x0000_0040;
        const IN_MOVED_TO = 0x0000_0080;
        const IN_CREATE = 0x0000_0100;
        const IN_DELETE = 0x0000_0200;
        const IN_DELETE_SELF = 0x0000_0400;
        const IN_MOVE_SELF = 0x0000_0800;
        const IN_UNMOUNT = 0x0000_2000;
        const IN_Q_OVERFLOW = 0x0000_4000;
        const IN_IGNORED = 0x0000_8000;
        const IN_ONLYDIR = 0x0100_0000;
        const IN_DONT_FOLLOW = 0x0200_0000;
        const IN_EXCL_UNLINK = 0x0400_0000;
        const IN_MASK_ADD = 0x2000_0000;
        const IN_ISDIR = 0x4000_0000;

        const _ = !0;
    }
}

impl Mask {
    /// The watched directory itself went away.
    pub fn is_self_removal(self) -> bool {
        self.intersects(Mask::IN_DELETE_SELF | Mask::IN_MOVE_SELF)
    }
}

impl fmt::Display for Mask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        if names.is_empty() {
            return write!(f, "Undefined({})", self.bits());
        }
        f.write_str(&names.join("|"))
    }
}

bitflags! {
    /// Operations a watch target can subscribe to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Op: u8 {
        /// File created or moved into the directory.
        const CREATE = 0b0000_0001;
        /// File (or the watched directory) deleted.
        const REMOVE = 0b0000_0010;
        /// File (or the watched directory) moved away.
        const RENAME = 0b0000_0100;
        /// File opened for writing was closed.
        const CLOSE_WRITE = 0b0000_1000;
        /// File content modified.
        const MODIFY = 0b0001_0000;
        /// Metadata (permissions, timestamps, ownership) changed.
        const CHMOD = 0b0010_0000;
    }
}

impl Op {
    /// Everything a configuration or certificate file can go through when an
    /// editor or a deployment tool replaces it.
    pub const REPLACE: Op = Op::CREATE
        .union(Op::REMOVE)
        .union(Op::RENAME)
        .union(Op::CLOSE_WRITE);

    /// Kernel mask bits to request for this set of operations.
    pub fn to_mask(self) -> Mask {
        let mut mask = Mask::empty();
        if self.contains(Op::CREATE) {
            mask |= Mask::IN_CREATE | Mask::IN_MOVED_TO;
        }
        if self.contains(Op::REMOVE) {
            mask |= Mask::IN_DELETE | Mask::IN_DELETE_SELF;
        }
        if self.contains(Op::RENAME) {
            mask |= Mask::IN_MOVED_FROM | Mask::IN_MOVE_SELF;
        }
        if self.contains(Op::CLOSE_WRITE) {
            mask |= Mask::IN_CLOSE_WRITE;
        }
        if self.contains(Op::MODIFY) {
            mask |= Mask::IN_MODIFY;
        }
        if self.contains(Op::CHMOD) {
            mask |= Mask::IN_ATTRIB;
        }
        mask
    }

    /// Classify a kernel mask into operations.
    pub fn from_mask(mask: Mask) -> Op {
        let mut op = Op::empty();
        if mask.intersects(Mask::IN_CREATE | Mask::IN_MOVED_TO) {
            op |= Op::CREATE;
        }
        if mask.intersects(Mask::IN_DELETE | Mask::IN_DELETE_SELF) {
            op |= Op::REMOVE;
        }
        if mask.intersects(Mask::IN_MOVED_FROM | Mask::IN_MOVE_SELF) {
            op |= Op::RENAME;
        }
        if mask.contains(Mask::IN_CLOSE_WRITE) {
            op |= Op::CLOSE_WRITE;
        }
        if mask.contains(Mask::IN_MODIFY) {
            op |= Op::MODIFY;
        }
        if mask.contains(Mask::IN_ATTRIB) {
            op |= Op::CHMOD;
        }
        op
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const LABELS: [(Op, &str); 6] = [
            (Op::CREATE, "Create"),
            (Op::REMOVE, "Remove"),
            (Op::RENAME, "Rename"),
            (Op::CLOSE_WRITE, "CloseWrite"),
            (Op::MODIFY, "Write"),
            (Op::CHMOD, "Chmod"),
        ];

        let labels: Vec<&str> = LABELS
            .iter()
            .filter(|(op, _)| self.contains(*op))
            .map(|(_, label)| *label)
            .collect();
        if labels.is_empty() {
            return write!(f, "Undefined(0x{:04X})", self.bits());
        }
        f.write_str(&labels.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_mask_covers_editor_save_patterns() {
        let mask = Op::REPLACE.to_mask();
        assert!(mask.contains(Mask::IN_CLOSE_WRITE));
        assert!(mask.contains(Mask::IN_MOVED_TO));
        assert!(mask.contains(Mask::IN_DELETE_SELF));
        assert!(!mask.contains(Mask::IN_MODIFY));
    }

    #[test]
    fn classifies_kernel_bits() {
        let op = Op::from_mask(Mask::IN_MOVED_TO | Mask::IN_ISDIR);
        assert_eq!(op, Op::CREATE);

        let op = Op::from_mask(Mask::IN_CLOSE_WRITE | Mask::IN_ATTRIB);
        assert_eq!(op, Op::CLOSE_WRITE | Op::CHMOD);

        assert!(Op::from_mask(Mask::IN_IGNORED).is_empty());
    }

    #[test]
    fn display_lists_names() {
        assert_eq!((Op::CREATE | Op::MODIFY).to_string(), "Create|Write");
        assert_eq!(Op::empty().to_string(), "Undefined(0x0000)");
        assert_eq!(
            (Mask::IN_CREATE | Mask::IN_ISDIR).to_string(),
            "IN_CREATE|IN_ISDIR"
        );
    }
}
