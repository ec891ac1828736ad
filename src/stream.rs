//! Descriptor negotiation between adjacent pipeline stages.
//!
//! Every node declares, per standard stream, what it can do
//! ([`SlotCap`]), and every `start` call states, per standard stream, what
//! it wants ([`Slot`]). The [`Caps::check`] validation runs before any
//! descriptor is opened, process forked or thread spawned, so a rejected
//! request commits nothing.

use std::ops::BitOr;
use std::os::fd::RawFd;

use crate::error::{Error, Result};

/// What a caller asks a node to do with one standard stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Slot {
    /// Leave the stream unwired; a forked child inherits the caller's.
    #[default]
    Absent,
    /// The node allocates its own descriptor and exposes the caller-side
    /// end through `Running::streams`.
    New,
    /// The node adopts this descriptor; ownership (and the duty to close
    /// it) transfers when the start succeeds.
    Handle(RawFd),
}

/// Requests for stdin, stdout and stderr together.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Streams {
    pub stdin: Slot,
    pub stdout: Slot,
    pub stderr: Slot,
}

/// What a node is able to do with one stream slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotCap(u8);

impl SlotCap {
    /// The slot may be left unwired.
    pub const ABSENT: SlotCap = SlotCap(1);
    /// The node can allocate a descriptor of its own for the slot.
    pub const CREATE: SlotCap = SlotCap(2);
    /// The node can adopt a caller-supplied descriptor.
    pub const ACCEPT: SlotCap = SlotCap(4);

    pub fn allows_absent(self) -> bool {
        self.0 & SlotCap::ABSENT.0 != 0
    }

    pub fn allows_create(self) -> bool {
        self.0 & SlotCap::CREATE.0 != 0
    }

    pub fn allows_accept(self) -> bool {
        self.0 & SlotCap::ACCEPT.0 != 0
    }

    fn admits(self, slot: Slot) -> bool {
        match slot {
            Slot::Absent => self.allows_absent(),
            Slot::New => self.allows_create(),
            Slot::Handle(_) => self.allows_accept(),
        }
    }
}

impl Default for SlotCap {
    fn default() -> SlotCap {
        SlotCap::ABSENT
    }
}

impl BitOr for SlotCap {
    type Output = SlotCap;

    fn bitor(self, rhs: SlotCap) -> SlotCap {
        SlotCap(self.0 | rhs.0)
    }
}

/// A node's declared capability for all three standard streams.
///
/// The default is absent-only everywhere: such a node touches no stdio and
/// can only run stream-less.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Caps {
    pub stdin: SlotCap,
    pub stdout: SlotCap,
    pub stderr: SlotCap,
}

impl Caps {
    /// Validate a request against this capability set.
    pub fn check(&self, streams: &Streams) -> Result<()> {
        if !self.stdin.admits(streams.stdin) {
            return Err(Error::StreamMismatch("stdin"));
        }
        if !self.stdout.admits(streams.stdout) {
            return Err(Error::StreamMismatch("stdout"));
        }
        if !self.stderr.admits(streams.stderr) {
            return Err(Error::StreamMismatch("stderr"));
        }
        Ok(())
    }
}

/// Redirect targets for discarding output and sourcing zero bytes, usable
/// anywhere an ordinary file path is.
pub mod dev {
    pub const NULL: &str = "/dev/null";
    pub const ZERO: &str = "/dev/zero";
}
