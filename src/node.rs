//! The composition algebra: immutable descriptions of pipeline stages and
//! combinators.
//!
//! A [`Node`] is a reusable template. Starting one produces an independent
//! [`Running`] instance and leaves the template untouched, so the same tree
//! can be started any number of times. Composition is by value: building
//! `a.pipe(b)` moves `a` and `b` in, and `clone` deep-copies the whole tree
//! when the original is still needed elsewhere.

use std::ops::BitOr;

use crate::engine;
use crate::env::Env;
use crate::error::Result;
use crate::running::Running;
use crate::stream::{Caps, SlotCap, Streams};
use crate::value::Value;

/// How a [`Node::Redirect`] opens its file. Combine flags with `|`;
/// [`OpenMode::APPEND`] already includes write access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenMode(u8);

impl OpenMode {
    /// Open for reading.
    pub const READ: OpenMode = OpenMode(1);
    /// Open for writing, truncating previous contents.
    pub const WRITE: OpenMode = OpenMode(2);
    /// Open for writing at the end of the file.
    pub const APPEND: OpenMode = OpenMode(2 | 4);

    pub(crate) fn reads(self) -> bool {
        self.0 & OpenMode::READ.0 != 0
    }

    pub(crate) fn writes(self) -> bool {
        self.0 & OpenMode::WRITE.0 != 0
    }

    pub(crate) fn appends(self) -> bool {
        self.0 & (OpenMode::APPEND.0 & !OpenMode::WRITE.0) != 0
    }
}

impl BitOr for OpenMode {
    type Output = OpenMode;

    fn bitor(self, rhs: OpenMode) -> OpenMode {
        OpenMode(self.0 | rhs.0)
    }
}

/// One stage or combinator in a pipeline description.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    /// External command. Argv is resolved in the forked child; the child's
    /// environment block holds the exportable entries only.
    Exec { argv: Vec<Value> },
    /// Left side's output feeds the right side's input.
    Pipe { lhs: Box<Node>, rhs: Box<Node> },
    /// Run `lhs`; run `rhs` only if `lhs` succeeded.
    And { lhs: Box<Node>, rhs: Box<Node> },
    /// Run `lhs`; run `rhs` only if `lhs` failed.
    Or { lhs: Box<Node>, rhs: Box<Node> },
    /// Read input to end of stream into a variable (non-exportable).
    Capture { name: String },
    /// Write the resolved words, space separated and newline terminated.
    Emit { words: Vec<Value> },
    /// Open a file and expose its descriptor to an adjacent pipe.
    Redirect { path: Value, mode: OpenMode },
    /// Does nothing, status 0.
    Succeed,
    /// Does nothing, status -1.
    Fail,
}

impl Node {
    pub fn exec<I, T>(argv: I) -> Node
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Node::Exec {
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }

    pub fn emit<I, T>(words: I) -> Node
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Node::Emit {
            words: words.into_iter().map(Into::into).collect(),
        }
    }

    pub fn capture(name: impl Into<String>) -> Node {
        Node::Capture { name: name.into() }
    }

    pub fn open(path: impl Into<Value>, mode: OpenMode) -> Node {
        Node::Redirect {
            path: path.into(),
            mode,
        }
    }

    pub fn succeed() -> Node {
        Node::Succeed
    }

    pub fn fail() -> Node {
        Node::Fail
    }

    /// Feed this node's output into `rhs`. Also available as `self | rhs`.
    pub fn pipe(self, rhs: Node) -> Node {
        Node::Pipe {
            lhs: Box::new(self),
            rhs: Box::new(rhs),
        }
    }

    /// Run `rhs` only if this node succeeds; the chain succeeds when both do.
    pub fn and_then(self, rhs: Node) -> Node {
        Node::And {
            lhs: Box::new(self),
            rhs: Box::new(rhs),
        }
    }

    /// Run `rhs` only if this node fails; the chain succeeds when either does.
    pub fn or_else(self, rhs: Node) -> Node {
        Node::Or {
            lhs: Box::new(self),
            rhs: Box::new(rhs),
        }
    }

    /// Redirect output into `path`, truncating it first.
    pub fn write_to(self, path: impl Into<Value>) -> Node {
        self.pipe(Node::open(path, OpenMode::WRITE))
    }

    /// Redirect output onto the end of `path`.
    pub fn append_to(self, path: impl Into<Value>) -> Node {
        self.pipe(Node::open(path, OpenMode::APPEND))
    }

    /// Read input from `path`.
    pub fn read_from(self, path: impl Into<Value>) -> Node {
        Node::open(path, OpenMode::READ).pipe(self)
    }

    /// Feed a single emitted line into this node's input.
    pub fn feed(self, text: impl Into<Value>) -> Node {
        Node::emit([text.into()]).pipe(self)
    }

    /// The stream capability this node declares for negotiation.
    ///
    /// A pipe inherits its input capability from the left child and both its
    /// output and error capability from the right child's output; error
    /// mirrors output throughout the combined-stream convention. And/Or are
    /// stream-less: redirection belongs on their children, and wiring one
    /// directly into a pipe fails negotiation.
    pub fn caps(&self) -> Caps {
        let full = SlotCap::ABSENT | SlotCap::CREATE | SlotCap::ACCEPT;
        match self {
            Node::Exec { .. } => Caps {
                stdin: full,
                stdout: full,
                stderr: full,
            },
            Node::Pipe { lhs, rhs } => {
                let out = rhs.caps().stdout;
                Caps {
                    stdin: lhs.caps().stdin,
                    stdout: out,
                    stderr: out,
                }
            }
            Node::Capture { .. } => Caps {
                stdin: SlotCap::CREATE | SlotCap::ACCEPT,
                ..Caps::default()
            },
            Node::Emit { .. } => Caps {
                stdout: SlotCap::CREATE | SlotCap::ACCEPT,
                ..Caps::default()
            },
            Node::Redirect { mode, .. } => Caps {
                stdin: if mode.writes() {
                    SlotCap::CREATE
                } else {
                    SlotCap::ABSENT
                },
                stdout: if mode.reads() {
                    SlotCap::CREATE
                } else {
                    SlotCap::ABSENT
                },
                stderr: SlotCap::ABSENT,
            },
            Node::And { .. } | Node::Or { .. } | Node::Succeed | Node::Fail => Caps::default(),
        }
    }

    /// Start this node with the given stream wiring.
    ///
    /// The request is validated against [`Node::caps`] first; a validation
    /// failure commits nothing. Errors out of `start` always predate
    /// commitment of this node -- anything later is reported through the
    /// returned instance's `wait`.
    pub fn start(&self, streams: Streams, env: &Env) -> Result<Box<dyn Running>> {
        engine::start_checked(self, streams, env).map_err(|failure| failure.error)
    }

    /// Start stream-less and wait: the usual way to execute a finished
    /// description. Returns the tree's status; 0 is success.
    pub fn run(&self, env: &Env) -> Result<i32> {
        let mut running = self.start(Streams::default(), env)?;
        Ok(running.wait())
    }
}

impl BitOr for Node {
    type Output = Node;

    fn bitor(self, rhs: Node) -> Node {
        self.pipe(rhs)
    }
}

/// Run nodes in order, stopping at the first nonzero status and returning
/// it; 0 when every node succeeded.
pub fn run_script<'a, I>(script: I, env: &Env) -> Result<i32>
where
    I: IntoIterator<Item = &'a Node>,
{
    for node in script {
        let status = node.run(env)?;
        if status != 0 {
            return Ok(status);
        }
    }
    Ok(0)
}
