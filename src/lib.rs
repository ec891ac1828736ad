//! # Plumb
//!
//! Composable subprocess pipelines without a shell. A pipeline is an
//! ordinary value: describe pipe chains, boolean chains, output capture and
//! file redirection as a [`Node`] tree, then execute the description
//! against an [`Env`]. No shell grammar, no globbing -- the composition
//! stays typed and inspectable.
//!
//! ```
//! use plumb::{Env, Node};
//!
//! let env = Env::new();
//! let pipeline = Node::emit(["hello", "world"]) | Node::capture("greeting");
//! assert_eq!(pipeline.run(&env)?, 0);
//! assert_eq!(env.lookup("greeting")?, "hello world");
//! # Ok::<(), plumb::Error>(())
//! ```
//!
//! ## Modules
//!
//! - `node` - the composition algebra and combinator sugar
//! - `env` - variable store with exportable/non-exportable entries
//! - `value` - literal and variable-reference text values
//! - `stream` - descriptor requests, capabilities and their negotiation
//! - `running` - live handles returned by `start`
//! - `error` - what can fail before a node is committed

#[cfg(not(unix))]
compile_error!("plumb drives fork/pipe/exec directly and requires a Unix platform");

mod engine;
pub mod env;
pub mod error;
pub mod node;
pub mod running;
pub mod stream;
pub mod value;

pub use env::Env;
pub use error::{Error, Result};
pub use node::{run_script, Node, OpenMode};
pub use running::{Running, WAIT_FAILED};
pub use stream::{dev, Caps, Slot, SlotCap, Streams};
pub use value::Value;
