//! Failed stream negotiation must commit nothing: no descriptor opened, no
//! process forked, no thread spawned.
//!
//! Kept as a single test so the descriptor-table counts cannot race against
//! other tests in the same binary.

use plumb::{Env, Node, OpenMode, Slot, Streams};

fn open_descriptors() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

#[test]
fn failed_negotiation_leaves_descriptor_table_unchanged() {
    let env = Env::new();

    // Capability violation: a stream-less node asked to create stdout.
    let before = open_descriptors();
    let err = Node::succeed()
        .start(
            Streams {
                stdout: Slot::New,
                ..Streams::default()
            },
            &env,
        )
        .err()
        .unwrap();
    assert!(err.is_configuration());
    assert_eq!(open_descriptors(), before);

    // Invalid pairing: neither redirect can take the other's end. The
    // decision falls before either file is opened.
    let before = open_descriptors();
    let err = (Node::open("/tmp/plumb-a", OpenMode::READ)
        | Node::open("/tmp/plumb-b", OpenMode::WRITE))
    .run(&env)
    .err()
    .unwrap();
    assert!(matches!(err, plumb::Error::InvalidPipe));
    assert_eq!(open_descriptors(), before);

    // A read-only environment rejects capture after the emitting side
    // already started; cleanup must release everything it created.
    let read_only = Env::host();
    let before = open_descriptors();
    let err = (Node::emit(["x"]) | Node::capture("x"))
        .run(&read_only)
        .err()
        .unwrap();
    assert!(matches!(err, plumb::Error::ReadOnlyEnvironment));
    assert_eq!(open_descriptors(), before);

    // A composite right side can reject its own wiring before ever
    // adopting the handoff. The emitting side must be unblocked and reaped
    // even with a payload far beyond the pipe buffer, and the handed-off
    // descriptor must be released exactly once.
    let big = "x".repeat(1 << 20);
    let before = open_descriptors();
    let err = (Node::emit([big.as_str()]) | (Node::capture("a") | Node::capture("b")))
        .run(&env)
        .err()
        .unwrap();
    assert!(matches!(err, plumb::Error::InvalidPipe));
    assert_eq!(open_descriptors(), before);

    // Combinators cannot sit inside a pipe; they declare no streams.
    let before = open_descriptors();
    let err = (Node::succeed().and_then(Node::succeed()) | Node::exec(["cat"]))
        .run(&env)
        .err()
        .unwrap();
    assert!(matches!(err, plumb::Error::InvalidPipe));
    assert_eq!(open_descriptors(), before);
}
