//! End-to-end behavior of the composition algebra: statuses, short-circuit
//! rules, capture round trips and external commands.

use std::thread;

use plumb::{run_script, Env, Error, Node, Value};

#[test]
fn succeed_is_always_zero() {
    let env = Env::new();
    for _ in 0..3 {
        assert_eq!(Node::succeed().run(&env).unwrap(), 0);
    }
}

#[test]
fn fail_is_always_nonzero() {
    let env = Env::new();
    for _ in 0..3 {
        assert_ne!(Node::fail().run(&env).unwrap(), 0);
    }
}

#[test]
fn boolean_chain_truth_table() {
    let env = Env::new();
    assert_eq!(
        Node::succeed().and_then(Node::succeed()).run(&env).unwrap(),
        0
    );
    assert_ne!(Node::succeed().and_then(Node::fail()).run(&env).unwrap(), 0);
    assert_ne!(Node::fail().and_then(Node::succeed()).run(&env).unwrap(), 0);
    assert_eq!(Node::succeed().or_else(Node::fail()).run(&env).unwrap(), 0);
    assert_eq!(Node::fail().or_else(Node::succeed()).run(&env).unwrap(), 0);
    assert_ne!(Node::fail().or_else(Node::fail()).run(&env).unwrap(), 0);
}

#[test]
fn emit_capture_round_trip() {
    let env = Env::new();
    let status = (Node::emit(["Does"]) | Node::capture("test1"))
        .run(&env)
        .unwrap();
    assert_eq!(status, 0);
    assert_eq!(env.lookup("test1").unwrap(), "Does");
}

#[test]
fn emit_joins_words_with_single_spaces() {
    let env = Env::new();
    env.set("first", "Does", false).unwrap();
    env.set("second", "echo", false).unwrap();
    let pipeline = Node::emit([
        Value::var("first"),
        Value::var("second"),
        Value::literal("work"),
        Value::literal("?"),
    ]) | Node::capture("out");
    assert_eq!(pipeline.run(&env).unwrap(), 0);
    assert_eq!(env.lookup("out").unwrap(), "Does echo work ?");
}

#[test]
fn feed_pipes_a_line_into_stdin() {
    let env = Env::new();
    assert_eq!(Node::capture("fed").feed("payload").run(&env).unwrap(), 0);
    assert_eq!(env.lookup("fed").unwrap(), "payload");
}

#[test]
fn short_circuit_and_skips_right_side() {
    let env = Env::new();
    let chain = Node::fail().and_then(Node::emit(["test"]) | Node::capture("test"));
    assert_ne!(chain.run(&env).unwrap(), 0);
    assert!(matches!(
        env.lookup("test"),
        Err(Error::UndefinedVariable(_))
    ));
}

#[test]
fn short_circuit_or_skips_right_side() {
    let env = Env::new();
    let chain = Node::succeed().or_else(Node::emit(["test"]) | Node::capture("test"));
    assert_eq!(chain.run(&env).unwrap(), 0);
    assert!(matches!(
        env.lookup("test"),
        Err(Error::UndefinedVariable(_))
    ));
}

#[test]
fn or_runs_right_side_after_a_failure() {
    let env = Env::new();
    let chain = Node::fail().or_else(Node::emit(["ran"]) | Node::capture("rescued"));
    assert_eq!(chain.run(&env).unwrap(), 0);
    assert_eq!(env.lookup("rescued").unwrap(), "ran");
}

#[test]
fn external_command_reports_its_exit_code() {
    let env = Env::host();
    assert_eq!(Node::exec(["sh", "-c", "exit 13"]).run(&env).unwrap(), 13);
    assert_eq!(Node::exec(["true"]).run(&env).unwrap(), 0);
}

#[test]
fn chain_status_normalizes_to_one() {
    let env = Env::host();
    let status = Node::exec(["sh", "-c", "exit 7"])
        .and_then(Node::succeed())
        .run(&env)
        .unwrap();
    assert_eq!(status, 1);
}

#[test]
fn pipe_status_is_bitwise_or_of_sides() {
    let env = Env::host();
    let status = (Node::exec(["sh", "-c", "exit 1"]) | Node::exec(["cat"]))
        .run(&env)
        .unwrap();
    assert_eq!(status, 1);
}

#[test]
fn pipe_transfers_bytes_unaltered_across_buffering() {
    let env = Env::host().clone();
    // Far beyond both the pipe buffer and the workers' chunk size.
    let payload = "0123456789abcdef".repeat(8192);
    let pipeline =
        Node::emit([payload.as_str()]) | Node::exec(["cat"]) | Node::capture("moved");
    assert_eq!(pipeline.run(&env).unwrap(), 0);
    assert_eq!(env.lookup("moved").unwrap(), payload);
}

#[test]
fn exec_resolves_argv_against_environment() {
    let env = Env::host().clone();
    env.set("word", "resolved", false).unwrap();
    let pipeline =
        Node::exec([Value::literal("echo"), Value::var("word")]) | Node::capture("out");
    assert_eq!(pipeline.run(&env).unwrap(), 0);
    assert_eq!(env.lookup("out").unwrap(), "resolved");
}

#[test]
fn exec_with_undefined_variable_fails_in_the_child() {
    let env = Env::host();
    let status = Node::exec([Value::literal("echo"), Value::var("missing")])
        .run(&env)
        .unwrap();
    assert_eq!(status, 127);
}

#[test]
fn exec_missing_command_reports_enoent() {
    let env = Env::host();
    let status = Node::exec(["definitely-not-a-command-4242"])
        .run(&env)
        .unwrap();
    assert_eq!(status, libc::ENOENT);
}

#[test]
fn only_exported_entries_reach_the_child() {
    let env = Env::host().clone();
    env.set("PLUMB_PUBLIC", "yes", true).unwrap();
    env.set("PLUMB_PRIVATE", "no", false).unwrap();
    let pipeline = Node::exec([
        "sh",
        "-c",
        "echo ${PLUMB_PRIVATE:-unset} ${PLUMB_PUBLIC:-unset}",
    ]) | Node::capture("seen");
    assert_eq!(pipeline.run(&env).unwrap(), 0);
    assert_eq!(env.lookup("seen").unwrap(), "unset yes");
}

#[test]
fn capture_refuses_read_only_environment() {
    let env = Env::host();
    let err = (Node::emit(["x"]) | Node::capture("x")).run(&env).err().unwrap();
    assert!(matches!(err, Error::ReadOnlyEnvironment));
}

#[test]
fn captured_variables_are_not_exported() {
    let env = Env::new();
    (Node::emit(["secret"]) | Node::capture("hidden"))
        .run(&env)
        .unwrap();
    assert_eq!(env.lookup("hidden").unwrap(), "secret");
    assert!(env
        .exportable_pairs()
        .iter()
        .all(|pair| !pair.starts_with("hidden=")));
}

#[test]
fn templates_restart_independently() {
    let template = Node::emit([Value::var("who")]) | Node::capture("got");
    let env1 = Env::new();
    env1.set("who", "first", false).unwrap();
    let env2 = Env::new();
    env2.set("who", "second", false).unwrap();

    let a = template.clone();
    let b = template.clone();
    thread::scope(|scope| {
        scope.spawn(|| assert_eq!(a.run(&env1).unwrap(), 0));
        scope.spawn(|| assert_eq!(b.run(&env2).unwrap(), 0));
    });
    assert_eq!(env1.lookup("got").unwrap(), "first");
    assert_eq!(env2.lookup("got").unwrap(), "second");

    // The template itself is still startable.
    let env3 = Env::new();
    env3.set("who", "third", false).unwrap();
    assert_eq!(template.run(&env3).unwrap(), 0);
    assert_eq!(env3.lookup("got").unwrap(), "third");
}

#[test]
fn script_stops_at_first_failure() {
    let env = Env::new();
    let script = vec![
        Node::emit(["one"]) | Node::capture("first"),
        Node::fail(),
        Node::emit(["two"]) | Node::capture("second"),
    ];
    let status = run_script(&script, &env).unwrap();
    assert_ne!(status, 0);
    assert_eq!(env.lookup("first").unwrap(), "one");
    assert!(env.lookup("second").is_err());
}

#[test]
fn empty_emit_produces_a_bare_newline() {
    let env = Env::new();
    let pipeline = Node::emit(Vec::<Value>::new()) | Node::capture("blank");
    assert_eq!(pipeline.run(&env).unwrap(), 0);
    assert_eq!(env.lookup("blank").unwrap(), "");
}
