//! End-to-end tests driving the full `registry -> builder -> compile ->
//! run` pipeline, as opposed to the unit tests inside each module that
//! exercise one layer at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;

use braid::adapter::{handler_hybrid, handler_sync};
use braid::node::{ArgSpec, CacheMode, ChildBuild, HandlerKind, NodeDef};
use braid::{BraidError, GraphBuilder, GraphRegistry, OutputValue, ValueRef};

fn value_of(out: &HashMap<String, OutputValue>, key: &str) -> serde_json::Value {
    match out.get(key).unwrap_or_else(|| panic!("missing output {key}")) {
        OutputValue::Value(v) => v.clone(),
        OutputValue::Lazy(_) => panic!("expected a value, got a lazy handle"),
    }
}

#[tokio::test]
async fn basic_pipeline_uppercases_a_literal_name() {
    let mut reg = GraphRegistry::new();
    reg.add(NodeDef::new(
        "name-fromLiteral",
        "root",
        HandlerKind::UserFn(handler_sync(|_| Ok(json!("Jeremy")))),
    ))
    .unwrap();
    reg.add(
        NodeDef::new(
            "str-toUpper",
            "root",
            HandlerKind::UserFn(handler_sync(|args| {
                Ok(json!(args.get("s").and_then(|v| v.as_str()).unwrap_or("").to_uppercase()))
            })),
        )
        .with_args(vec![ArgSpec::new("s")])
        .with_children(vec![ChildBuild::new(ValueRef::parse("name-fromLiteral")).alias("s")]),
    )
    .unwrap();

    let mut builder = GraphBuilder::new(&reg);
    builder.builds(ValueRef::parse("str-toUpper"));
    let out = builder.run(HashMap::new()).await.unwrap();
    assert_eq!(value_of(&out, "str-toUpper"), json!("JEREMY"));
}

#[tokio::test]
async fn three_requests_for_the_same_node_dedup_to_one_call() {
    let mut reg = GraphRegistry::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    reg.add(NodeDef::new(
        "counter",
        "root",
        HandlerKind::UserFn(handler_sync(move |_| Ok(json!(c.fetch_add(1, Ordering::SeqCst) + 1)))),
    ))
    .unwrap();

    let mut builder = GraphBuilder::new(&reg);
    builder.builds(ValueRef::parse("counter")).alias("a");
    builder.builds(ValueRef::parse("counter")).alias("b");
    builder.builds(ValueRef::parse("counter")).alias("c");
    let out = builder.run(HashMap::new()).await.unwrap();

    for alias in ["a", "b", "c"] {
        assert_eq!(value_of(&out, alias), json!(1));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disabled_cache_mode_runs_every_request_separately() {
    let mut reg = GraphRegistry::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    reg.add(
        NodeDef::new(
            "counter",
            "root",
            HandlerKind::UserFn(handler_sync(move |_| Ok(json!(c.fetch_add(1, Ordering::SeqCst) + 1)))),
        )
        .with_cache_mode(CacheMode::Disabled),
    )
    .unwrap();

    let mut builder = GraphBuilder::new(&reg);
    builder.builds(ValueRef::parse("counter")).alias("a");
    builder.builds(ValueRef::parse("counter")).alias("b");
    builder.builds(ValueRef::parse("counter")).alias("c");
    let out = builder.run(HashMap::new()).await.unwrap();

    let mut seen: Vec<i64> = ["a", "b", "c"].iter().map(|k| value_of(&out, k).as_i64().unwrap()).collect();
    seen.sort();
    assert_eq!(seen, vec![1, 2, 3]);
}

/// `b` depends on `a`, `c` on `!b`, `d` on `a`, `b`, `!c`, `e` on all four —
/// every dependency is "important" (discarded value, happens-before only),
/// so the only observable effect is the order each node's handler appends
/// its own letter to a shared log.
#[tokio::test]
async fn important_edges_order_execution_without_feeding_values() {
    let mut reg = GraphRegistry::new();
    let log = Arc::new(Mutex::new(Vec::<char>::new()));

    let append = |letter: char, log: Arc<Mutex<Vec<char>>>| {
        handler_sync(move |_| {
            log.lock().unwrap().push(letter);
            Ok(json!(true))
        })
    };

    reg.add(NodeDef::new("a", "root", HandlerKind::UserFn(append('a', log.clone())))).unwrap();
    reg.add(
        NodeDef::new("b", "root", HandlerKind::UserFn(append('b', log.clone())))
            .with_children(vec![ChildBuild::new(ValueRef::parse("a"))]),
    )
    .unwrap();
    reg.add(
        NodeDef::new("c", "root", HandlerKind::UserFn(append('c', log.clone())))
            .with_children(vec![ChildBuild::new(ValueRef::parse("b"))]),
    )
    .unwrap();
    reg.add(
        NodeDef::new("d", "root", HandlerKind::UserFn(append('d', log.clone())))
            .with_children(vec![
                ChildBuild::new(ValueRef::parse("a")),
                ChildBuild::new(ValueRef::parse("b")),
                ChildBuild::new(ValueRef::parse("c")),
            ]),
    )
    .unwrap();
    reg.add(
        NodeDef::new("e", "root", HandlerKind::UserFn(append('e', log.clone())))
            .with_children(vec![
                ChildBuild::new(ValueRef::parse("a")),
                ChildBuild::new(ValueRef::parse("b")),
                ChildBuild::new(ValueRef::parse("c")),
                ChildBuild::new(ValueRef::parse("d")),
            ]),
    )
    .unwrap();

    let mut builder = GraphBuilder::new(&reg);
    builder.builds(ValueRef::parse("e"));
    builder.run(HashMap::new()).await.unwrap();

    let log: String = log.lock().unwrap().iter().collect();
    assert_eq!(log, "abcde");
}

/// A `str-transform(str, method)` node picks between three guarded
/// transforms (matched against `method`) and falls back to echoing `str`
/// untouched when none match — a guard skip yields `null`, never an error.
#[tokio::test]
async fn unmatched_guard_falls_through_to_the_default_branch() {
    let mut reg = GraphRegistry::new();

    let is_method = |expected: &'static str| {
        NodeDef::new(format!("is-{expected}"), "root", HandlerKind::UserFn(handler_sync(move |args| {
            Ok(json!(args.get("method").and_then(|v| v.as_str()) == Some(expected)))
        })))
        .with_args(vec![ArgSpec::new("method")])
        .with_children(vec![ChildBuild::new(ValueRef::parse("args.method")).alias("method")])
    };
    reg.add(is_method("upper")).unwrap();
    reg.add(is_method("lower")).unwrap();
    reg.add(is_method("quotes")).unwrap();

    let str_node = |name: &str, f: fn(&str) -> String| {
        NodeDef::new(name.to_string(), "root", HandlerKind::UserFn(handler_sync(move |args| {
            Ok(json!(f(args.get("s").and_then(|v| v.as_str()).unwrap_or(""))))
        })))
        .with_args(vec![ArgSpec::new("s")])
        .with_children(vec![ChildBuild::new(ValueRef::parse("args.s")).alias("s")])
    };
    reg.add(str_node("str-toUpper", |s| s.to_uppercase())).unwrap();
    reg.add(str_node("str-toLower", |s| s.to_lowercase())).unwrap();
    reg.add(str_node("str-quotes", |s| format!("\"{s}\""))).unwrap();

    reg.add(
        NodeDef::new(
            "str-transform",
            "root",
            HandlerKind::UserFn(handler_sync(|args| {
                for key in ["upperOut", "lowerOut", "quotesOut"] {
                    if let Some(v) = args.get(key) {
                        if !v.is_null() {
                            return Ok(v.clone());
                        }
                    }
                }
                Ok(args.get("str").cloned().unwrap_or(serde_json::Value::Null))
            })),
        )
        .with_args(vec![
            ArgSpec::new("str"),
            ArgSpec::new("method"),
            ArgSpec::new("upperOut"),
            ArgSpec::new("lowerOut"),
            ArgSpec::new("quotesOut"),
        ])
        .with_children(vec![
            ChildBuild::new(ValueRef::parse("args.str")).alias("str"),
            ChildBuild::new(ValueRef::parse("args.method")).alias("method"),
            ChildBuild::new(ValueRef::parse("str-toUpper"))
                .using("s", ValueRef::parse("args.str"))
                .when(ValueRef::parse("is-upper"))
                .alias("upperOut"),
            ChildBuild::new(ValueRef::parse("str-toLower"))
                .using("s", ValueRef::parse("args.str"))
                .when(ValueRef::parse("is-lower"))
                .alias("lowerOut"),
            ChildBuild::new(ValueRef::parse("str-quotes"))
                .using("s", ValueRef::parse("args.str"))
                .when(ValueRef::parse("is-quotes"))
                .alias("quotesOut"),
        ]),
    )
    .unwrap();

    let mut builder = GraphBuilder::new(&reg);
    builder
        .builds(ValueRef::parse("str-transform"))
        .using("str", ValueRef::literal(json!("Jon")))
        .using("method", ValueRef::literal(json!("unspecified")));
    let out = builder.run(HashMap::new()).await.unwrap();
    assert_eq!(value_of(&out, "str-transform"), json!("Jon"));
}

/// `three = one + two`; `lazyThree` wraps `three` lazily. Requesting
/// `lazyThree` must not run any of the three handlers until the returned
/// thunk is explicitly invoked, and invoking it twice must not re-run them.
#[tokio::test]
async fn lazy_output_defers_its_whole_dependency_chain() {
    let mut reg = GraphRegistry::new();
    let order = Arc::new(Mutex::new(Vec::<String>::new()));

    let o1 = order.clone();
    reg.add(NodeDef::new(
        "one",
        "root",
        HandlerKind::UserFn(handler_sync(move |_| {
            o1.lock().unwrap().push("1".into());
            Ok(json!(1))
        })),
    ))
    .unwrap();

    let o2 = order.clone();
    reg.add(NodeDef::new(
        "two",
        "root",
        HandlerKind::UserFn(handler_sync(move |_| {
            o2.lock().unwrap().push("2".into());
            Ok(json!(2))
        })),
    ))
    .unwrap();

    let o3 = order.clone();
    reg.add(
        NodeDef::new(
            "three",
            "root",
            HandlerKind::UserFn(handler_sync(move |args| {
                o3.lock().unwrap().push("add(1,2)".into());
                let a = args.get("a").and_then(|v| v.as_i64()).unwrap_or(0);
                let b = args.get("b").and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(json!(a + b))
            })),
        )
        .with_args(vec![ArgSpec::new("a"), ArgSpec::new("b")])
        .with_children(vec![
            ChildBuild::new(ValueRef::parse("one")).alias("a"),
            ChildBuild::new(ValueRef::parse("two")).alias("b"),
        ]),
    )
    .unwrap();

    reg.add(NodeDef::new(
        "lazyThree",
        "root",
        HandlerKind::Lazy { target: ValueRef::parse("three") },
    ))
    .unwrap();

    let mut builder = GraphBuilder::new(&reg);
    builder.builds(ValueRef::parse("lazyThree"));
    let out = builder.run(HashMap::new()).await.unwrap();

    assert!(order.lock().unwrap().is_empty(), "no handler should have run yet");

    let thunk = match out.get("lazyThree").unwrap() {
        OutputValue::Lazy(t) => t.clone(),
        OutputValue::Value(_) => panic!("expected a lazy handle"),
    };
    let v1 = thunk.invoke(HashMap::new()).await.unwrap();
    let v2 = thunk.invoke(HashMap::new()).await.unwrap();
    assert_eq!(v1, json!(3));
    assert_eq!(v2, json!(3));
    assert_eq!(*order.lock().unwrap(), vec!["1".to_string(), "2".to_string(), "add(1,2)".to_string()]);
}

#[tokio::test]
async fn running_the_same_compiled_plan_twice_yields_equal_output_maps() {
    let mut reg = GraphRegistry::new();
    reg.add(NodeDef::new("answer", "root", HandlerKind::UserFn(handler_sync(|_| Ok(json!(42))))))
        .unwrap();

    let mut builder = GraphBuilder::new(&reg);
    builder.builds(ValueRef::parse("answer"));
    let plan = builder.compile().unwrap();

    let first = braid::run(plan.clone(), HashMap::new(), Arc::new(braid::SingletonStore::new()), Arc::new(braid::TracingSink))
        .await
        .unwrap();
    let second = braid::run(plan, HashMap::new(), Arc::new(braid::SingletonStore::new()), Arc::new(braid::TracingSink))
        .await
        .unwrap();

    assert_eq!(value_of(&first, "answer"), value_of(&second, "answer"));
}

/// Compiling the same requested outputs against a registry and against a
/// clone of it must produce structurally identical plans: same fingerprints,
/// same call count, since fingerprint assignment follows the deterministic
/// reference-tree walk rather than the registry's internal `HashMap` order.
#[tokio::test]
async fn compiling_a_cloned_registry_reproduces_the_same_plan() {
    let mut reg = GraphRegistry::new();
    reg.add(NodeDef::new("name", "root", HandlerKind::UserFn(handler_sync(|_| Ok(json!("Jon"))))))
        .unwrap();
    reg.add(
        NodeDef::new(
            "str-toUpper",
            "root",
            HandlerKind::UserFn(handler_sync(|args| {
                Ok(json!(args.get("s").and_then(|v| v.as_str()).unwrap_or("").to_uppercase()))
            })),
        )
        .with_args(vec![ArgSpec::new("s")])
        .with_children(vec![ChildBuild::new(ValueRef::parse("name")).alias("s")]),
    )
    .unwrap();

    let cloned = reg.clone();

    let mut builder_a = GraphBuilder::new(&reg);
    builder_a.builds(ValueRef::parse("str-toUpper"));
    let plan_a = builder_a.compile().unwrap();

    let mut builder_b = GraphBuilder::new(&cloned);
    builder_b.builds(ValueRef::parse("str-toUpper"));
    let plan_b = builder_b.compile().unwrap();

    assert_eq!(plan_a.calls.len(), plan_b.calls.len());
    assert_eq!(plan_a.outputs, plan_b.outputs);
    for (fp, call_a) in &plan_a.calls {
        let call_b = plan_b.calls.get(fp).expect("same fingerprint present in both plans");
        assert_eq!(call_a.node_name, call_b.node_name);
        assert_eq!(call_a.inputs.len(), call_b.inputs.len());
    }
}

#[tokio::test]
async fn override_form_replaces_a_node_without_disturbing_downstream_fingerprints() {
    let mut reg = GraphRegistry::new();
    reg.add(NodeDef::new("name", "root", HandlerKind::UserFn(handler_sync(|_| Ok(json!("Jon"))))))
        .unwrap();
    reg.add(
        NodeDef::new(
            "str-toUpper",
            "root",
            HandlerKind::UserFn(handler_sync(|args| {
                Ok(json!(args.get("s").and_then(|v| v.as_str()).unwrap_or("").to_uppercase()))
            })),
        )
        .with_args(vec![ArgSpec::new("s")])
        .with_children(vec![ChildBuild::new(ValueRef::parse("name")).alias("s")]),
    )
    .unwrap();

    let mut builder = GraphBuilder::new(&reg);
    builder.builds(ValueRef::parse("str-toUpper"));
    let out = builder.run(HashMap::new()).await.unwrap();
    assert_eq!(value_of(&out, "str-toUpper"), json!("JON"));

    reg.add(NodeDef::new("+name", "root", HandlerKind::UserFn(handler_sync(|_| Ok(json!("Alex"))))))
        .unwrap();

    let mut builder2 = GraphBuilder::new(&reg);
    builder2.builds(ValueRef::parse("str-toUpper"));
    let out2 = builder2.run(HashMap::new()).await.unwrap();
    assert_eq!(value_of(&out2, "str-toUpper"), json!("ALEX"));
}

#[tokio::test]
async fn missing_compile_input_is_rejected_before_any_handler_runs() {
    let mut reg = GraphRegistry::new();
    reg.add(
        NodeDef::new(
            "echo",
            "root",
            HandlerKind::UserFn(handler_sync(|args| Ok(args.get("v").cloned().unwrap_or(serde_json::Value::Null)))),
        )
        .with_args(vec![ArgSpec::new("v")])
        .with_children(vec![ChildBuild::new(ValueRef::parse("args.v")).alias("v")]),
    )
    .unwrap();

    let mut builder = GraphBuilder::new(&reg);
    // Opting into the strict check via a non-empty compile-inputs set that
    // doesn't include "v" is what triggers the rejection; an empty set means
    // no compile-time check at all and "v" is resolved against the runtime
    // bundle instead.
    builder.set_compile_inputs(["other"]);
    builder.builds(ValueRef::parse("echo"));
    let err = builder.compile().unwrap_err();
    assert!(matches!(err, BraidError::MissingCompileInput(names) if names == vec!["v".to_string()]));
}

/// `disable_callbacks()` is a graph-wide toggle, not something each handler
/// has to opt into individually: a hybrid handler built with its own
/// `callbacks_disabled` left `false` still resolves an "undefined" return as
/// `null` instead of hanging, once the owning registry disables callbacks.
#[tokio::test]
async fn registry_wide_disable_callbacks_reaches_a_locally_enabled_hybrid_handler() {
    let mut reg = GraphRegistry::new();
    reg.disable_callbacks();
    reg.add(NodeDef::new(
        "pending",
        "root",
        HandlerKind::UserFn(handler_hybrid(|_args, _done| None, false)),
    ))
    .unwrap();

    let mut builder = GraphBuilder::new(&reg);
    builder.builds(ValueRef::parse("pending"));
    let out = builder.run(HashMap::new()).await.unwrap();
    assert_eq!(value_of(&out, "pending"), serde_json::Value::Null);
}

/// With no compile inputs declared at all, an `args.*` read at the outermost
/// scope is left to resolve against the runtime bundle at `run()` time
/// instead of being rejected at compile time.
#[tokio::test]
async fn args_read_with_no_declared_compile_inputs_resolves_at_run_time() {
    let mut reg = GraphRegistry::new();
    reg.add(
        NodeDef::new(
            "echo",
            "root",
            HandlerKind::UserFn(handler_sync(|args| Ok(args.get("v").cloned().unwrap_or(serde_json::Value::Null)))),
        )
        .with_args(vec![ArgSpec::new("v")])
        .with_children(vec![ChildBuild::new(ValueRef::parse("args.v")).alias("v")]),
    )
    .unwrap();

    let mut builder = GraphBuilder::new(&reg);
    builder.builds(ValueRef::parse("echo"));
    let mut inputs = HashMap::new();
    inputs.insert("v".to_string(), json!("supplied"));
    let out = builder.run(inputs).await.unwrap();
    assert_eq!(value_of(&out, "echo"), json!("supplied"));
}
