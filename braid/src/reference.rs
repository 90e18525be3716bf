//! Value references: the syntactic form identifying where a value comes from.
//!
//! A reference is one of:
//! - a node name plus zero or more dotted sub-field segments, optionally
//!   marked `!` (important) or `?` (void);
//! - an `args.*`/`args.K`/`args.K.path` reference into the caller's override
//!   map (or, at the outermost builder scope, the runtime input bundle);
//! - a captured literal value;
//! - an anonymous inline function with its own declared dependencies;
//! - a structural composition of other references (object or array shape).
//!
//! Dotted paths are pre-parsed into segment lists here, at registration
//! time, rather than walked as strings at run time.

use std::sync::Arc;

use serde_json::Value;

use crate::adapter::Handler;

/// What an `args.*`-rooted reference resolves against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgsKey {
    /// `args.K` — a single named caller input.
    Named(String),
    /// `args.*` — fan out to all of the caller's inputs.
    Wildcard,
}

/// A value reference, pre-parsed from its source form.
#[derive(Clone)]
pub enum ValueRef {
    /// A named producer, plus a pre-parsed dotted path into its value.
    Node {
        name: String,
        path: Vec<String>,
        important: bool,
        void: bool,
    },
    /// `args.K[.path...]` or `args.*`.
    Args {
        key: ArgsKey,
        path: Vec<String>,
        important: bool,
        void: bool,
    },
    /// A captured constant, including JSON `null` for "undefined".
    Literal(Value),
    /// An anonymous producer: a handler plus its own dependency references.
    InlineFn {
        handler: Arc<dyn Handler>,
        deps: Vec<(String, ValueRef)>,
    },
    /// `{k: ref, ...}` — constructs an object at call time.
    ObjectOfRefs(Vec<(String, ValueRef)>),
    /// `[ref, ...]` — constructs an array at call time.
    ArrayOfRefs(Vec<ValueRef>),
}

impl std::fmt::Debug for ValueRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueRef::Node {
                name,
                path,
                important,
                void,
            } => f
                .debug_struct("Node")
                .field("name", name)
                .field("path", path)
                .field("important", important)
                .field("void", void)
                .finish(),
            ValueRef::Args {
                key,
                path,
                important,
                void,
            } => f
                .debug_struct("Args")
                .field("key", key)
                .field("path", path)
                .field("important", important)
                .field("void", void)
                .finish(),
            ValueRef::Literal(v) => f.debug_tuple("Literal").field(v).finish(),
            ValueRef::InlineFn { deps, .. } => {
                f.debug_struct("InlineFn").field("deps", &deps.iter().map(|(k, _)| k).collect::<Vec<_>>()).finish()
            }
            ValueRef::ObjectOfRefs(fields) => {
                f.debug_struct("ObjectOfRefs").field("fields", &fields.iter().map(|(k, _)| k).collect::<Vec<_>>()).finish()
            }
            ValueRef::ArrayOfRefs(items) => f.debug_tuple("ArrayOfRefs").field(&items.len()).finish(),
        }
    }
}

impl ValueRef {
    /// Parse a reference of the `[!|?]name[.path.segments]` or
    /// `[!|?]args.(K|*)[.path.segments]` form, the public surface for
    /// `builds`/`using`/child-build references.
    pub fn parse(spec: &str) -> Self {
        let (important, void, rest) = strip_prefix(spec);
        if let Some(tail) = rest.strip_prefix("args") {
            let tail = tail.strip_prefix('.').unwrap_or(tail);
            let mut segments = tail.split('.').filter(|s| !s.is_empty());
            let head = segments.next().unwrap_or("");
            let path: Vec<String> = segments.map(|s| s.to_string()).collect();
            let key = if head == "*" {
                ArgsKey::Wildcard
            } else {
                ArgsKey::Named(head.to_string())
            };
            return ValueRef::Args {
                key,
                path,
                important,
                void,
            };
        }
        let mut segments = rest.split('.').filter(|s| !s.is_empty());
        let name = segments.next().unwrap_or(rest).to_string();
        let path: Vec<String> = segments.map(|s| s.to_string()).collect();
        ValueRef::Node {
            name,
            path,
            important,
            void,
        }
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        ValueRef::Literal(value.into())
    }

    pub fn object(fields: Vec<(&str, ValueRef)>) -> Self {
        ValueRef::ObjectOfRefs(fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    pub fn array(items: Vec<ValueRef>) -> Self {
        ValueRef::ArrayOfRefs(items)
    }

    pub fn is_important(&self) -> bool {
        matches!(
            self,
            ValueRef::Node { important: true, .. } | ValueRef::Args { important: true, .. }
        )
    }

    pub fn is_void(&self) -> bool {
        matches!(self, ValueRef::Node { void: true, .. } | ValueRef::Args { void: true, .. })
    }

    /// The node name this reference points at, if it's a plain node reference.
    pub fn node_name(&self) -> Option<&str> {
        match self {
            ValueRef::Node { name, .. } => Some(name),
            _ => None,
        }
    }
}

fn strip_prefix(spec: &str) -> (bool, bool, &str) {
    if let Some(rest) = spec.strip_prefix('!') {
        (true, false, rest)
    } else if let Some(rest) = spec.strip_prefix('?') {
        (false, true, rest)
    } else {
        (false, false, spec)
    }
}

/// Evaluate a dotted path against a resolved value, short-circuiting to
/// `null` on `null`/absent rather than erroring.
pub fn project_path<'a>(mut value: &'a Value, path: &[String]) -> Value {
    for segment in path {
        match value {
            Value::Object(map) => match map.get(segment) {
                Some(next) => value = next,
                None => return Value::Null,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(next) => value = next,
                None => return Value::Null,
            },
            _ => return Value::Null,
        }
    }
    value.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_plain_name() {
        let r = ValueRef::parse("str-toUpper");
        assert_eq!(r.node_name(), Some("str-toUpper"));
        assert!(!r.is_important());
        assert!(!r.is_void());
    }

    #[test]
    fn parses_important_and_void_prefixes() {
        assert!(ValueRef::parse("!b").is_important());
        assert!(ValueRef::parse("?c").is_void());
    }

    #[test]
    fn parses_dotted_path() {
        match ValueRef::parse("a.b.c") {
            ValueRef::Node { name, path, .. } => {
                assert_eq!(name, "a");
                assert_eq!(path, vec!["b".to_string(), "c".to_string()]);
            }
            other => panic!("expected Node, got {other:?}"),
        }
    }

    #[test]
    fn parses_args_wildcard_and_named() {
        match ValueRef::parse("args.*") {
            ValueRef::Args { key, path, .. } => {
                assert_eq!(key, ArgsKey::Wildcard);
                assert!(path.is_empty());
            }
            other => panic!("expected Args, got {other:?}"),
        }
        match ValueRef::parse("args.foo.bar") {
            ValueRef::Args { key, path, .. } => {
                assert_eq!(key, ArgsKey::Named("foo".into()));
                assert_eq!(path, vec!["bar".to_string()]);
            }
            other => panic!("expected Args, got {other:?}"),
        }
    }

    #[test]
    fn dotted_path_short_circuits_on_null() {
        let v = json!({"a": null});
        let projected = project_path(&v["a"], &["b".to_string(), "c".to_string()]);
        assert_eq!(projected, Value::Null);
    }

    #[test]
    fn dotted_path_reads_nested_object() {
        let v = json!({"b": {"c": 42}});
        let projected = project_path(&v, &["b".to_string(), "c".to_string()]);
        assert_eq!(projected, json!(42));
    }
}
