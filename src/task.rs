//! Work items and the code they run.
//!
//! A task's code must reach the master process, which was forked from the
//! owner before the task existed. Plain heap data can be serialized across
//! that boundary, but arbitrary boxed closures cannot. So an [`Invocable`] is
//! restricted to code that lives in the executable image (function pointers)
//! plus data that can be serialized (a method receiver or a closure
//! environment). Every process in a pool is a `fork()` of the owner without
//! `exec()`, so a code address taken in the owner is valid in the master and
//! in every worker.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::Result;

/// Signature of a free function task.
pub type TaskFn = fn(&[Value]) -> anyhow::Result<Value>;

/// Signature of a closure body; receives its captured environment first.
pub type ClosureFn = fn(&Value, &[Value]) -> anyhow::Result<Value>;

/// Dispatch trampoline for a bound method.
pub type MethodDispatch = fn(&Value, &str, &[Value]) -> anyhow::Result<Value>;

/// An object whose methods can be forked as tasks.
///
/// The receiver travels to the worker serialized, so the worker calls the
/// method on its own copy; mutations are not seen by the owner.
pub trait Receiver: Serialize + DeserializeOwned {
    /// Call the method named `selector`.
    fn call(&self, selector: &str, args: &[Value]) -> anyhow::Result<Value>;
}

/// Reference to executable work.
#[derive(Clone)]
pub enum Invocable {
    /// A free function.
    Function(TaskFn),
    /// A method bound to a serialized receiver.
    Method {
        receiver: Value,
        selector: String,
        dispatch: MethodDispatch,
    },
    /// A non-capturing closure body with an explicit environment.
    Closure { env: Value, body: ClosureFn },
}

impl Invocable {
    pub fn function(f: TaskFn) -> Self {
        Self::Function(f)
    }

    /// Bind `selector` on a snapshot of `receiver`.
    pub fn method<R: Receiver>(receiver: &R, selector: impl Into<String>) -> Result<Self> {
        Ok(Self::Method {
            receiver: serde_json::to_value(receiver)?,
            selector: selector.into(),
            dispatch: dispatch_method::<R>,
        })
    }

    /// A closure over `env`; `body` gets the environment on every call.
    pub fn closure<E: Serialize>(env: E, body: ClosureFn) -> Result<Self> {
        Ok(Self::Closure {
            env: serde_json::to_value(env)?,
            body,
        })
    }

    pub fn invoke(&self, args: &[Value]) -> anyhow::Result<Value> {
        match self {
            Self::Function(f) => f(args),
            Self::Method {
                receiver,
                selector,
                dispatch,
            } => dispatch(receiver, selector, args),
            Self::Closure { env, body } => body(env, args),
        }
    }

    /// Short label for log lines.
    pub fn describe(&self) -> String {
        match self {
            Self::Function(_) => "function".to_string(),
            Self::Method { selector, .. } => format!("method {}", selector),
            Self::Closure { .. } => "closure".to_string(),
        }
    }
}

impl From<TaskFn> for Invocable {
    fn from(f: TaskFn) -> Self {
        Self::Function(f)
    }
}

impl fmt::Debug for Invocable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(_) => f.write_str("Function"),
            Self::Method {
                receiver, selector, ..
            } => f
                .debug_struct("Method")
                .field("receiver", receiver)
                .field("selector", selector)
                .finish(),
            Self::Closure { env, .. } => f.debug_struct("Closure").field("env", env).finish(),
        }
    }
}

fn dispatch_method<R: Receiver>(
    receiver: &Value,
    selector: &str,
    args: &[Value],
) -> anyhow::Result<Value> {
    let receiver: R = serde_json::from_value(receiver.clone())?;
    receiver.call(selector, args)
}

/// Wire form of an [`Invocable`]; code pointers become addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireInvocable {
    Function {
        addr: usize,
    },
    Method {
        receiver: Value,
        selector: String,
        dispatch: usize,
    },
    Closure {
        env: Value,
        body: usize,
    },
}

impl From<&Invocable> for WireInvocable {
    fn from(invocable: &Invocable) -> Self {
        match invocable {
            Invocable::Function(f) => Self::Function { addr: *f as usize },
            Invocable::Method {
                receiver,
                selector,
                dispatch,
            } => Self::Method {
                receiver: receiver.clone(),
                selector: selector.clone(),
                dispatch: *dispatch as usize,
            },
            Invocable::Closure { env, body } => Self::Closure {
                env: env.clone(),
                body: *body as usize,
            },
        }
    }
}

impl WireInvocable {
    /// Rebuild the invocable.
    ///
    /// # Safety
    /// `self` must have been produced by `From<&Invocable>` in this process or
    /// in a process this one was forked from (without an intervening `exec`).
    pub unsafe fn into_invocable(self) -> Invocable {
        // SAFETY: the addresses were taken from fn pointers of exactly these
        // types in the same executable image.
        unsafe {
            match self {
                Self::Function { addr } => {
                    Invocable::Function(std::mem::transmute::<usize, TaskFn>(addr))
                }
                Self::Method {
                    receiver,
                    selector,
                    dispatch,
                } => Invocable::Method {
                    receiver,
                    selector,
                    dispatch: std::mem::transmute::<usize, MethodDispatch>(dispatch),
                },
                Self::Closure { env, body } => Invocable::Closure {
                    env,
                    body: std::mem::transmute::<usize, ClosureFn>(body),
                },
            }
        }
    }
}

/// Normalized argument list of a task.
///
/// A bare scalar becomes a one-element list, an array is taken as the list
/// itself, and `()` means no arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(pub Vec<Value>);

impl Args {
    pub fn into_vec(self) -> Vec<Value> {
        self.0
    }
}

impl From<()> for Args {
    fn from(_: ()) -> Self {
        Self(Vec::new())
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl From<Value> for Args {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(values) => Self(values),
            scalar => Self(vec![scalar]),
        }
    }
}

impl From<&str> for Args {
    fn from(s: &str) -> Self {
        Self(vec![Value::from(s)])
    }
}

impl From<String> for Args {
    fn from(s: String) -> Self {
        Self(vec![Value::from(s)])
    }
}

impl From<i64> for Args {
    fn from(n: i64) -> Self {
        Self(vec![Value::from(n)])
    }
}

impl From<u64> for Args {
    fn from(n: u64) -> Self {
        Self(vec![Value::from(n)])
    }
}

impl From<f64> for Args {
    fn from(n: f64) -> Self {
        Self(vec![Value::from(n)])
    }
}

impl From<bool> for Args {
    fn from(b: bool) -> Self {
        Self(vec![Value::from(b)])
    }
}

/// One unit of enqueued work.
#[derive(Debug, Clone)]
pub struct Task {
    id: u64,
    invocable: Invocable,
    args: Vec<Value>,
    tag: Option<String>,
}

impl Task {
    pub fn new(id: u64, invocable: Invocable, args: Args, tag: Option<String>) -> Self {
        Self {
            id,
            invocable,
            args: args.into_vec(),
            tag,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn invocable(&self) -> &Invocable {
        &self.invocable
    }

    pub fn run(&self) -> anyhow::Result<Value> {
        self.invocable.invoke(&self.args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn concat(args: &[Value]) -> anyhow::Result<Value> {
        Ok(Value::from(
            args.iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .concat(),
        ))
    }

    #[derive(Serialize, Deserialize)]
    struct Greeter {
        greeting: String,
    }

    impl Receiver for Greeter {
        fn call(&self, selector: &str, args: &[Value]) -> anyhow::Result<Value> {
            match selector {
                "greet" => Ok(json!(format!(
                    "{} {}",
                    self.greeting,
                    args.first().and_then(Value::as_str).unwrap_or("nobody")
                ))),
                other => anyhow::bail!("no method {}", other),
            }
        }
    }

    #[test]
    fn test_args_normalization() {
        assert_eq!(Args::from(()).0, Vec::<Value>::new());
        assert_eq!(Args::from("foo").0, vec![json!("foo")]);
        assert_eq!(Args::from(json!(3)).0, vec![json!(3)]);
        assert_eq!(Args::from(json!(["a", "b"])).0, vec![json!("a"), json!("b")]);
        assert_eq!(Args::from(vec![json!(1), json!(2)]).0.len(), 2);
    }

    #[test]
    fn test_function_invocable() {
        let invocable = Invocable::function(concat);
        let out = invocable.invoke(&[json!("foo"), json!("bar")]).unwrap();
        assert_eq!(out, json!("foobar"));
    }

    #[test]
    fn test_method_invocable() {
        let greeter = Greeter {
            greeting: "hello".into(),
        };
        let invocable = Invocable::method(&greeter, "greet").unwrap();
        assert_eq!(invocable.invoke(&[json!("bob")]).unwrap(), json!("hello bob"));

        let missing = Invocable::method(&greeter, "wave").unwrap();
        assert!(missing.invoke(&[]).is_err());
        assert_eq!(missing.describe(), "method wave");
    }

    #[test]
    fn test_closure_invocable_uses_env() {
        let invocable = Invocable::closure(json!({"factor": 3}), |env, args| {
            let factor = env["factor"].as_i64().unwrap_or(1);
            let n = args.first().and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(factor * n))
        })
        .unwrap();
        assert_eq!(invocable.invoke(&[json!(5)]).unwrap(), json!(15));
    }

    #[test]
    fn test_wire_invocable_rebuilds_same_code() {
        let invocables = [
            Invocable::function(concat),
            Invocable::method(
                &Greeter {
                    greeting: "hi".into(),
                },
                "greet",
            )
            .unwrap(),
            Invocable::closure("x", |env, _| Ok(env.clone())).unwrap(),
        ];
        let args = [json!("a"), json!("b")];

        for invocable in invocables {
            let wire = WireInvocable::from(&invocable);
            let line = serde_json::to_string(&wire).unwrap();
            let decoded: WireInvocable = serde_json::from_str(&line).unwrap();
            assert_eq!(decoded, wire);

            let rebuilt = unsafe { decoded.into_invocable() };
            assert_eq!(
                rebuilt.invoke(&args).unwrap(),
                invocable.invoke(&args).unwrap()
            );
        }
    }

    #[test]
    fn test_task_run() {
        let task = Task::new(7, Invocable::function(concat), "x".into(), Some("t".into()));
        assert_eq!(task.id(), 7);
        assert_eq!(task.tag(), Some("t"));
        assert_eq!(task.args(), &[json!("x")]);
        assert_eq!(task.run().unwrap(), json!("x"));
    }
}
