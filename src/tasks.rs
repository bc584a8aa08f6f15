//! Built-in demo tasks used by the `procpool` binary and the test suite.
//!
//! | Task    | Arguments                         | Result                          |
//! |---------|-----------------------------------|---------------------------------|
//! | `echo`  | any                               | the arguments                   |
//! | `sleep` | `{"ms": u64, "honor_cancel": bool}` | `{"slept_ms": u64, "cancelled": bool}` |
//! | `fail`  | `{"message": str}` (optional)     | task error                      |
//! | `exit`  | `{"code": i32}` (optional)        | worker exits without answering  |

use crate::worker::{JobContext, TaskRegistry};
use anyhow::bail;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::{Duration, Instant};

/// How often `sleep` checks for cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Deserialize)]
struct SleepArgs {
    ms: u64,
    #[serde(default)]
    honor_cancel: bool,
}

#[derive(Debug, Default, Deserialize)]
struct FailArgs {
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ExitArgs {
    #[serde(default)]
    code: i32,
}

/// Registry with every built-in task.
pub fn builtin_registry() -> TaskRegistry {
    TaskRegistry::new()
        .with("echo", |_ctx, args| Ok(args))
        .with("sleep", sleep)
        .with("fail", fail)
        .with("exit", exit)
}

fn sleep(ctx: &JobContext, args: Value) -> anyhow::Result<Value> {
    let args: SleepArgs = serde_json::from_value(args)?;
    let total = Duration::from_millis(args.ms);
    let start = Instant::now();

    while start.elapsed() < total {
        if args.honor_cancel && ctx.is_cancelled() {
            return Ok(json!({
                "slept_ms": start.elapsed().as_millis() as u64,
                "cancelled": true,
            }));
        }
        let left = total.saturating_sub(start.elapsed());
        std::thread::sleep(left.min(CANCEL_POLL_INTERVAL));
    }

    Ok(json!({ "slept_ms": args.ms, "cancelled": false }))
}

fn fail(_ctx: &JobContext, args: Value) -> anyhow::Result<Value> {
    let args: FailArgs = serde_json::from_value(args).unwrap_or_default();
    bail!(args.message.unwrap_or_else(|| "task failed".to_string()))
}

fn exit(_ctx: &JobContext, args: Value) -> anyhow::Result<Value> {
    let args: ExitArgs = serde_json::from_value(args).unwrap_or_default();
    // Safety: leaves the worker process immediately, which is the point of
    // this task; nothing in the worker needs unwinding.
    unsafe { nix::libc::_exit(args.code) }
}
