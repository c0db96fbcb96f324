//! Integration test runner
//!
//! Runs each integration test target in turn through cargo and prints a
//! pass/fail table. Arguments restrict the run to the named targets.
//!
//! ```text
//! cargo run -p integration-tests
//! cargo run -p integration-tests -- pipe_tests fault_tests
//! RUST_LOG=ndr_interp=trace cargo run -p integration-tests -- pointer_tests
//! ```

use std::env;
use std::process::{Command, ExitCode};
use std::time::{Duration, Instant};

/// Test targets declared in Cargo.toml with what each covers
const TARGETS: &[(&str, &str)] = &[
    ("complex_types_tests", "structs, arrays, strings, unions, transmit_as, context handles"),
    ("pointer_tests", "referent ids, aliasing, cycles, deleted nodes, rollback"),
    ("pipe_tests", "chunked pipe streaming and pipe misuse"),
    ("fault_tests", "malformed type vectors and wire data, usage errors"),
    ("stress_tests", "concurrent state blocks over a shared interface, large data"),
];

struct Outcome {
    target: &'static str,
    passed: bool,
    elapsed: Duration,
    detail: String,
}

fn run_target(target: &'static str) -> Outcome {
    let start = Instant::now();
    let result = Command::new(env::var("CARGO").unwrap_or_else(|_| "cargo".into()))
        .args(["test", "-p", "integration-tests", "--test", target, "--", "--nocapture"])
        .status();
    let elapsed = start.elapsed();
    match result {
        Ok(status) if status.success() => Outcome {
            target,
            passed: true,
            elapsed,
            detail: String::new(),
        },
        Ok(status) => Outcome {
            target,
            passed: false,
            elapsed,
            detail: format!("exit code {:?}", status.code()),
        },
        Err(e) => Outcome {
            target,
            passed: false,
            elapsed,
            detail: format!("could not run cargo: {}", e),
        },
    }
}

fn main() -> ExitCode {
    let wanted: Vec<String> = env::args().skip(1).collect();
    let selected: Vec<_> = TARGETS
        .iter()
        .filter(|(name, _)| wanted.is_empty() || wanted.iter().any(|w| w == name))
        .collect();
    if selected.is_empty() {
        eprintln!("no such test target; known targets:");
        for (name, about) in TARGETS {
            eprintln!("  {:<22} {}", name, about);
        }
        return ExitCode::FAILURE;
    }

    let mut outcomes = Vec::with_capacity(selected.len());
    for (name, about) in selected {
        println!("\n>>> {} ({})", name, about);
        outcomes.push(run_target(name));
    }

    let failed = outcomes.iter().filter(|o| !o.passed).count();
    println!("\n{:<22} {:<6} {:>12}  details", "target", "result", "time");
    for o in &outcomes {
        let result = if o.passed { "ok" } else { "FAILED" };
        println!("{:<22} {:<6} {:>12.2?}  {}", o.target, result, o.elapsed, o.detail);
    }
    println!("\n{} of {} targets passed", outcomes.len() - failed, outcomes.len());

    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
