//! `zr bench`: repeatedly run a task's command directly (bypassing the
//! result cache, which would otherwise make every iteration after the
//! first a no-op) and report aggregated timings.

use std::time::Duration;

use serde::Serialize;

use crate::cli::{BenchFormat, BenchOpts, Cli};
use crate::error::ZrError;
use crate::process::ProcessController;

use super::support;

#[derive(Debug, Serialize)]
struct BenchReport {
    task: String,
    iterations: u32,
    warmup: u32,
    durations_ms: Vec<f64>,
    min_ms: f64,
    max_ms: f64,
    mean_ms: f64,
}

fn to_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[allow(clippy::cast_precision_loss)]
fn mean(durations: &[f64]) -> f64 {
    if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<f64>() / durations.len() as f64
    }
}

fn run_once(controller: &ProcessController, name: &str, cmd: &str, cwd: Option<&std::path::Path>, env: &[(String, String)]) -> Result<Duration, ZrError> {
    let (_handle, rx) = controller.spawn(name, cmd, cwd, env)?;
    let output = rx.recv().map_err(|_| ZrError::Internal(format!("'{name}' produced no result")))?;
    if !output.success() {
        return Err(ZrError::NonZeroExit {
            task: name.to_string(),
            code: match output.reason {
                crate::process::ExitReason::Exited(c) => c,
                _ => 1,
            },
        });
    }
    Ok(output.duration)
}

/// Entry point for `zr bench`: repeatedly runs a task and aggregates timings.
#[allow(clippy::print_stdout)]
pub fn run(cli: &Cli, opts: &BenchOpts) -> Result<i32, ZrError> {
    let table = support::load_catalog(&support::catalog_path(cli.file.as_deref()))?;
    let task = table.get(&opts.task).ok_or_else(|| ZrError::UnknownTask(opts.task.clone()))?;
    let env: Vec<(String, String)> = task.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    let controller = ProcessController::new();

    for _ in 0..opts.warmup {
        run_once(&controller, &opts.task, &task.cmd, task.cwd.as_deref(), &env)?;
    }

    let mut durations = Vec::with_capacity(usize::try_from(opts.iterations).unwrap_or(0));
    for _ in 0..opts.iterations {
        let d = run_once(&controller, &opts.task, &task.cmd, task.cwd.as_deref(), &env)?;
        durations.push(to_ms(d));
    }

    let min_ms = durations.iter().copied().fold(f64::INFINITY, f64::min);
    let max_ms = durations.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean_ms = mean(&durations);

    match opts.format {
        BenchFormat::Text => {
            println!("task:       {}", opts.task);
            println!("iterations: {}", opts.iterations);
            println!("min:        {min_ms:.2}ms");
            println!("max:        {max_ms:.2}ms");
            println!("mean:       {mean_ms:.2}ms");
        }
        BenchFormat::Json => {
            let report = BenchReport {
                task: opts.task.clone(),
                iterations: opts.iterations,
                warmup: opts.warmup,
                durations_ms: durations.clone(),
                min_ms,
                max_ms,
                mean_ms,
            };
            let json = serde_json::to_string_pretty(&report)
                .map_err(|e| ZrError::Internal(format!("serializing bench report: {e}")))?;
            println!("{json}");
        }
        BenchFormat::Csv => {
            println!("iteration,duration_ms");
            for (i, d) in durations.iter().enumerate() {
                println!("{},{d:.3}", i + 1);
            }
        }
    }
    Ok(0)
}
