//! parx - run shell commands in parallel

mod cli;

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};

use cli::Cli;
use parx::logging::{self, LogConfig};
use parx::{
    Feed, IndicatifProgress, ItemSource, JobOutput, Mode, Options, Outcome, ShellTask,
    TaskRegistry, WORKER_FDS_ENV, WorkerConfig, run_task, serve_if_worker,
};

/// Exit code of a run stopped by `--kill-on-exit`.
const EXIT_KILLED: i32 = 2;

fn tasks() -> TaskRegistry {
    TaskRegistry::new().register::<ShellTask>()
}

fn main() {
    // Started as a process worker: serve jobs, never parse the CLI.
    if std::env::var_os(WORKER_FDS_ENV).is_some() {
        logging::init(LogConfig::new().with_env_overrides());
        serve_if_worker(&tasks());
    }

    let cli = Cli::parse();
    if cli.no_color {
        owo_colors::set_override(false);
    }

    let log = LogConfig::for_verbosity(cli.verbose, cli.quiet).with_env_overrides();
    let directive = log.directive();
    logging::init(log);

    match run(&cli, &directive) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!(
                "{}: {}",
                "error"
                    .if_supports_color(Stderr, |text| text.red())
                    .if_supports_color(Stderr, |text| text.bold()),
                e
            );
            for cause in e.chain().skip(1) {
                eprintln!(
                    "  {}: {}",
                    "caused by".if_supports_color(Stderr, |text| text.yellow()),
                    cause
                );
            }
            std::process::exit(1);
        }
    }
}

/// Run every job; returns the process exit code.
fn run(cli: &Cli, log_directive: &str) -> Result<i32> {
    let task = ShellTask::new(cli.template.as_slice(), cli.shell.clone())
        .with_capture(cli.captures())
        .with_halt_on_exit(cli.halt_on_exit)
        .with_kill_on_exit(cli.kill_on_exit);
    let mode = if cli.processes {
        Mode::Processes
    } else {
        Mode::Threads
    };
    tracing::debug!(jobs = cli.jobs, %mode, "Starting run");

    let mut options: Options<'_, String, JobOutput> = Options::new()
        .with_preserve_results(cli.json)
        .with_isolation(cli.isolation)
        .with_worker(WorkerConfig::new().with_env("PARX_LOG", log_directive));
    if cli.keep_order {
        options = options
            .with_finish_in_order(true)
            .with_finish(|_item, _index, job: &JobOutput| {
                let mut out = std::io::stdout().lock();
                out.write_all(job.stdout.as_bytes())?;
                out.flush()?;
                Ok(())
            });
    }
    if cli.progress {
        options = options.with_progress(IndicatifProgress::new().with_message(task_label(cli)));
    }

    let source = if cli.args.is_empty() {
        stdin_source(cli.jobs)?
    } else {
        ItemSource::bounded(cli.args.clone())
    };

    let outcome = run_task(source, cli.jobs, mode, task, options)?;
    match outcome {
        Outcome::Completed(results) => {
            if cli.json {
                let json = serde_json::to_string_pretty(&results)
                    .context("Failed to encode results as JSON")?;
                println!("{}", json);
            }
            Ok(0)
        }
        Outcome::Broken(job) => {
            if !cli.quiet {
                let note = match job {
                    Some(job) => format!(
                        "stopped after job {} ({}) exited with {}",
                        job.index,
                        job.item,
                        job.status.unwrap_or_default()
                    ),
                    None => "stopped early".to_string(),
                };
                eprintln!(
                    "{}: {}",
                    "parx".if_supports_color(Stderr, |text| text.yellow()),
                    note
                );
            }
            Ok(0)
        }
        Outcome::Killed => {
            if !cli.quiet {
                eprintln!(
                    "{}: killed running jobs",
                    "parx".if_supports_color(Stderr, |text| text.red())
                );
            }
            Ok(EXIT_KILLED)
        }
    }
}

fn task_label(cli: &Cli) -> String {
    cli.template.join(" ")
}

/// Items from the lines of stdin, read by a background thread.
fn stdin_source(jobs: usize) -> Result<ItemSource<'static, String>> {
    let (sender, receiver) = crossbeam_channel::bounded(jobs.max(1) * 2);
    std::thread::Builder::new()
        .name("parx-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read stdin");
                        break;
                    }
                };
                if sender.send(Feed::Item(line)).is_err() {
                    // The run is over.
                    return;
                }
            }
            let _ = sender.send(Feed::Stop);
        })
        .context("Failed to start stdin reader")?;
    Ok(ItemSource::streaming(receiver))
}
