// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Interactive supervisor terminal.
//
// Usage: procx [--config procx.toml] [--namespace NAME] [--log FILTER]
//
// Run several copies in separate terminals; they share one process table.
// Ctrl-C three times (configurable) shuts a terminal down in order.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;

use procx::{
    logging, shutdown, Config, EventHook, Instance, Lifecycle, Notification, NotificationKind,
    ProcessHandle, ProcessMode, ProcessRecord, Registry, ShutdownReport, ShutdownSequence, Stage,
};

const WATCH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "procx", version, about = "Multi-instance process supervisor")]
struct Args {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Shared resource namespace; terminals with the same namespace cooperate.
    #[arg(long)]
    namespace: Option<String>,

    /// tracing filter, e.g. `debug` or `procx=trace`.
    #[arg(long)]
    log: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("procx: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config = config.with_env()?;
    if let Some(ns) = &args.namespace {
        config.namespace = ns.clone();
        config.validate()?;
    }
    if let Some(filter) = &args.log {
        config.log_filter = filter.clone();
    }
    Ok(config)
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args).context("configuration")?;
    logging::init(&config.log_filter);
    shutdown::install_interrupt_counter().context("installing SIGINT handler")?;

    let hook: EventHook = Arc::new(|n: &Notification| match (n.kind, n.target) {
        (NotificationKind::Start, Some(pid)) => {
            println!("\n[event] process {pid} started (instance {})", n.sender)
        }
        (NotificationKind::Terminate, Some(pid)) => {
            println!("\n[event] process {pid} terminated (instance {})", n.sender)
        }
        _ => {}
    });

    let required = config.interrupt_confirmations;
    let instance = Instance::start_with_hook(config, Some(hook)).context("startup failed")?;
    println!("procx instance {} ready", instance.id());

    let lifecycle = instance.lifecycle();
    let registry = Arc::clone(instance.registry());

    // The watcher owns the instance: it either performs the interrupt-driven
    // shutdown and exits, or hands back the report when the menu quits.
    let (quit_tx, quit_rx) = mpsc::channel::<()>();
    let watcher = thread::Builder::new()
        .name("interrupts".into())
        .spawn(move || {
            let mut sequence = ShutdownSequence::new(required);
            loop {
                match quit_rx.recv_timeout(WATCH_INTERVAL) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                match sequence.poll() {
                    Stage::Idle => {}
                    Stage::Warned { seen, required } => println!(
                        "\nInterrupt {seen}/{required}: press Ctrl-C {} more time(s) to quit.",
                        required - seen
                    ),
                    Stage::Confirmed => {
                        println!("\nShutting down...");
                        print_report(&instance.shutdown());
                        std::process::exit(0);
                    }
                }
            }
            instance.shutdown()
        })
        .context("starting interrupt watcher")?;

    menu(&lifecycle, &registry)?;
    drop(quit_tx);
    let report = watcher
        .join()
        .map_err(|_| anyhow!("interrupt watcher panicked"))?;
    print_report(&report);
    Ok(())
}

fn menu(lifecycle: &Lifecycle, registry: &Registry) -> anyhow::Result<()> {
    let stdin = io::stdin();
    let mut input = stdin.lock();
    loop {
        print_menu();
        let Some(choice) = prompt(&mut input, "Choice: ")? else {
            return Ok(());
        };
        match choice.as_str() {
            "1" => launch(lifecycle, &mut input)?,
            "2" => match registry.active_records() {
                Ok(records) => print_table(&records),
                Err(e) => println!("[ERROR] {e}"),
            },
            "3" => terminate(lifecycle, &mut input)?,
            "0" => return Ok(()),
            "" => {}
            other => println!("[ERROR] Unknown choice `{other}`."),
        }
    }
}

fn launch(lifecycle: &Lifecycle, input: &mut impl BufRead) -> anyhow::Result<()> {
    let Some(command) = prompt(input, "Enter command to execute: ")? else {
        return Ok(());
    };
    let Some(mode) = prompt(input, "Mode (0=ATTACHED, 1=DETACHED): ")? else {
        return Ok(());
    };
    let Some(mode) = mode.parse().ok().and_then(ProcessMode::from_code) else {
        println!("[ERROR] Invalid mode. Use 0 or 1.");
        return Ok(());
    };
    match lifecycle.launch(&command, mode) {
        Ok(pid) if mode == ProcessMode::Attached => {
            println!("Attached process {pid} has terminated.")
        }
        Ok(pid) => println!("Started process {pid} ({mode})."),
        Err(e) => println!("[ERROR {}] {e}", e.code()),
    }
    Ok(())
}

fn terminate(lifecycle: &Lifecycle, input: &mut impl BufRead) -> anyhow::Result<()> {
    let Some(raw) = prompt(input, "Enter PID of program to terminate: ")? else {
        return Ok(());
    };
    let Ok(pid) = raw.parse::<i32>() else {
        println!("[ERROR] Invalid PID format.");
        return Ok(());
    };
    let handle = ProcessHandle::from_raw(pid);
    match lifecycle.terminate(handle) {
        Ok(()) => println!("Sent termination signal to PID {handle}."),
        Err(e) => println!("[ERROR {}] {e}", e.code()),
    }
    Ok(())
}

/// `None` on end of input.
fn prompt(input: &mut impl BufRead, text: &str) -> io::Result<Option<String>> {
    print!("{text}");
    io::stdout().flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_owned()))
}

fn print_menu() {
    println!();
    println!("+------------------------------+");
    println!("|          procx               |");
    println!("+------------------------------+");
    println!("| 1. Launch a program          |");
    println!("| 2. List running programs     |");
    println!("| 3. Terminate a program       |");
    println!("| 0. Exit                      |");
    println!("+------------------------------+");
}

fn print_table(records: &[ProcessRecord]) {
    println!("+-------+-------------------+----------+------------+---------+----------+");
    println!("|  PID  |      Command      |   Mode   |   Status   |  Owner  |   Time   |");
    println!("+-------+-------------------+----------+------------+---------+----------+");
    for rec in records {
        let command: String = rec.command.chars().take(17).collect();
        println!(
            "| {:<5} | {:<17} | {:<8} | {:<10} | {:<7} | {:>6} s |",
            rec.handle.as_raw(),
            command,
            rec.mode.to_string(),
            rec.status.to_string(),
            rec.owner.to_string(),
            rec.uptime().as_secs()
        );
    }
    println!("+-------+-------------------+----------+------------+---------+----------+");
}

fn print_report(report: &ShutdownReport) {
    if !report.terminated.is_empty() {
        let pids: Vec<String> = report.terminated.iter().map(ToString::to_string).collect();
        println!("Terminated attached processes: {}", pids.join(", "));
    }
    if report.destroyed {
        println!("Last instance out: shared resources removed.");
    }
}
