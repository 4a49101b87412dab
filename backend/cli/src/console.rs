//! Operator console: line commands read from stdin while the host runs.

use anyhow::{Context, Result, bail};
use modhost_plugins::{BatchReport, ModManager, ShutdownCoordinator, ShutdownReason};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::info;

use crate::terminal_output::{note_error, note_info, note_success, note_warn, render_table};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Load(Vec<String>),
    /// Empty means every loaded mod.
    Unload(Vec<String>),
    /// Empty means every loaded mod.
    Reload(Vec<String>),
    Broadcast { event: String, args: Vec<Value> },
    List,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  load <name..>                 load mods
  unload [name..]               unload mods (all when omitted)
  reload [name..]               reload mods (all when omitted)
  broadcast <event> [json..]    send an event to every live mod
  list                          show loaded mods
  quit                          unload everything and exit";

impl Command {
    /// Parse one input line. Blank lines and `#` comments yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let names = || rest.split_whitespace().map(str::to_string).collect::<Vec<_>>();

        let command = match verb {
            "load" => {
                let names = names();
                if names.is_empty() {
                    bail!("load needs at least one mod name");
                }
                Command::Load(names)
            }
            "unload" => Command::Unload(names()),
            "reload" => Command::Reload(names()),
            "broadcast" => {
                let mut parts = rest.split_whitespace();
                let event = parts.next().context("broadcast needs an event name")?;
                let args = parts.map(parse_arg).collect();
                Command::Broadcast {
                    event: event.to_string(),
                    args,
                }
            }
            "list" | "ls" => Command::List,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => bail!("unknown command '{other}' (try 'help')"),
        };
        Ok(Some(command))
    }
}

/// A broadcast argument is JSON when it parses as JSON, else a plain string.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Whether the console keeps reading after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

pub async fn execute(manager: &ModManager, command: Command) -> Flow {
    match command {
        Command::Load(names) => report("loaded", &manager.load_many(names).await),
        Command::Unload(names) if names.is_empty() => report("unloaded", &manager.unload_all(false).await),
        Command::Unload(names) => report("unloaded", &manager.unload_many(names, false).await),
        Command::Reload(names) if names.is_empty() => report("reloaded", &manager.reload_all().await),
        Command::Reload(names) => report("reloaded", &manager.reload_many(names).await),
        Command::Broadcast { event, args } => {
            let reached = manager.broadcast(&event, &args);
            note_info(&format!("'{event}' delivered to {reached} mod(s)"));
        }
        Command::List => print!("{}", list_table(manager)),
        Command::Help => println!("{HELP}"),
        Command::Quit => return Flow::Stop,
    }
    Flow::Continue
}

fn report<T>(verb: &str, batch: &BatchReport<T>) {
    if batch.is_empty() {
        note_warn("nothing to do");
    }
    for (name, _) in batch.succeeded() {
        note_success(&format!("{verb} {name}"));
    }
    for (name, err) in batch.failures() {
        note_error(&format!("{name}: {err:#}"));
    }
}

pub fn list_table(manager: &ModManager) -> String {
    let rows: Vec<Vec<String>> = manager
        .loaded_names()
        .into_iter()
        .filter_map(|name| {
            let ctx = manager.get(&name)?;
            Some(vec![
                name,
                ctx.state().to_string(),
                ctx.generation().to_string(),
                ctx.active_timers().to_string(),
                ctx.source_id().to_string(),
            ])
        })
        .collect();
    if rows.is_empty() {
        return "  (no mods loaded)\n".to_string();
    }
    render_table(&["MOD", "STATE", "GEN", "TIMERS", "SOURCE"], &rows)
}

/// Lines from stdin, read on a detached thread.
fn spawn_input_reader() -> Result<mpsc::UnboundedReceiver<std::io::Result<String>>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("operator-input".to_string())
        .spawn(move || {
            for line in std::io::stdin().lines() {
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("spawn operator input thread")?;
    Ok(rx)
}

/// Read commands from stdin until `quit`, end of input, or shutdown. Either
/// way the coordinator is triggered so the bulk unload runs.
pub async fn run(manager: ModManager, coordinator: ShutdownCoordinator) -> Result<()> {
    let mut lines = spawn_input_reader()?;
    note_info("type 'help' for commands");

    loop {
        let line = tokio::select! {
            line = lines.recv() => line,
            _ = coordinator.wait() => return Ok(()),
        };
        let Some(line) = line else {
            info!("Operator input closed");
            break;
        };
        let line = line.context("read operator input")?;
        match Command::parse(&line) {
            Ok(Some(command)) => {
                if execute(&manager, command).await == Flow::Stop {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => note_error(&e.to_string()),
        }
    }

    coordinator.trigger(ShutdownReason::Requested);
    Ok(())
}
