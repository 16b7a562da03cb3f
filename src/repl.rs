//! Interactive REPL.

use crate::{parse_event, print_macrostep};
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};
use statechart_core::{JsonDataModel, Machine, Snapshot};

const HELP_TEXT: &str = r#"
Available commands:
  help                          Show this help

  fire <event> [json]           Fire an event and run one macrostep
  state                         Show the active configuration
  ctx                           Show the data model context
  history                       Show recorded history

  snapshot                      Print a snapshot of the machine
  restore <json>                Restore a snapshot
  reset                         Re-enter the initial configuration

  quit, exit                    Exit the REPL
"#;

pub fn run(mut machine: Machine<JsonDataModel>) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "statechart REPL".bold().cyan());

    let result = machine.start()?;
    print_macrostep("start", &result, &machine.configuration());

    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".statechart_history"))
        .unwrap_or_else(|_| ".statechart_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        let prompt = format!("{} ", "statechart>".cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_repl_command(&mut machine, line) {
                    Ok(Some(output)) => println!("{}\n", output),
                    Ok(None) => break,
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    Ok(())
}

fn execute_repl_command(
    machine: &mut Machine<JsonDataModel>,
    line: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let (cmd, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    match cmd.to_lowercase().as_str() {
        "help" | "?" => Ok(Some(HELP_TEXT.to_string())),

        "quit" | "exit" | "q" => Ok(None),

        "fire" | "f" => {
            if rest.is_empty() {
                return Ok(Some("Usage: fire <event> [json]".to_string()));
            }
            let arg = match rest.split_once(char::is_whitespace) {
                Some((name, data)) => format!("{}={}", name, data.trim()),
                None => rest.to_string(),
            };
            let event = parse_event(&arg)?;
            let name = event.name.clone();
            let result = machine.fire(event)?;
            print_macrostep(&name, &result, &machine.configuration());
            if machine.is_final() {
                return Ok(Some("Machine is final.".dimmed().to_string()));
            }
            Ok(Some(String::new()))
        }

        "state" | "s" => Ok(Some(format!(
            "  configuration: {}\n  active: {}{}",
            machine.configuration().join(", ").yellow(),
            machine.active_states().join(", "),
            if machine.is_final() { " (final)" } else { "" }
        ))),

        "ctx" => Ok(Some(serde_json::to_string_pretty(
            machine.evaluator().context(),
        )?)),

        "history" | "h" => {
            let snapshot = machine.snapshot();
            if snapshot.history.is_empty() {
                return Ok(Some("No history recorded".yellow().to_string()));
            }
            let mut output = String::new();
            for (id, states) in &snapshot.history {
                output.push_str(&format!("  {} -> {}\n", id.cyan(), states.join(", ")));
            }
            Ok(Some(output))
        }

        "snapshot" => Ok(Some(serde_json::to_string_pretty(&machine.snapshot())?)),

        "restore" => {
            if rest.is_empty() {
                return Ok(Some("Usage: restore <snapshot_json>".to_string()));
            }
            let snapshot: Snapshot = serde_json::from_str(rest)?;
            machine.restore(&snapshot)?;
            Ok(Some(format!(
                "{} {}",
                "Restored".green(),
                machine.configuration().join(", ").yellow()
            )))
        }

        "reset" => {
            let result = machine.reset()?;
            print_macrostep("reset", &result, &machine.configuration());
            Ok(Some(String::new()))
        }

        _ => Ok(Some(format!(
            "Unknown command: {}. Type 'help' for available commands.",
            cmd
        ))),
    }
}
