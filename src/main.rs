//! statechart - Command-line runner for state-chart documents
//!
//! Validates documents, runs event sequences and hosts an interactive REPL.

mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::Value;
use statechart_core::{
    Config, Document, DocumentDef, Event, JsonDataModel, Listener, Machine, Macrostep, NodeId,
    NodeKind,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "statechart")]
#[command(about = "Run and inspect hierarchical state-chart documents")]
#[command(version)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, global = true, env = "STATECHART_CONFIG")]
    config: Option<PathBuf>,

    /// Print entries, exits and transitions, and include error details
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a document and print its states
    Validate {
        /// Document file (JSON, or YAML with a .yaml/.yml extension)
        document: PathBuf,
    },

    /// Start a machine and fire events, one macrostep each
    Run {
        /// Document file
        document: PathBuf,

        /// Event to fire, as `name` or `name=<json data>`
        #[arg(short, long = "event")]
        events: Vec<String>,

        /// Initial context JSON
        #[arg(long)]
        ctx: Option<String>,
    },

    /// Start an interactive session
    Repl {
        /// Document file
        document: PathBuf,

        /// Initial context JSON
        #[arg(long)]
        ctx: Option<String>,
    },
}

/// Prints entries, exits and transitions as they happen.
struct Printer;

impl Listener for Printer {
    fn on_entry(&mut self, state: &str) {
        println!("  {} {}", "enter".green(), state);
    }

    fn on_exit(&mut self, state: &str) {
        println!("  {} {}", "exit".yellow(), state);
    }

    fn on_transition(&mut self, source: &str, target: &str, event: Option<&str>) {
        println!(
            "  {} {} -> {} [{}]",
            "take".cyan(),
            source,
            target,
            event.unwrap_or("")
        );
    }
}

fn main() {
    let cli = Cli::parse();

    let config = match Config::load_from(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)),
        )
        .init();

    if let Err(e) = run(cli, config) {
        eprintln!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }
}

fn run(cli: Cli, mut config: Config) -> Result<(), Box<dyn std::error::Error>> {
    if cli.verbose {
        config.interpreter.verbose_errors = true;
    }

    match cli.command {
        Commands::Validate { document } => {
            let def = read_definition(&document)?;
            let mut doc = Document::from_def(&def)?;
            statechart_core::validate(&mut doc)?;

            println!(
                "{} {} ({} nodes, {} transitions)",
                "Valid".green(),
                doc.id_of(Document::ROOT).cyan(),
                doc.node_count() - 1,
                doc.transition_count()
            );
            print_tree(&doc, Document::ROOT, 0);
            println!("checksum: {}", doc.checksum());
        }

        Commands::Run {
            document,
            events,
            ctx,
        } => {
            let mut machine = load_machine(&document, ctx.as_deref(), &config, cli.verbose)?;
            let result = machine.start()?;
            print_macrostep("start", &result, &machine.configuration());

            for arg in events {
                let event = parse_event(&arg)?;
                let name = event.name.clone();
                match machine.fire(event) {
                    Ok(result) => print_macrostep(&name, &result, &machine.configuration()),
                    Err(e) if e.is_machine_usable() => println!("{}: {}", "Rolled back".red(), e),
                    Err(e) => return Err(e.into()),
                }
                if machine.is_final() {
                    println!("{}", "Machine is final.".dimmed());
                    break;
                }
            }
        }

        Commands::Repl { document, ctx } => {
            let machine = load_machine(&document, ctx.as_deref(), &config, cli.verbose)?;
            repl::run(machine)?;
        }
    }

    Ok(())
}

fn read_definition(path: &Path) -> Result<DocumentDef, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let def = if is_yaml {
        serde_yaml::from_str(&content)?
    } else {
        serde_json::from_str(&content)?
    };
    Ok(def)
}

fn load_machine(
    path: &Path,
    ctx: Option<&str>,
    config: &Config,
    verbose: bool,
) -> Result<Machine<JsonDataModel>, Box<dyn std::error::Error>> {
    let def = read_definition(path)?;
    let ctx: Value = ctx.map(serde_json::from_str).transpose()?.unwrap_or(Value::Null);

    let mut machine =
        Machine::load(&def, JsonDataModel::new(ctx))?.with_config(config.interpreter.clone());
    if verbose {
        machine = machine.with_listener(Printer);
    }
    Ok(machine)
}

/// Parses `name` or `name=<json>`.
pub(crate) fn parse_event(arg: &str) -> Result<Event, serde_json::Error> {
    match arg.split_once('=') {
        Some((name, data)) => Ok(Event::new(name.trim()).with_data(serde_json::from_str(data)?)),
        None => Ok(Event::new(arg.trim())),
    }
}

pub(crate) fn print_macrostep(label: &str, result: &Macrostep, configuration: &[String]) {
    let events: Vec<&str> = result.events.iter().map(|e| e.name.as_str()).collect();
    println!(
        "{} {} microstep(s)",
        label.bold(),
        result.microsteps.to_string().cyan()
    );
    if !events.is_empty() {
        println!("  events: {}", events.join(", ").dimmed());
    }
    println!("  configuration: {}", configuration.join(", ").yellow());
}

fn print_tree(doc: &Document, node: NodeId, indent: usize) {
    for &child in doc.node(node).children() {
        let n = doc.node(child);
        let kind = match n.kind() {
            NodeKind::Parallel => "parallel",
            NodeKind::State { is_final: true, .. } => "final",
            NodeKind::State { .. } if n.is_atomic() => "state",
            NodeKind::State { .. } => "compound",
            NodeKind::History { .. } | NodeKind::Root { .. } => continue,
        };
        println!("{}{} {}", "  ".repeat(indent + 1), n.id().cyan(), kind.dimmed());
        print_tree(doc, child, indent + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_event() {
        let event = parse_event("order.paid").unwrap();
        assert_eq!(event.name, "order.paid");
        assert_eq!(event.data, Value::Null);

        let event = parse_event("order.paid={\"amount\": 5}").unwrap();
        assert_eq!(event.name, "order.paid");
        assert_eq!(event.data, json!({"amount": 5}));

        assert!(parse_event("x={").is_err());
    }

    #[test]
    fn test_read_yaml_definition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.yaml");
        std::fs::write(
            &path,
            "states:\n  - id: a\n    transitions:\n      - event: go\n        target: b\n  - id: b\n",
        )
        .unwrap();

        let def = read_definition(&path).unwrap();
        assert_eq!(def.states.len(), 2);
    }
}
