use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Arg, ArgAction, ArgMatches, Command};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::Level;

use conveyor_engine::executor::{ActionRunner, HttpActionRunner, NoopActionRunner, run_block_over_rows};
use conveyor_engine::resolve::{ReferenceKind, scan_references, substitute};
use conveyor_engine::run::drive_run;
use conveyor_engine::sources::SourceRegistry;
use conveyor_engine::vars::{PersistenceHook, VariableStore};
use conveyor_engine::{delete_agent, load_agent, parse_agent_file, rename_agent, save_agent};
use conveyor_types::{Agent, BlockStatus, Row, RunControl, RunEvent, RunOutcome, VariableKind, VariableValue};
use conveyor_util::{DocumentStore, JsonDocumentStore, Session};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let matches = build_cli().get_matches();

    match matches.subcommand() {
        Some(("validate", sub)) => run_validate(sub),
        Some(("refs", sub)) => run_refs(sub),
        Some(("compose", sub)) => run_compose(sub),
        Some(("run", sub)) => run_pipeline(sub).await,
        Some(("batch", sub)) => run_batch(sub).await,
        Some(("agent", sub)) => run_agent_cmd(sub).await,
        _ => bail!("expected a subcommand; run with --help"),
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::INFO)
        .try_init();
}

fn build_cli() -> Command {
    Command::new("conveyor")
        .about("Agent pipeline runner")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("validate")
                .about("Parse a pipeline file and check its block sequence and references")
                .arg(file_arg())
                .arg(var_arg())
                .arg(source_arg()),
        )
        .subcommand(
            Command::new("refs")
                .about("Report template references with spans and resolution status")
                .arg(Arg::new("text").action(ArgAction::Set).help("Template text to scan"))
                .arg(file_arg().required(false))
                .arg(block_arg())
                .arg(var_arg())
                .arg(source_arg())
                .arg(
                    Arg::new("substitute")
                        .long("substitute")
                        .action(ArgAction::SetTrue)
                        .help("Print the substituted text instead of the reference report"),
                ),
        )
        .subcommand(
            Command::new("compose")
                .about("Edit a prompt in the interactive composer")
                .arg(file_arg().required(false))
                .arg(block_arg())
                .arg(
                    Arg::new("text")
                        .long("text")
                        .action(ArgAction::Set)
                        .help("Initial prompt text (overrides the block's field)"),
                )
                .arg(var_arg())
                .arg(source_arg()),
        )
        .subcommand(
            Command::new("run")
                .about("Run a pipeline end to end")
                .arg(file_arg())
                .arg(var_arg())
                .arg(offline_arg())
                .arg(base_url_arg())
                .arg(
                    Arg::new("auto-resume")
                        .long("auto-resume")
                        .action(ArgAction::SetTrue)
                        .help("Resume check-ins without prompting"),
                )
                .arg(
                    Arg::new("persist")
                        .long("persist")
                        .action(ArgAction::SetTrue)
                        .help("Load and save variables through the document store"),
                )
                .arg(user_arg()),
        )
        .subcommand(
            Command::new("batch")
                .about("Run one block once per row of a table")
                .arg(file_arg())
                .arg(
                    Arg::new("block")
                        .long("block")
                        .required(true)
                        .action(ArgAction::Set)
                        .help("Block to repeat, by number or id"),
                )
                .arg(
                    Arg::new("table")
                        .long("table")
                        .required(true)
                        .action(ArgAction::Set)
                        .help("Table variable name"),
                )
                .arg(
                    Arg::new("rows")
                        .long("rows")
                        .action(ArgAction::Set)
                        .help("Inline JSON array of row objects to seed the table"),
                )
                .arg(
                    Arg::new("column")
                        .long("column")
                        .action(ArgAction::Set)
                        .help("Input column (defaults to a per-block heuristic)"),
                )
                .arg(var_arg())
                .arg(offline_arg())
                .arg(base_url_arg()),
        )
        .subcommand(
            Command::new("agent")
                .about("Manage stored agents")
                .subcommand_required(true)
                .subcommand(
                    Command::new("save")
                        .about("Save a pipeline file to the document store")
                        .arg(file_arg())
                        .arg(user_arg()),
                )
                .subcommand(Command::new("show").about("Print a stored agent").arg(id_arg()).arg(user_arg()))
                .subcommand(
                    Command::new("rename")
                        .about("Rename a stored agent in place")
                        .arg(id_arg())
                        .arg(Arg::new("name").required(true).action(ArgAction::Set).help("New display name"))
                        .arg(user_arg()),
                )
                .subcommand(
                    Command::new("delete")
                        .about("Delete an agent and every variable it owns")
                        .arg(id_arg())
                        .arg(user_arg()),
                ),
        )
}

fn file_arg() -> Arg {
    Arg::new("file")
        .long("file")
        .short('f')
        .required(true)
        .action(ArgAction::Set)
        .help("Path to a pipeline YAML/JSON file")
}

fn var_arg() -> Arg {
    Arg::new("var")
        .long("var")
        .action(ArgAction::Append)
        .value_name("NAME=VALUE")
        .help("Seed a scalar variable (value parsed as JSON, else kept as text)")
}

fn source_arg() -> Arg {
    Arg::new("source")
        .long("source")
        .action(ArgAction::Append)
        .value_name("NICKNAME=URL")
        .help("Attach a page source under a nickname")
}

fn block_arg() -> Arg {
    Arg::new("block")
        .long("block")
        .action(ArgAction::Set)
        .value_parser(clap::value_parser!(u32))
        .help("Block number to target")
}

fn offline_arg() -> Arg {
    Arg::new("offline")
        .long("offline")
        .action(ArgAction::SetTrue)
        .help("Echo actions locally instead of calling the action service")
}

fn base_url_arg() -> Arg {
    Arg::new("base-url")
        .long("base-url")
        .action(ArgAction::Set)
        .value_name("URL")
        .conflicts_with("offline")
        .help("Action service base URL (overrides CONVEYOR_ACTIONS_BASE)")
}

fn user_arg() -> Arg {
    Arg::new("user")
        .long("user")
        .action(ArgAction::Set)
        .help("User id for persistence (defaults to CONVEYOR_USER)")
}

fn id_arg() -> Arg {
    Arg::new("id").required(true).action(ArgAction::Set).help("Agent id")
}

fn run_validate(matches: &ArgMatches) -> Result<()> {
    let path = required_str(matches, "file")?;
    let agent = parse_agent_file(path)?;
    let mut store = VariableStore::new(&agent.id);
    seed_vars_into(&mut store, matches)?;
    let sources = seed_sources(matches)?;

    println!("{} ({}): {} blocks", agent.name, agent.id, agent.blocks.len());
    for block in &agent.blocks {
        let output = block
            .output_variable
            .as_deref()
            .map(|name| format!(" -> {name}"))
            .unwrap_or_default();
        println!("  {}. {}{}", block.block_number, block.kind.label(), output);
        for (field, text) in block.kind.template_fields() {
            let references = scan_references(text, &store, &sources);
            if references.is_empty() {
                continue;
            }
            let unresolved: Vec<_> = references.iter().filter(|r| !r.is_resolved()).collect();
            if unresolved.is_empty() {
                println!("     {field}: {} reference(s) resolve", references.len());
            } else {
                println!("     {field}: {} of {} reference(s) unresolved", unresolved.len(), references.len());
                for reference in unresolved {
                    println!("       {} at {}..{}", reference.raw_text, reference.span_start, reference.span_end);
                }
            }
        }
        // Later blocks may legitimately reference this block's output.
        if let Some(name) = &block.output_variable
            && store.get(name).is_none()
        {
            store.set_scalar(name, Value::String(String::new()))?;
        }
    }
    Ok(())
}

fn run_refs(matches: &ArgMatches) -> Result<()> {
    let mut store = VariableStore::new("cli");
    seed_vars_into(&mut store, matches)?;
    let sources = seed_sources(matches)?;
    let substituted = matches.get_flag("substitute");

    if let Some(path) = matches.get_one::<String>("file") {
        let agent = parse_agent_file(path)?;
        let wanted = matches.get_one::<u32>("block").copied();
        for block in &agent.blocks {
            if wanted.is_some_and(|number| number != block.block_number) {
                continue;
            }
            for (field, text) in block.kind.template_fields() {
                println!("block {} ({}) {field}:", block.block_number, block.kind.label());
                if substituted {
                    println!("  {}", substitute(text, &store));
                } else {
                    print_reference_report(text, &store, &sources, "  ");
                }
            }
        }
        return Ok(());
    }

    let Some(text) = matches.get_one::<String>("text") else {
        bail!("pass template text as an argument, or point --file at a pipeline");
    };
    if substituted {
        println!("{}", substitute(text, &store));
    } else {
        print_reference_report(text, &store, &sources, "");
    }
    Ok(())
}

fn print_reference_report(text: &str, store: &VariableStore, sources: &SourceRegistry, indent: &str) {
    let references = scan_references(text, store, sources);
    for reference in &references {
        let kind = match reference.kind {
            ReferenceKind::Variable => "variable",
            ReferenceKind::TableColumn => "table column",
            ReferenceKind::Source => "source",
        };
        let status = match &reference.resolved_value {
            Some(value) => format!("resolves to {value:?}"),
            None => "unresolved".to_string(),
        };
        println!(
            "{indent}{:>4}..{:<4} {:<12} {:<24} {}",
            reference.span_start, reference.span_end, kind, reference.raw_text, status
        );
    }
    let unresolved = references.iter().filter(|r| !r.is_resolved()).count();
    println!("{indent}{} reference(s), {} unresolved", references.len(), unresolved);
}

fn run_compose(matches: &ArgMatches) -> Result<()> {
    let mut store = VariableStore::new("cli");
    seed_vars_into(&mut store, matches)?;
    let sources = seed_sources(matches)?;

    let mut title = String::from("Compose prompt");
    let mut initial = matches.get_one::<String>("text").cloned().unwrap_or_default();
    if initial.is_empty()
        && let Some(path) = matches.get_one::<String>("file")
    {
        let agent = parse_agent_file(path)?;
        let block = match matches.get_one::<u32>("block").copied() {
            Some(number) => agent
                .block_by_number(number)
                .with_context(|| format!("pipeline '{}' has no block numbered {number}", agent.name))?,
            None => agent
                .blocks
                .iter()
                .find(|block| block.kind.primary_template_field().is_some())
                .with_context(|| format!("pipeline '{}' has no editable block", agent.name))?,
        };
        let (field, text) = block
            .kind
            .primary_template_field()
            .with_context(|| format!("block {} ({}) has no editable field", block.block_number, block.kind.label()))?;
        title = format!("{}: block {} {field}", agent.name, block.block_number);
        initial = text.to_string();
    }

    match conveyor_tui::compose_prompt(&initial, &store, &sources, &title)? {
        Some(text) => {
            println!("{text}");
            print_reference_report(&text, &store, &sources, "");
        }
        None => eprintln!("Cancelled"),
    }
    Ok(())
}

async fn run_pipeline(matches: &ArgMatches) -> Result<()> {
    let path = required_str(matches, "file")?;
    let agent = parse_agent_file(path)?;

    let mut hook_handle = None;
    let mut store = if matches.get_flag("persist") {
        let session = session_from(matches)?;
        let docs: Arc<dyn DocumentStore> = Arc::new(JsonDocumentStore::with_defaults()?);
        let mut store = VariableStore::load_for_agent(&session, docs.as_ref(), &agent.id).await?;
        let (hook, handle) = PersistenceHook::spawn(session, docs);
        store.attach_persistence(hook);
        hook_handle = Some(handle);
        store
    } else {
        VariableStore::new(&agent.id)
    };
    seed_vars_into(&mut store, matches)?;

    let runner = build_runner(matches)?;
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let reporter = tokio::spawn(report_events(event_rx, control_tx, matches.get_flag("auto-resume")));

    let summary = drive_run(&agent, &mut store, runner.as_ref(), &mut control_rx, &event_tx).await?;
    drop(event_tx);
    reporter.await?;

    println!(
        "{}: {} of {} block(s) completed",
        outcome_label(summary.outcome),
        summary.completed_blocks,
        agent.blocks.len()
    );
    if let Some(error) = &summary.error {
        println!("error: {error}");
    }
    for variable in store.iter() {
        match variable.rows() {
            Some(rows) => println!("  {} = table with {} row(s)", variable.name, rows.len()),
            None => {
                if let Some(value) = variable.scalar_value() {
                    println!("  {} = {}", variable.name, value);
                }
            }
        }
    }

    // Closing the scope flushes the write-behind queue.
    drop(store);
    if let Some(handle) = hook_handle {
        handle.await?;
    }
    Ok(())
}

async fn run_batch(matches: &ArgMatches) -> Result<()> {
    let path = required_str(matches, "file")?;
    let agent = parse_agent_file(path)?;
    let selector = required_str(matches, "block")?;
    let block = match selector.parse::<u32>() {
        Ok(number) => agent.block_by_number(number),
        Err(_) => agent.blocks.iter().find(|block| block.id == selector),
    }
    .with_context(|| format!("pipeline '{}' has no block '{selector}'", agent.name))?;

    let mut store = VariableStore::new(&agent.id);
    seed_vars_into(&mut store, matches)?;
    let table_name = required_str(matches, "table")?;
    if let Some(rows_json) = matches.get_one::<String>("rows") {
        seed_table(&mut store, table_name, rows_json)?;
    }
    let table_id = store
        .get(table_name)
        .map(|variable| variable.id.clone())
        .with_context(|| format!("no table variable named '{table_name}'; seed it with --rows"))?;

    let runner = build_runner(matches)?;
    let column = matches.get_one::<String>("column").map(String::as_str);
    let outcome = run_block_over_rows(&mut store, &table_id, block, column, runner.as_ref()).await?;

    println!(
        "{} row(s) processed, {} failed, outputs in column '{}'",
        outcome.rows_processed, outcome.failures, outcome.output_column
    );
    if let Some(variable) = store.get(table_name) {
        println!("{}", serde_json::to_string_pretty(variable)?);
    }
    Ok(())
}

async fn run_agent_cmd(matches: &ArgMatches) -> Result<()> {
    let docs = JsonDocumentStore::with_defaults()?;
    match matches.subcommand() {
        Some(("save", sub)) => {
            let session = session_from(sub)?;
            let agent = parse_agent_file(required_str(sub, "file")?)?;
            save_agent(&session, &docs, &agent).await?;
            println!("saved agent '{}' ({})", agent.name, agent.id);
        }
        Some(("show", sub)) => {
            let session = session_from(sub)?;
            let agent: Agent = load_agent(&session, &docs, required_str(sub, "id")?).await?;
            println!("{}", serde_json::to_string_pretty(&agent)?);
        }
        Some(("rename", sub)) => {
            let session = session_from(sub)?;
            let id = required_str(sub, "id")?;
            let name = required_str(sub, "name")?;
            rename_agent(&session, &docs, id, name).await?;
            println!("renamed agent {id} to '{name}'");
        }
        Some(("delete", sub)) => {
            let session = session_from(sub)?;
            let id = required_str(sub, "id")?;
            let removed = delete_agent(&session, &docs, id).await?;
            println!("deleted agent {id} and {removed} owned variable(s)");
        }
        _ => bail!("available subcommands: save, show, rename, delete"),
    }
    Ok(())
}

/// Print run events as they stream and answer check-in pauses.
async fn report_events(
    mut events: mpsc::UnboundedReceiver<RunEvent>,
    control: mpsc::UnboundedSender<RunControl>,
    auto_resume: bool,
) {
    while let Some(event) = events.recv().await {
        match event {
            RunEvent::RunStarted { total_blocks, .. } => println!("run started: {total_blocks} block(s)"),
            RunEvent::PhaseChanged { phase } => println!("phase: {}", phase.label()),
            RunEvent::BlockStarted { index, label, .. } => println!("[{}] {label}...", index + 1),
            RunEvent::BlockFinished {
                index,
                status,
                output,
                duration_ms,
                ..
            } => {
                let marker = match status {
                    BlockStatus::Succeeded => "ok",
                    BlockStatus::Failed => "failed",
                };
                match output {
                    Some(output) if !output.is_empty() => {
                        println!("[{}] {marker} in {duration_ms}ms: {}", index + 1, first_line(&output))
                    }
                    _ => println!("[{}] {marker} in {duration_ms}ms", index + 1),
                }
            }
            RunEvent::CheckInReached { index, note } => {
                match note {
                    Some(note) => println!("check-in at block {}: {note}", index + 1),
                    None => println!("check-in at block {}", index + 1),
                }
                let control_message = if auto_resume {
                    println!("auto-resuming");
                    RunControl::Resume
                } else {
                    prompt_for_resume().await
                };
                let _ = control.send(control_message);
            }
            RunEvent::RunCompleted { outcome, error, .. } => match error {
                Some(error) => println!("run {}: {error}", outcome_label(outcome)),
                None => println!("run {}", outcome_label(outcome)),
            },
        }
    }
}

/// Block on stdin for the check-in decision.
async fn prompt_for_resume() -> RunControl {
    println!("press Enter to resume, or type q to close the run");
    let line = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        line
    })
    .await
    .unwrap_or_default();
    if line.trim().eq_ignore_ascii_case("q") {
        RunControl::Close
    } else {
        RunControl::Resume
    }
}

fn build_runner(matches: &ArgMatches) -> Result<Box<dyn ActionRunner>> {
    if matches.get_flag("offline") {
        return Ok(Box::new(NoopActionRunner));
    }
    match matches.get_one::<String>("base-url") {
        Some(base) => Ok(Box::new(HttpActionRunner::with_base_url(base)?)),
        None => Ok(Box::new(HttpActionRunner::from_env()?)),
    }
}

fn session_from(matches: &ArgMatches) -> Result<Session> {
    match matches.get_one::<String>("user") {
        Some(user) => Ok(Session::new(user.clone())?),
        None => Ok(Session::from_env()),
    }
}

fn required_str<'m>(matches: &'m ArgMatches, name: &str) -> Result<&'m str> {
    matches
        .get_one::<String>(name)
        .map(String::as_str)
        .with_context(|| format!("--{name} is required"))
}

fn seed_vars_into(store: &mut VariableStore, matches: &ArgMatches) -> Result<()> {
    if let Some(pairs) = matches.get_many::<String>("var") {
        for pair in pairs {
            let (name, raw) = pair
                .split_once('=')
                .with_context(|| format!("--var expects NAME=VALUE, got '{pair}'"))?;
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            store.set_scalar(name, value)?;
        }
    }
    Ok(())
}

fn seed_sources(matches: &ArgMatches) -> Result<SourceRegistry> {
    let mut registry = SourceRegistry::new();
    if let Some(pairs) = matches.get_many::<String>("source") {
        for pair in pairs {
            let (nickname, url) = pair
                .split_once('=')
                .with_context(|| format!("--source expects NICKNAME=URL, got '{pair}'"))?;
            registry.attach_page(nickname, url)?;
        }
    }
    Ok(registry)
}

/// Seed a table variable from an inline JSON array of row objects.
fn seed_table(store: &mut VariableStore, name: &str, rows_json: &str) -> Result<()> {
    let rows: Vec<Row> = serde_json::from_str(rows_json).context("--rows must be a JSON array of objects")?;
    let mut columns: Vec<String> = Vec::new();
    for row in &rows {
        for key in row.keys() {
            if !columns.iter().any(|column| column == key) {
                columns.push(key.clone());
            }
        }
    }
    store.create(name, VariableKind::Table, Some(VariableValue::Table { columns, rows }))?;
    Ok(())
}

fn outcome_label(outcome: RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::Succeeded => "succeeded",
        RunOutcome::Failed => "failed",
        RunOutcome::Closed => "closed",
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or(text)
}
