use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use todomark::config::Config;
use todomark::core::{DocumentId, TodoItem};
use todomark::engine::{TodoEngine, TransactionReport};
use todomark::todo_map::TodoMap;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "todomark",
    about = "Inspect and edit todo items in Markdown lists",
    version
)]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG).
    #[arg(long, global = true)]
    verbose: bool,
    /// JSON config file with todo states and metadata tags.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the todos in a file.
    List(ListArgs),

    /// Rewrite checkboxes between `[ ]`/`[x]` and state glyphs.
    Convert(ConvertArgs),

    /// Toggle the todo covering a line.
    Toggle(ToggleArgs),

    /// Set the state of the todo covering a line.
    SetState(SetStateArgs),

    /// Add, replace or remove an `@tag(value)` on the todo covering a line.
    Tag(TagArgs),
}

#[derive(Debug, Args)]
struct ListArgs {
    file: PathBuf,
    /// Emit JSON instead of an outline.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ConvertArgs {
    file: PathBuf,
    #[arg(long, value_enum)]
    to: ConvertTarget,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ConvertTarget {
    /// `[ ]` → `☐`
    Unicode,
    /// `☐` → `[ ]`
    Markdown,
}

#[derive(Debug, Args)]
struct ToggleArgs {
    file: PathBuf,
    /// 1-based line inside the todo.
    #[arg(long)]
    line: usize,
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct SetStateArgs {
    file: PathBuf,
    #[arg(long)]
    line: usize,
    /// Configured state name, e.g. `checked`.
    #[arg(long)]
    state: String,
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct TagArgs {
    file: PathBuf,
    #[arg(long)]
    line: usize,
    #[arg(long)]
    tag: String,
    /// Value to write. Defaults to the tag's configured default.
    #[arg(long)]
    value: Option<String>,
    /// Remove the tag and its aliases instead.
    #[arg(long, conflicts_with = "value")]
    remove: bool,
    #[arg(long)]
    in_place: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(cli.config.as_deref())?;
    let engine = TodoEngine::new(config).context("invalid configuration")?;
    match cli.command {
        Commands::List(args) => handle_list(&engine, args),
        Commands::Convert(args) => handle_convert(&engine, args),
        Commands::Toggle(args) => handle_toggle(&engine, args),
        Commands::SetState(args) => handle_set_state(&engine, args),
        Commands::Tag(args) => handle_tag(&engine, args),
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "todomark=debug" } else { "todomark=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    // A subscriber may already be installed when running under a test harness.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path).with_context(|| format!("loading config {:?}", path)),
        None => Ok(Config::default()),
    }
}

fn open(engine: &TodoEngine, path: &Path) -> Result<DocumentId> {
    engine
        .load_file(path)
        .with_context(|| format!("reading {:?}", path))
}

fn line_to_row(line: usize) -> Result<usize> {
    line.checked_sub(1)
        .context("line numbers start at 1")
}

fn todo_on_line(engine: &TodoEngine, doc: DocumentId, line: usize) -> Result<TodoItem> {
    let row = line_to_row(line)?;
    engine
        .get_todo_at(doc, row, 0)?
        .with_context(|| format!("no todo on line {line}"))
}

fn handle_list(engine: &TodoEngine, args: ListArgs) -> Result<()> {
    let ListArgs { file, json } = args;
    let doc = open(engine, &file)?;
    let todos = engine.discover(doc)?;

    if json {
        let items = todos.in_document_order();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }
    if todos.is_empty() {
        eprintln!("No todos found in {}.", file.display());
        return Ok(());
    }
    for line in outline(&todos) {
        println!("{line}");
    }
    Ok(())
}

/// One line per todo: 1-based line number, nesting, glyph and text.
fn outline(todos: &TodoMap) -> Vec<String> {
    todos
        .in_document_order()
        .into_iter()
        .map(|todo| {
            let mut depth = 0;
            let mut parent = todo.parent_id;
            while let Some(id) = parent {
                depth += 1;
                parent = todos.get(id).and_then(|p| p.parent_id);
            }
            format!(
                "{:>4}  {}{} {}",
                todo.marker.position.row + 1,
                "  ".repeat(depth),
                todo.marker.text,
                todo.text
            )
            .trim_end()
            .to_string()
        })
        .collect()
}

fn handle_convert(engine: &TodoEngine, args: ConvertArgs) -> Result<()> {
    let ConvertArgs { file, to, in_place } = args;
    let doc = open(engine, &file)?;
    let changed = match to {
        ConvertTarget::Unicode => engine.convert_to_canonical(doc)?,
        ConvertTarget::Markdown => engine.convert_to_portable(doc)?,
    };
    if !changed {
        tracing::info!(file = %file.display(), "nothing to convert");
    }
    write_out(engine, doc, &file, in_place)
}

fn handle_toggle(engine: &TodoEngine, args: ToggleArgs) -> Result<()> {
    let ToggleArgs {
        file,
        line,
        in_place,
    } = args;
    let doc = open(engine, &file)?;
    let todo = todo_on_line(engine, doc, line)?;
    let report = engine.toggle(doc, todo.id)?;
    finish(engine, doc, &file, in_place, &report)
}

fn handle_set_state(engine: &TodoEngine, args: SetStateArgs) -> Result<()> {
    let SetStateArgs {
        file,
        line,
        state,
        in_place,
    } = args;
    let doc = open(engine, &file)?;
    let todo = todo_on_line(engine, doc, line)?;
    let report = engine.set_state(doc, todo.id, &state)?;
    finish(engine, doc, &file, in_place, &report)
}

fn handle_tag(engine: &TodoEngine, args: TagArgs) -> Result<()> {
    let TagArgs {
        file,
        line,
        tag,
        value,
        remove,
        in_place,
    } = args;
    let doc = open(engine, &file)?;
    let todo = todo_on_line(engine, doc, line)?;
    let report = if remove {
        engine.remove_metadata(doc, todo.id, &tag)?
    } else {
        engine.add_metadata(doc, todo.id, &tag, value.as_deref())?
    };
    finish(engine, doc, &file, in_place, &report)
}

/// Refuse to write a document whose edit partly failed.
fn finish(
    engine: &TodoEngine,
    doc: DocumentId,
    path: &Path,
    in_place: bool,
    report: &TransactionReport,
) -> Result<()> {
    for failure in &report.callback_failures {
        eprintln!("warning: follow-up edit failed: {}", failure.error);
    }
    if let Some(failure) = report.op_failures.first() {
        anyhow::bail!("{} failed: {}", failure.key, failure.error);
    }
    write_out(engine, doc, path, in_place)
}

fn write_out(engine: &TodoEngine, doc: DocumentId, path: &Path, in_place: bool) -> Result<()> {
    if in_place {
        engine
            .save_file(doc, path)
            .with_context(|| format!("writing {:?}", path))?;
        return Ok(());
    }
    let text = engine.document_text(doc)?;
    print!("{text}");
    if !text.is_empty() && !text.ends_with('\n') {
        println!();
    }
    Ok(())
}
