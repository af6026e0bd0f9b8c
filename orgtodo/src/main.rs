use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{Duration, Local};
use clap::{Args, Parser, Subcommand, ValueEnum};
use orgtodo::agenda::{self, AgendaWhenKind};
use orgtodo::core::{Document, ItemId};
use orgtodo::directive::{PlanningKind, parse_date_input};
use orgtodo::outline::ReorderStatus;
use orgtodo::storage::save_as;
use orgtodo::{format_document, load, save};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILE: &str = "todo.org";

#[derive(Debug, Parser)]
#[command(
    name = "orgtodo",
    about = "Outline and TODO manager for plain-text Org files",
    version
)]
struct Cli {
    /// Org file to operate on. Defaults to ./todo.org.
    #[arg(short, long, global = true, env = "ORGTODO_FILE")]
    file: Option<PathBuf>,
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List visible items with their index, state and planning dates.
    List(ListArgs),

    /// Print the parsed document structure.
    Show(ShowArgs),

    /// Re-emit the file, preserving everything that was not edited.
    Format(FormatArgs),

    /// Capture a new TODO at the top of the file.
    Capture(TitleArgs),

    /// Add a TODO sub-task under the item at INDEX.
    Add(AddArgs),

    /// Cycle the state of the item at INDEX.
    Cycle(CycleArgs),

    /// Start the clock on the item at INDEX.
    ClockIn(IndexArgs),

    /// Stop the running clock on the item at INDEX.
    ClockOut(IndexArgs),

    /// Delete the item at INDEX together with its subtree.
    Delete(IndexArgs),

    /// Move the item at INDEX up or down among its siblings.
    Move(MoveArgs),

    /// Set or clear the deadline of the item at INDEX.
    Deadline(PlanningArgs),

    /// Set or clear the scheduled date of the item at INDEX.
    Schedule(PlanningArgs),

    /// Show scheduled and deadline items for the coming days.
    Agenda(AgendaArgs),
}

#[derive(Debug, Args)]
struct ListArgs {
    /// Also print each item's notes (logbook and planning lines hidden).
    #[arg(long)]
    notes: bool,
}

#[derive(Debug, Args)]
struct ShowArgs {
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct TitleArgs {
    /// Title words; joined with single spaces.
    #[arg(required = true)]
    title: Vec<String>,
}

#[derive(Debug, Args)]
struct IndexArgs {
    /// Position in the visible item list (see `list`).
    index: usize,
}

#[derive(Debug, Args)]
struct AddArgs {
    /// Position of the parent in the visible item list.
    index: usize,
    #[arg(required = true)]
    title: Vec<String>,
}

#[derive(Debug, Args)]
struct CycleArgs {
    index: usize,
    /// Cycle backwards (DONE -> BLOCK -> ...).
    #[arg(long)]
    back: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Direction {
    Up,
    Down,
}

#[derive(Debug, Args)]
struct MoveArgs {
    index: usize,
    #[arg(value_enum)]
    direction: Direction,
}

#[derive(Debug, Args)]
struct PlanningArgs {
    index: usize,
    /// YYYY-MM-DD, YYYY/MM/DD, MM/DD/YYYY or +N days. Omit to clear.
    date: Option<String>,
}

#[derive(Debug, Args)]
struct AgendaArgs {
    /// Window size in days, counted from today.
    #[arg(long, default_value_t = 7)]
    days: i64,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let path = resolve_file(cli.file)?;
    tracing::debug!(path = %path.display(), "using outline file");
    run(cli.command, &path)
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "orgtodo=debug" } else { "orgtodo=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn resolve_file(file: Option<PathBuf>) -> Result<PathBuf> {
    match file {
        Some(path) => Ok(path),
        None => Ok(std::env::current_dir()
            .context("resolving current directory")?
            .join(DEFAULT_FILE)),
    }
}

fn run(command: Commands, path: &Path) -> Result<()> {
    match command {
        Commands::List(args) => handle_list(args, path),
        Commands::Show(args) => handle_show(args, path),
        Commands::Format(args) => handle_format(args, path),
        Commands::Agenda(args) => handle_agenda(args, path),
        edit => handle_edit(edit, path),
    }
}

fn load_doc(path: &Path) -> Result<Document> {
    load(path).with_context(|| format!("loading {:?}", path))
}

fn handle_list(args: ListArgs, path: &Path) -> Result<()> {
    let doc = load_doc(path)?;
    let visible = doc.flatten_visible();
    if visible.is_empty() {
        println!("(no items)");
        return Ok(());
    }
    for (idx, id) in visible.iter().enumerate() {
        let Some(item) = doc.item(*id) else {
            continue;
        };
        let mut line = format!(
            "{idx:>3}  {}{}",
            "  ".repeat(item.level.saturating_sub(1)),
            if item.folded && !item.children().is_empty() {
                "+ "
            } else {
                ""
            }
        );
        if let Some(keyword) = item.state.keyword() {
            line.push_str(keyword);
            line.push(' ');
        }
        line.push_str(&item.title);
        if let Some(ts) = item.scheduled {
            line.push_str(&format!("  [S: {ts}]"));
        }
        if let Some(ts) = item.deadline {
            line.push_str(&format!("  [D: {ts}]"));
        }
        if item.is_clocked_in() {
            line.push_str(&format!(
                "  [clocked in {}]",
                format_duration(item.current_open_duration())
            ));
        } else if !item.clock_entries.is_empty() {
            line.push_str(&format!("  [{}]", format_duration(item.total_duration())));
        }
        println!("{line}");
        if args.notes {
            for note in item.display_notes() {
                println!("       {note}");
            }
        }
    }
    Ok(())
}

fn handle_show(args: ShowArgs, path: &Path) -> Result<()> {
    let doc = load_doc(path)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        println!("{:#?}", doc);
    }
    Ok(())
}

fn handle_format(args: FormatArgs, path: &Path) -> Result<()> {
    let doc = load_doc(path)?;
    if args.in_place {
        save_as(&doc, path).with_context(|| format!("writing {:?}", path))?;
    } else {
        print!("{}", format_document(&doc));
    }
    Ok(())
}

fn handle_agenda(args: AgendaArgs, path: &Path) -> Result<()> {
    let doc = load_doc(path)?;
    let today = Local::now().date_naive();
    let entries = agenda::project(&doc, today, args.days);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("Nothing planned in the next {} days.", args.days);
        return Ok(());
    }
    for entry in entries {
        let kind = match entry.kind {
            AgendaWhenKind::Scheduled => "Scheduled",
            AgendaWhenKind::Deadline => "Deadline ",
        };
        let overdue = if entry.when.date < today { " (overdue)" } else { "" };
        let state = entry
            .state
            .keyword()
            .map(|kw| format!("{kw} "))
            .unwrap_or_default();
        println!("{}  {kind}  {state}{}{overdue}", entry.when, entry.title);
    }
    Ok(())
}

/// Load, apply one edit, save. Refused edits are reported as errors and leave the file alone.
fn handle_edit(command: Commands, path: &Path) -> Result<()> {
    let mut doc = load_doc(path)?;
    let message = apply_edit(&mut doc, command)?;
    save(&doc).with_context(|| format!("saving {:?}", path))?;
    println!("{message}");
    Ok(())
}

fn apply_edit(doc: &mut Document, command: Commands) -> Result<String> {
    match command {
        Commands::Capture(args) => {
            let title = args.title.join(" ");
            doc.capture(title.clone());
            Ok(format!("Captured: {title}"))
        }
        Commands::Add(args) => {
            let parent = item_at(doc, args.index)?;
            let title = args.title.join(" ");
            doc.add_sub_task(parent, title.clone())
                .ok_or_else(|| anyhow!("parent item vanished"))?;
            Ok(format!("Added sub-task: {title}"))
        }
        Commands::Cycle(args) => {
            let id = item_at(doc, args.index)?;
            let item = item_mut(doc, id)?;
            if args.back {
                item.cycle_state_backward();
            } else {
                item.cycle_state_forward();
            }
            Ok(format!(
                "{} -> {}",
                item.title,
                item.state.keyword().unwrap_or("(none)")
            ))
        }
        Commands::ClockIn(args) => {
            let id = item_at(doc, args.index)?;
            let item = item_mut(doc, id)?;
            if !item.clock_in() {
                anyhow::bail!("{:?} is already clocked in", item.title);
            }
            Ok(format!("Clocked in: {}", item.title))
        }
        Commands::ClockOut(args) => {
            let id = item_at(doc, args.index)?;
            let item = item_mut(doc, id)?;
            let worked = item.current_open_duration();
            if !item.clock_out() {
                anyhow::bail!("{:?} is not clocked in", item.title);
            }
            Ok(format!(
                "Clocked out: {} ({})",
                item.title,
                format_duration(worked)
            ))
        }
        Commands::Delete(args) => {
            let id = item_at(doc, args.index)?;
            let title = item_mut(doc, id)?.title.clone();
            if !doc.delete(id) {
                anyhow::bail!("item {} is no longer in the tree", args.index);
            }
            Ok(format!("Deleted: {title}"))
        }
        Commands::Move(args) => {
            let id = item_at(doc, args.index)?;
            let status = match args.direction {
                Direction::Up => doc.move_up(id),
                Direction::Down => doc.move_down(id),
            };
            match status {
                ReorderStatus::Swapped => Ok(format!("Moved item {} {:?}", args.index, args.direction)),
                ReorderStatus::AtEdge => anyhow::bail!("item {} cannot move further", args.index),
                ReorderStatus::LevelMismatch | ReorderStatus::NotAdjacent => {
                    anyhow::bail!("item {} has no sibling to swap with", args.index)
                }
                ReorderStatus::NotFound => anyhow::bail!("item {} not found", args.index),
            }
        }
        Commands::Deadline(args) => set_planning(doc, PlanningKind::Deadline, args),
        Commands::Schedule(args) => set_planning(doc, PlanningKind::Scheduled, args),
        Commands::List(_)
        | Commands::Show(_)
        | Commands::Format(_)
        | Commands::Agenda(_) => anyhow::bail!("not an editing command"),
    }
}

fn set_planning(doc: &mut Document, kind: PlanningKind, args: PlanningArgs) -> Result<String> {
    let id = item_at(doc, args.index)?;
    let value = match args.date.as_deref() {
        Some(input) => Some(parse_date_input(input, Local::now().date_naive())?),
        None => None,
    };
    let item = item_mut(doc, id)?;
    item.set_planning(kind, value);
    let label = kind.marker().trim_end_matches(':');
    Ok(match value {
        Some(ts) => format!("{label} set to {ts}: {}", item.title),
        None => format!("{label} cleared: {}", item.title),
    })
}

fn item_at(doc: &Document, index: usize) -> Result<ItemId> {
    let visible = doc.flatten_visible();
    visible.get(index).copied().ok_or_else(|| {
        anyhow!(
            "no item at index {index} ({} visible items)",
            visible.len()
        )
    })
}

fn item_mut(doc: &mut Document, id: ItemId) -> Result<&mut orgtodo::core::Item> {
    doc.item_mut(id)
        .ok_or_else(|| anyhow!("item {:?} not found", id))
}

fn format_duration(d: Duration) -> String {
    let minutes = d.num_minutes().max(0);
    format!("{}:{:02}", minutes / 60, minutes % 60)
}
