use std::{
    io::{self, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use chrono::{Days, Local, NaiveTime};
use clap::{Args, Parser, Subcommand, ValueEnum};
use planner::config::{self, PlannerConfig};
use planner::sync::DayView;
use planner::{
    Collection, DateKey, EventContent, FilePlanner, ItemContent, ItemDraft, ItemId, NoteContent,
    OwnerId, PriorityBucket, RemoteStore, ReorderOutcome, TaskContent,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "planner",
    about = "Dated tasks, notes and events ordered by priority",
    version
)]
struct Cli {
    /// Enable debug logging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Read configuration from this file instead of the default location.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Act as this owner.
    #[arg(long, global = true)]
    owner: Option<String>,
    /// Directory holding the collection files.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Collection to operate on.
    #[arg(long, global = true, value_enum, default_value_t = KindArg::Task)]
    kind: KindArg,
    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Task,
    Note,
    Event,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create an item at the end of its bucket, or at an explicit rank.
    Add(AddArgs),

    /// Print items grouped by date and bucket.
    List(ListArgs),

    /// Drop SOURCE onto TARGET within their shared bucket.
    Reorder { source: String, target: String },

    /// Reschedule an item to another date.
    Move { id: String, date: DateKey },

    /// Move an item to another priority bucket.
    Bucket { id: String, bucket: PriorityBucket },

    /// Change an item's content.
    Edit(EditArgs),

    /// Soft-delete an item.
    Delete { id: String },

    /// Bring back a soft-deleted item.
    Restore { id: String },

    /// Permanently remove a soft-deleted item.
    Purge { id: String },

    /// Compact ranks to 1..N.
    Renumber(RenumberArgs),
}

#[derive(Debug, Args)]
struct AddArgs {
    title: String,
    /// Scheduled date (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    date: Option<DateKey>,
    /// Priority bucket. Defaults to the configured bucket.
    #[arg(long)]
    bucket: Option<PriorityBucket>,
    #[arg(long)]
    rank: Option<u32>,
    #[command(flatten)]
    fields: FieldArgs,
}

#[derive(Debug, Args)]
struct ListArgs {
    /// First date to list. Defaults to today.
    #[arg(long)]
    date: Option<DateKey>,
    /// Number of consecutive days to list.
    #[arg(long, default_value_t = 1)]
    days: u64,
    /// Emit the collection view as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct EditArgs {
    id: String,
    #[arg(long)]
    title: Option<String>,
    #[command(flatten)]
    fields: FieldArgs,
}

#[derive(Debug, Args)]
struct RenumberArgs {
    #[arg(long)]
    date: Option<DateKey>,
    /// Only this bucket. Defaults to every bucket on the date.
    #[arg(long)]
    bucket: Option<PriorityBucket>,
}

/// Content fields; each applies only to the kinds that carry it.
#[derive(Debug, Default, Args)]
struct FieldArgs {
    /// Task completion.
    #[arg(long)]
    done: Option<bool>,
    /// Task notes.
    #[arg(long)]
    notes: Option<String>,
    /// Note body.
    #[arg(long)]
    body: Option<String>,
    /// Event start (HH:MM).
    #[arg(long)]
    start: Option<NaiveTime>,
    /// Event end (HH:MM).
    #[arg(long)]
    end: Option<NaiveTime>,
    /// Event location.
    #[arg(long)]
    location: Option<String>,
}

/// Command-line construction and display of one content type.
trait CliContent: ItemContent {
    fn create(title: String, fields: &FieldArgs) -> Self;
    fn edit(&mut self, title: Option<&str>, fields: &FieldArgs);
    fn describe(&self) -> String;
}

impl CliContent for TaskContent {
    fn create(title: String, fields: &FieldArgs) -> Self {
        let mut task = TaskContent::new(title);
        task.edit(None, fields);
        task
    }

    fn edit(&mut self, title: Option<&str>, fields: &FieldArgs) {
        if let Some(title) = title {
            self.title = title.to_string();
        }
        if let Some(done) = fields.done {
            self.done = done;
        }
        if let Some(notes) = &fields.notes {
            self.notes = Some(notes.clone()).filter(|n| !n.is_empty());
        }
    }

    fn describe(&self) -> String {
        let mark = if self.done { "[x]" } else { "[ ]" };
        format!("{mark} {}", self.title)
    }
}

impl CliContent for NoteContent {
    fn create(title: String, fields: &FieldArgs) -> Self {
        NoteContent::new(title, fields.body.clone().unwrap_or_default())
    }

    fn edit(&mut self, title: Option<&str>, fields: &FieldArgs) {
        if let Some(title) = title {
            self.title = title.to_string();
        }
        if let Some(body) = &fields.body {
            self.body = body.clone();
        }
    }

    fn describe(&self) -> String {
        match self.body.lines().next() {
            Some(first) if !first.is_empty() => format!("{}: {first}", self.title),
            _ => self.title.clone(),
        }
    }
}

impl CliContent for EventContent {
    fn create(title: String, fields: &FieldArgs) -> Self {
        let mut event = EventContent::new(title);
        event.edit(None, fields);
        event
    }

    fn edit(&mut self, title: Option<&str>, fields: &FieldArgs) {
        if let Some(title) = title {
            self.title = title.to_string();
        }
        if fields.start.is_some() {
            self.start = fields.start;
        }
        if fields.end.is_some() {
            self.end = fields.end;
        }
        if let Some(location) = &fields.location {
            self.location = Some(location.clone()).filter(|l| !l.is_empty());
        }
    }

    fn describe(&self) -> String {
        let when = match (self.start, self.end) {
            (Some(start), Some(end)) => format!("{}-{} ", start.format("%H:%M"), end.format("%H:%M")),
            (Some(start), None) => format!("{} ", start.format("%H:%M")),
            _ => String::new(),
        };
        let place = self
            .location
            .as_deref()
            .map(|l| format!(" @ {l}"))
            .unwrap_or_default();
        format!("{when}{}{place}", self.title)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    init_tracing(cli.verbose, &config.logging.level);
    tracing::debug!(owner = %config.owner, data_dir = %config.data_dir.display(), "resolved configuration");

    let mut planner = FilePlanner::open(&config);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let bucket = config.default_bucket;
    match cli.kind {
        KindArg::Task => execute(&mut planner.tasks, cli.command, bucket, &mut out),
        KindArg::Note => execute(&mut planner.notes, cli.command, bucket, &mut out),
        KindArg::Event => execute(&mut planner.events, cli.command, bucket, &mut out),
    }
}

fn resolve_config(cli: &Cli) -> Result<PlannerConfig> {
    let mut config = config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(owner) = &cli.owner {
        config.owner = OwnerId::new(owner.clone());
    }
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

fn init_tracing(verbose: bool, level: &str) {
    let filter = if verbose {
        EnvFilter::new("planner=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_directive(level)))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// A bare level applies to this crate only; full directives pass through.
fn log_directive(level: &str) -> String {
    if level.contains(['=', ',']) {
        level.to_string()
    } else {
        format!("planner={level}")
    }
}

fn today() -> DateKey {
    DateKey::from(Local::now().date_naive())
}

fn execute<C, R>(
    collection: &mut Collection<C, R>,
    command: Command,
    default_bucket: PriorityBucket,
    out: &mut dyn Write,
) -> Result<()>
where
    C: CliContent,
    R: RemoteStore<C>,
{
    let kind = C::KIND.singular();
    match command {
        Command::Add(AddArgs {
            title,
            date,
            bucket,
            rank,
            fields,
        }) => {
            let date = date.unwrap_or_else(today);
            collection
                .fetch_date(date)
                .with_context(|| format!("loading {kind}s for {date}"))?;
            let mut draft = ItemDraft::new(C::create(title, &fields))
                .on(date)
                .in_bucket(bucket.unwrap_or(default_bucket));
            if let Some(rank) = rank {
                draft = draft.at_rank(rank);
            }
            let id = collection
                .create_item(draft)
                .with_context(|| format!("creating {kind}"))?;
            writeln!(out, "{id}")?;
        }
        Command::List(ListArgs { date, days, json }) => {
            let first = date.unwrap_or_else(today);
            let mut dates = Vec::new();
            for offset in 0..days.max(1) {
                let Some(day) = first.date().checked_add_days(Days::new(offset)) else {
                    break;
                };
                let day = DateKey::from(day);
                collection
                    .fetch_date(day)
                    .with_context(|| format!("loading {kind}s for {day}"))?;
                dates.push(day);
            }
            if json {
                serde_json::to_writer_pretty(&mut *out, &collection.view())?;
                writeln!(out)?;
            } else {
                for day in dates {
                    print_day(out, &collection.day_view(day))?;
                }
            }
        }
        Command::Reorder { source, target } => {
            let (source, target) = (ItemId::new(source), ItemId::new(target));
            let date = load(collection, &source)?;
            load(collection, &target)?;
            collection
                .fetch_date(date)
                .with_context(|| format!("loading {kind}s for {date}"))?;
            let outcome = collection
                .reorder_item(&source, &target)
                .with_context(|| format!("reordering {source} onto {target}"))?;
            let message = match outcome {
                ReorderOutcome::Moved => "moved",
                ReorderOutcome::Unchanged => "unchanged",
                ReorderOutcome::CrossBucket => "ignored: items are in different buckets",
                ReorderOutcome::UnknownItem => "ignored: items are not on the same date",
            };
            writeln!(out, "{message}")?;
        }
        Command::Move { id, date } => {
            let id = ItemId::new(id);
            load(collection, &id)?;
            collection
                .fetch_date(date)
                .with_context(|| format!("loading {kind}s for {date}"))?;
            collection
                .move_item_date(&id, date)
                .with_context(|| format!("moving {id} to {date}"))?;
        }
        Command::Bucket { id, bucket } => {
            let id = ItemId::new(id);
            let date = load(collection, &id)?;
            collection
                .fetch_date(date)
                .with_context(|| format!("loading {kind}s for {date}"))?;
            collection
                .change_bucket(&id, bucket)
                .with_context(|| format!("moving {id} to bucket {bucket}"))?;
        }
        Command::Edit(EditArgs { id, title, fields }) => {
            let id = ItemId::new(id);
            load(collection, &id)?;
            let mut content = collection
                .get(&id)
                .map(|item| item.content.clone())
                .with_context(|| format!("{kind} {id} not found"))?;
            content.edit(title.as_deref(), &fields);
            collection
                .update_item(&id, content)
                .with_context(|| format!("editing {id}"))?;
        }
        Command::Delete { id } => {
            let id = ItemId::new(id);
            load(collection, &id)?;
            collection
                .delete_item(&id)
                .with_context(|| format!("deleting {id}"))?;
        }
        Command::Restore { id } => {
            let id = ItemId::new(id);
            let date = load(collection, &id)?;
            collection
                .fetch_date(date)
                .with_context(|| format!("loading {kind}s for {date}"))?;
            collection
                .restore_item(&id)
                .with_context(|| format!("restoring {id}"))?;
        }
        Command::Purge { id } => {
            let id = ItemId::new(id);
            load(collection, &id)?;
            collection
                .purge_item(&id)
                .with_context(|| format!("purging {id}"))?;
        }
        Command::Renumber(RenumberArgs { date, bucket }) => {
            let date = date.unwrap_or_else(today);
            collection
                .fetch_date(date)
                .with_context(|| format!("loading {kind}s for {date}"))?;
            let buckets = match bucket {
                Some(bucket) => vec![bucket],
                None => PriorityBucket::ALL.to_vec(),
            };
            let mut changed = 0;
            for bucket in buckets {
                changed += collection
                    .renumber_bucket(date, bucket)
                    .with_context(|| format!("renumbering {date}/{bucket}"))?;
            }
            writeln!(out, "{changed} rank(s) changed")?;
        }
    }
    Ok(())
}

/// Load one item and return its scheduled date.
fn load<C, R>(collection: &mut Collection<C, R>, id: &ItemId) -> Result<DateKey>
where
    C: ItemContent,
    R: RemoteStore<C>,
{
    collection
        .load_item(id)
        .with_context(|| format!("loading {} {id}", C::KIND.singular()))?;
    collection
        .get(id)
        .map(|item| item.scheduled_date)
        .with_context(|| format!("{} {id} not found", C::KIND.singular()))
}

fn print_day<C: CliContent>(out: &mut dyn Write, day: &DayView<'_, C>) -> Result<()> {
    writeln!(out, "{}", day.date)?;
    if day.buckets.is_empty() {
        writeln!(out, "  (nothing scheduled)")?;
    }
    for bucket in &day.buckets {
        for item in &bucket.items {
            writeln!(
                out,
                "  [#{}] {:>2}. {}  {}",
                bucket.bucket,
                item.rank,
                item.content.describe(),
                item.id
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use planner::JsonFileRemote;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("planner").chain(args.iter().copied()))
            .expect("parse args")
    }

    fn run<C: CliContent>(
        collection: &mut Collection<C, JsonFileRemote<C>>,
        args: &[&str],
    ) -> String {
        let cli = parse(args);
        let mut out = Vec::new();
        execute(collection, cli.command, PriorityBucket::A, &mut out).expect("execute");
        String::from_utf8(out).expect("utf8")
    }

    #[test]
    fn bare_log_levels_are_scoped_to_the_crate() {
        assert_eq!(log_directive("info"), "planner=info");
        assert_eq!(log_directive("trace"), "planner=trace");
        assert_eq!(log_directive("planner=debug,warn"), "planner=debug,warn");
    }

    #[test]
    fn kind_and_paths_are_global() {
        let cli = parse(&["list", "--kind", "event", "--data-dir", "/tmp/x", "--json"]);
        assert_eq!(cli.kind, KindArg::Event);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/x")));
        assert!(matches!(cli.command, Command::List(ListArgs { json: true, .. })));
    }

    #[test]
    fn bucket_arguments_accept_org_cookies() {
        let cli = parse(&["bucket", "abc", "#C"]);
        assert!(matches!(
            cli.command,
            Command::Bucket {
                bucket: PriorityBucket::C,
                ..
            }
        ));
    }

    #[test]
    fn add_reorder_and_list_round_trip_through_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut tasks: Collection<TaskContent, _> =
            Collection::new(OwnerId::from("me"), JsonFileRemote::<TaskContent>::in_dir(tmp.path()));

        let date = "2025-05-05";
        let first = run(&mut tasks, &["add", "first", "--date", date]);
        run(&mut tasks, &["add", "second", "--date", date]);
        let first = first.trim().to_string();

        // A fresh collection sees only what reached the file.
        let mut fresh: Collection<TaskContent, _> =
            Collection::new(OwnerId::from("me"), JsonFileRemote::<TaskContent>::in_dir(tmp.path()));
        let listing = run(&mut fresh, &["list", "--date", date]);
        assert!(listing.contains("[#A]  1. [ ] first"), "{listing}");
        assert!(listing.contains("[#A]  2. [ ] second"), "{listing}");

        let second = fresh
            .store()
            .ids_on(date.parse().unwrap())
            .iter()
            .find(|id| id.as_str() != first)
            .unwrap()
            .to_string();
        let moved = run(&mut fresh, &["reorder", &first, &second]);
        assert_eq!(moved.trim(), "moved");

        let listing = run(&mut fresh, &["list", "--date", date]);
        assert!(listing.contains("[#A]  1. [ ] second"), "{listing}");
        assert!(listing.contains("[#A]  2. [ ] first"), "{listing}");
    }

    #[test]
    fn edit_merges_fields_into_existing_content() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut events: Collection<EventContent, _> =
            Collection::new(OwnerId::from("me"), JsonFileRemote::<EventContent>::in_dir(tmp.path()));
        let id = run(
            &mut events,
            &["add", "standup", "--date", "2025-05-05", "--start", "09:30"],
        );
        let id = id.trim();
        run(&mut events, &["edit", id, "--end", "09:45", "--location", "room 2"]);

        let item = events.get(&ItemId::from(id)).unwrap();
        assert_eq!(item.content.describe(), "09:30-09:45 standup @ room 2");
    }

    #[test]
    fn delete_restore_and_purge() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut notes: Collection<NoteContent, _> =
            Collection::new(OwnerId::from("me"), JsonFileRemote::<NoteContent>::in_dir(tmp.path()));
        let id = run(&mut notes, &["add", "idea", "--date", "2025-05-05", "--body", "x"]);
        let id = id.trim();

        run(&mut notes, &["delete", id]);
        assert!(notes.get(&ItemId::from(id)).unwrap().is_deleted);
        run(&mut notes, &["restore", id]);
        assert!(notes.get(&ItemId::from(id)).unwrap().is_live());
        run(&mut notes, &["delete", id]);
        run(&mut notes, &["purge", id]);
        assert!(notes.get(&ItemId::from(id)).is_none());
        assert!(notes.remote().fetch_one(notes.owner(), &ItemId::from(id)).is_err());
    }
}
