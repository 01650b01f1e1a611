use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use autolinker_core::cache::{CatalogCache, SqliteCacheStore};
use autolinker_core::config::{AutolinkSettings, load_config};
use autolinker_core::fetch::{CatalogSource, MediaWikiCatalogClient};
use autolinker_core::linker::{AutoLinker, LinkOutcome};
use autolinker_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout,
    normalize_for_display, resolve_paths,
};
use autolinker_core::trigger::{PageContext, VIEW_ACTION, should_add_links};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use similar::TextDiff;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

const HTML_EXTENSIONS: [&str; 2] = ["html", "htm"];

type Linker = AutoLinker<SqliteCacheStore, MediaWikiCatalogClient>;

#[derive(Debug, Parser)]
#[command(
    name = "autolinker",
    version,
    about = "Link titles of another wiki's pages inside rendered HTML"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, action = ArgAction::Count, help = "Raise log level (-v info, -vv debug)")]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create .autolinker/ with a commented config.toml")]
    Init(InitArgs),
    #[command(about = "Add links to an HTML file, a directory of HTML files, or stdin (`-`)")]
    Rewrite(RewriteArgs),
    #[command(about = "Inspect or manage the cached page catalog")]
    Catalog(CatalogArgs),
    #[command(about = "Print resolved settings and paths as JSON")]
    Config,
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config.toml")]
    force: bool,
}

#[derive(Debug, Args)]
struct RewriteArgs {
    #[arg(value_name = "PATH")]
    path: PathBuf,
    #[arg(short, long, value_name = "PATH", help = "Write output here instead of stdout")]
    output: Option<PathBuf>,
    #[arg(long, conflicts_with = "output", help = "Overwrite the input files")]
    in_place: bool,
    #[arg(long, value_name = "CLASS", help = "Only rewrite inside elements with this class")]
    class: Option<String>,
    #[arg(long, default_value = VIEW_ACTION, help = "Page action the HTML was rendered for")]
    action: String,
    #[arg(long = "category", value_name = "NAME", help = "Category of the page (repeatable)")]
    categories: Vec<String>,
    #[arg(long, help = "Print a unified diff of the changes")]
    diff: bool,
}

#[derive(Debug, Args)]
struct CatalogArgs {
    #[command(subcommand)]
    command: CatalogSubcommand,
}

#[derive(Debug, Subcommand)]
enum CatalogSubcommand {
    Show {
        #[arg(long, default_value_t = 20, help = "Number of entries to list")]
        limit: usize,
    },
    Refresh,
    Clear,
}

/// Paths and settings resolved once per invocation.
struct Session {
    paths: ResolvedPaths,
    settings: AutolinkSettings,
}

#[derive(Debug, Default)]
struct RewriteTotals {
    files: usize,
    changed_files: usize,
    links: usize,
}

impl RewriteTotals {
    fn record(&mut self, outcome: &LinkOutcome) {
        self.files += 1;
        if outcome.changed {
            self.changed_files += 1;
        }
        self.links += outcome.replaced;
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Rewrite(args)) => run_rewrite(&runtime, args),
        Some(Commands::Catalog(CatalogArgs { command })) => match command {
            CatalogSubcommand::Show { limit } => run_catalog_show(&runtime, limit),
            CatalogSubcommand::Refresh => run_catalog_refresh(&runtime),
            CatalogSubcommand::Clear => run_catalog_clear(&runtime),
        },
        Some(Commands::Config) => run_config(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, &InitOptions { force: args.force })?;

    println!("Initialized autolinker runtime layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("data_dir: {}", normalize_for_display(&paths.data_dir));
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_rewrite(runtime: &RuntimeOptions, args: RewriteArgs) -> Result<()> {
    let session = load_session(runtime)?;
    let page = PageContext {
        action: args.action.clone(),
        categories: args.categories.clone(),
    };
    let eligible = should_add_links(&session.settings, &page);
    if !eligible {
        tracing::info!(action = %page.action, "Page is not eligible for links; passing HTML through");
    }

    let scope_class = args
        .class
        .clone()
        .or_else(|| session.settings.only_within_class_name.clone());
    let mut linker = open_linker(&session)?.with_scope_class(scope_class);

    if args.path.is_dir() {
        return rewrite_directory(&mut linker, eligible, &args);
    }

    let from_stdin = args.path.as_os_str() == "-";
    if from_stdin && args.in_place {
        bail!("--in-place cannot be used when reading from stdin");
    }
    let input = if from_stdin {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read HTML from stdin")?;
        buffer
    } else {
        fs::read_to_string(&args.path)
            .with_context(|| format!("failed to read {}", args.path.display()))?
    };

    let outcome = link_page(&mut linker, eligible, &input);
    let label = normalize_for_display(&args.path);
    if args.diff {
        print_diff(&label, &input, &outcome.html);
    }

    if args.in_place {
        if outcome.changed {
            write_output(&args.path, &outcome.html)?;
        }
    } else if let Some(output) = args.output.as_deref() {
        write_output(output, &outcome.html)?;
    } else if !args.diff {
        print!("{}", outcome.html);
        return Ok(());
    }

    let mut totals = RewriteTotals::default();
    totals.record(&outcome);
    print_totals(&totals);
    print_diagnostics(runtime, &session.paths);
    Ok(())
}

fn rewrite_directory(linker: &mut Linker, eligible: bool, args: &RewriteArgs) -> Result<()> {
    if !args.in_place && args.output.is_none() && !args.diff {
        bail!("rewriting a directory requires --in-place, --output <DIR> or --diff");
    }

    let root = args.path.as_path();
    let mut totals = RewriteTotals::default();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        let path = entry.path();
        if !entry.file_type().is_file() || !has_html_extension(path) {
            continue;
        }

        let input = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let outcome = link_page(linker, eligible, &input);
        totals.record(&outcome);
        tracing::debug!(path = %path.display(), replaced = outcome.replaced, "Rewrote page");

        if args.diff {
            print_diff(&normalize_for_display(path), &input, &outcome.html);
        }
        if args.in_place {
            if outcome.changed {
                write_output(path, &outcome.html)?;
            }
        } else if let Some(output_root) = args.output.as_deref() {
            let relative = path.strip_prefix(root).with_context(|| {
                format!(
                    "failed to strip {} from {}",
                    root.display(),
                    path.display()
                )
            })?;
            write_output(&output_root.join(relative), &outcome.html)?;
        }
    }

    print_totals(&totals);
    Ok(())
}

fn link_page(linker: &mut Linker, eligible: bool, html: &str) -> LinkOutcome {
    if !eligible {
        return LinkOutcome {
            html: html.to_string(),
            changed: false,
            replaced: 0,
        };
    }
    linker.add_links(html)
}

fn run_catalog_show(runtime: &RuntimeOptions, limit: usize) -> Result<()> {
    let session = load_session(runtime)?;
    let mut linker = open_linker(&session)?;
    let catalog = linker.cache_mut().get_catalog();
    let record = linker.cache().peek();

    println!("catalog show");
    println!("api_url: {}", session.settings.api_url.as_deref().unwrap_or("<none>"));
    println!("cache_key: {}", linker.cache().key());
    match record {
        Some(record) => {
            println!("fetched_at_unix: {}", record.fetched_at_unix);
            println!("expires_at_unix: {}", record.expires_at_unix);
            println!("negative: {}", format_flag(record.is_negative()));
        }
        None => println!("cache: <not stored>"),
    }
    println!("titles: {}", catalog.len());
    println!("link_targets: {}", linker.targets().len());
    for (title, url) in catalog.iter().take(limit) {
        println!("entry: {title}\t{url}");
    }
    if catalog.len() > limit {
        println!("more: {}", catalog.len() - limit);
    }
    print_diagnostics(runtime, &session.paths);
    Ok(())
}

fn run_catalog_refresh(runtime: &RuntimeOptions) -> Result<()> {
    let session = load_session(runtime)?;
    if !session.settings.is_enabled() {
        bail!(
            "no remote API configured; set [autolink].api_url in {} or AUTOLINK_API_URL",
            normalize_for_display(&session.paths.config_path)
        );
    }
    let mut cache = open_cache(&session)?;
    let catalog = cache.refresh();

    println!("catalog refresh");
    println!("cache_key: {}", cache.key());
    println!("titles: {}", catalog.len());
    println!("requests: {}", cache.fetcher().source().request_count());
    print_diagnostics(runtime, &session.paths);
    Ok(())
}

fn run_catalog_clear(runtime: &RuntimeOptions) -> Result<()> {
    let session = load_session(runtime)?;
    let mut cache = open_cache(&session)?;
    cache.invalidate();

    println!("catalog clear");
    println!("cache_key: {}", cache.key());
    print_diagnostics(runtime, &session.paths);
    Ok(())
}

fn run_config(runtime: &RuntimeOptions) -> Result<()> {
    let session = load_session(runtime)?;
    let paths = &session.paths;
    let report = serde_json::json!({
        "settings": session.settings,
        "paths": {
            "project_root": normalize_for_display(&paths.project_root),
            "config_path": normalize_for_display(&paths.config_path),
            "config_source": paths.config_source.as_str(),
            "db_path": normalize_for_display(&paths.db_path),
            "data_source": paths.data_source.as_str(),
        },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn open_linker(session: &Session) -> Result<Linker> {
    let store = SqliteCacheStore::open(&session.paths.db_path)?;
    AutoLinker::from_settings(&session.settings, store)
}

fn open_cache(
    session: &Session,
) -> Result<CatalogCache<SqliteCacheStore, MediaWikiCatalogClient>> {
    let linker = open_linker(session)?;
    Ok(linker.into_cache())
}

fn load_session(runtime: &RuntimeOptions) -> Result<Session> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let settings = config.resolve();
    tracing::debug!(
        config = %normalize_for_display(&paths.config_path),
        enabled = settings.is_enabled(),
        "Loaded settings"
    );
    Ok(Session { paths, settings })
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn write_output(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
}

fn print_diff(label: &str, before: &str, after: &str) {
    if before == after {
        return;
    }
    let text_diff = TextDiff::from_lines(before, after);
    let mut unified = text_diff.unified_diff();
    unified
        .context_radius(3)
        .header(&format!("a/{label}"), &format!("b/{label}"));
    print!("{unified}");
}

fn print_totals(totals: &RewriteTotals) {
    println!("files: {}", totals.files);
    println!("changed_files: {}", totals.changed_files);
    println!("links: {}", totals.links);
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn has_html_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| {
            HTML_EXTENSIONS
                .iter()
                .any(|allowed| extension.eq_ignore_ascii_case(allowed))
        })
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
