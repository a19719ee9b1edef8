use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use btc_sync::app::{App, Stores};
use btc_sync::config::{ConfigLoader, ResolvedConfig};
use btc_sync::domain::{BaseKey, InstanceKey, ResourcePointer};
use btc_sync::error::{BtcError, ErrorClass};
use btc_sync::output::{JsonOutput, OutputMode};
use btc_sync::package::ExportOptions;
use btc_sync::remote::{Door43HttpClient, RetryPolicy};
use btc_sync::store::StoreLayout;

#[derive(Parser)]
#[command(name = "btc")]
#[command(about = "Translation resource collections: workspace panels, portable packages and offline content")]
#[command(version, author)]
struct Cli {
    /// Suppress progress output on stderr.
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Config file (defaults to ./btc.json when present).
    #[arg(long, global = true)]
    config: Option<String>,

    /// Overrides the store root from the config.
    #[arg(long, global = true)]
    store_root: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Inspect or seed the workspace")]
    Workspace(WorkspaceArgs),
    #[command(about = "Arrange resources in panels")]
    Panel(PanelArgs),
    #[command(about = "Add, remove or resolve resources")]
    Resource(ResourceArgs),
    #[command(about = "Export or import collection packages")]
    Collection(CollectionArgs),
    #[command(about = "Download resource content for offline use")]
    Content(ContentArgs),
}

#[derive(Args)]
struct WorkspaceArgs {
    #[command(subcommand)]
    command: WorkspaceCommand,
}

#[derive(Subcommand)]
enum WorkspaceCommand {
    #[command(about = "Print the current workspace")]
    Show,
    #[command(about = "Add every resource listed in the config")]
    Seed,
}

#[derive(Args)]
struct PanelArgs {
    #[command(subcommand)]
    command: PanelCommand,
}

#[derive(Subcommand)]
enum PanelCommand {
    #[command(about = "Create an empty panel")]
    Create { id: String, name: Option<String> },
    #[command(about = "Place an instance key in a panel")]
    Assign {
        key: String,
        panel: String,
        #[arg(long)]
        index: Option<usize>,
    },
    #[command(about = "Remove an instance key from a panel")]
    Remove { key: String, panel: String },
    #[command(about = "Move an instance key between panels")]
    Move {
        key: String,
        from: String,
        to: String,
        #[arg(long)]
        index: Option<usize>,
    },
    #[command(about = "Move an instance key within its panel")]
    Reorder {
        key: String,
        panel: String,
        index: usize,
    },
    #[command(about = "Select the active resource of a panel")]
    Activate { panel: String, index: usize },
}

#[derive(Args)]
struct ResourceArgs {
    #[command(subcommand)]
    command: ResourceCommand,
}

#[derive(Subcommand)]
enum ResourceCommand {
    #[command(about = "Resolve a resource and add it to the workspace")]
    Add {
        /// `owner/language/id[@server]`
        pointer: String,
        #[arg(long)]
        panel: Option<String>,
        /// Skip the automatic content download.
        #[arg(long)]
        no_fetch: bool,
    },
    #[command(about = "Remove a resource from the resource table")]
    Remove { key: String },
    #[command(about = "Resolve metadata without touching the workspace")]
    Resolve { pointer: String },
}

#[derive(Args)]
struct CollectionArgs {
    #[command(subcommand)]
    command: CollectionCommand,
}

#[derive(Subcommand)]
enum CollectionCommand {
    #[command(about = "Write the workspace as a collection package")]
    Export {
        output: Utf8PathBuf,
        #[arg(long)]
        include_content: bool,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    #[command(about = "Replace the workspace with a collection package")]
    Import {
        input: Utf8PathBuf,
        #[arg(long)]
        no_fetch: bool,
    },
}

#[derive(Args)]
struct ContentArgs {
    #[command(subcommand)]
    command: ContentCommand,
}

#[derive(Subcommand)]
enum ContentCommand {
    #[command(about = "Download missing content (all table resources by default)")]
    Fetch {
        resources: Vec<String>,
        /// Re-download units that are already cached.
        #[arg(long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<BtcError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &BtcError) -> u8 {
    match error.class() {
        ErrorClass::Format | ErrorClass::Input => 2,
        ErrorClass::Network => 3,
        ErrorClass::EnvironmentRestriction => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Some(root) = cli.store_root {
        config.store_root = Some(root);
    }
    match &cli.command {
        Commands::Resource(ResourceArgs {
            command: ResourceCommand::Add { no_fetch: true, .. },
        })
        | Commands::Collection(CollectionArgs {
            command: CollectionCommand::Import { no_fetch: true, .. },
        }) => config.auto_fetch = false,
        _ => {}
    }

    let mut app = build_app(config)?;
    let sink = output_mode.sink();

    match cli.command {
        Commands::Workspace(args) => match args.command {
            WorkspaceCommand::Show => JsonOutput::print_workspace(app.workspace()).into_diagnostic(),
            WorkspaceCommand::Seed => {
                let result = app.seed_from_config(sink)?;
                app.wait_for_downloads(sink)?;
                JsonOutput::print_seed(&result).into_diagnostic()
            }
        },
        Commands::Panel(args) => {
            let result = match args.command {
                PanelCommand::Create { id, name } => {
                    let name = name.unwrap_or_else(|| id.clone());
                    app.create_panel(&id, &name)?
                }
                PanelCommand::Assign { key, panel, index } => {
                    app.assign_to_panel(&parse_instance(&key)?, &panel, index)?
                }
                PanelCommand::Remove { key, panel } => {
                    app.remove_from_panel(&parse_instance(&key)?, &panel)?
                }
                PanelCommand::Move {
                    key,
                    from,
                    to,
                    index,
                } => app.move_between_panels(&parse_instance(&key)?, &from, &to, index)?,
                PanelCommand::Reorder { key, panel, index } => {
                    app.reorder_in_panel(&parse_instance(&key)?, &panel, index)?
                }
                PanelCommand::Activate { panel, index } => app.set_active(&panel, index)?,
            };
            JsonOutput::print_panels(&result).into_diagnostic()
        }
        Commands::Resource(args) => match args.command {
            ResourceCommand::Add { pointer, panel, .. } => {
                let pointer = parse_pointer(&pointer, app.config())?;
                let result = app.add_resource(&pointer, panel.as_deref(), sink)?;
                if result.fetch_started {
                    app.wait_for_downloads(sink)?;
                }
                JsonOutput::print_add(&result).into_diagnostic()
            }
            ResourceCommand::Remove { key } => {
                let key: BaseKey = key.parse()?;
                let result = app.remove_resource(&key)?;
                JsonOutput::print_remove(&result).into_diagnostic()
            }
            ResourceCommand::Resolve { pointer } => {
                let pointer = parse_pointer(&pointer, app.config())?;
                let metadata = app.resolve_resource(&pointer, sink)?;
                JsonOutput::print_metadata(&metadata).into_diagnostic()
            }
        },
        Commands::Collection(args) => match args.command {
            CollectionCommand::Export {
                output,
                include_content,
                name,
                description,
            } => {
                let options = ExportOptions {
                    include_content: include_content || app.config().include_content,
                    name,
                    description,
                    scan_batch_size: app.config().scan_batch_size,
                    shard_bytes: app.config().shard_bytes,
                };
                let result = app.export_collection(&output, options, sink)?;
                JsonOutput::print_export(&result).into_diagnostic()
            }
            CollectionCommand::Import { input, .. } => {
                let result = app.import_collection(&input, sink)?;
                if result.fetch_started {
                    app.wait_for_downloads(sink)?;
                }
                JsonOutput::print_import(&result).into_diagnostic()
            }
        },
        Commands::Content(args) => match args.command {
            ContentCommand::Fetch { resources, force } => {
                let skip_existing = force.then_some(false);
                let result = app.download(resources, skip_existing, sink)?;
                JsonOutput::print_download(&result).into_diagnostic()
            }
        },
    }
}

fn build_app(config: ResolvedConfig) -> Result<App<Door43HttpClient>, BtcError> {
    let layout = match &config.store_root {
        Some(root) => StoreLayout::new_with_root(root.clone()),
        None => StoreLayout::new()?,
    };
    let stores = Stores::open(&layout)?;
    let retry = RetryPolicy {
        max_retries: config.max_retries,
        backoff: Duration::from_millis(config.retry_backoff_ms),
    };
    let client = Arc::new(Door43HttpClient::new(&config.server)?.with_retry_policy(retry));
    App::new(config, client, stores)
}

fn parse_pointer(value: &str, config: &ResolvedConfig) -> Result<ResourcePointer, BtcError> {
    let mut pointer: ResourcePointer = value.parse()?;
    if !value.contains('@') {
        pointer.server = config.server.clone();
    }
    Ok(pointer)
}

fn parse_instance(value: &str) -> Result<InstanceKey, BtcError> {
    value.parse()
}
