use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feedpack::catalogue::{NewSubscription, SubscriptionPatch};
use feedpack::commands;
use feedpack::config::Config;
use feedpack::coordinator::Coordinator;
use feedpack::storage::Backend;

/// Fetch feeds and pack their articles into compressed chunks.
#[derive(Parser, Debug)]
#[command(name = "feedpack", version)]
#[command(about = "Feed fetcher and article packer", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "feedpack.toml")]
    config: PathBuf,

    /// Output location: a directory or s3://bucket/prefix
    #[arg(short, long, global = true)]
    output: Option<String>,

    /// Concurrent downloads
    #[arg(short, long, global = true)]
    jobs: Option<usize>,

    /// Target chunk size in KB
    #[arg(short = 's', long, global = true)]
    package_size: Option<usize>,

    /// Largest accepted feed in KB
    #[arg(short = 'm', long, global = true)]
    max_download: Option<usize>,

    /// Take the catalogue lock even if it is held
    #[arg(long, global = true)]
    force: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add a subscription
    Add {
        #[arg(long)]
        title: String,
        #[arg(long)]
        url: String,
        /// Transform program, may be repeated
        #[arg(long = "program")]
        programs: Vec<String>,
        #[arg(long)]
        tag: Option<String>,
    },
    /// Update a subscription
    Upd(UpdateArgs),
    /// Remove subscriptions
    Rm {
        #[arg(required = true)]
        ids: Vec<u64>,
    },
    /// List subscriptions
    Ls {
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },
    /// Fetch every subscription, or those of one tag
    Fetch {
        #[arg(long)]
        tag: Option<String>,
    },
    /// Manage tags
    #[command(subcommand)]
    Tag(TagCommand),
    /// Manage external sources
    #[command(subcommand)]
    Extern(ExternCommand),
    /// Show a subscription's stored articles, newest first
    History {
        id: u64,
        /// Chunks to read
        #[arg(long, default_value_t = 1)]
        pages: usize,
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },
}

#[derive(Args, Debug)]
struct UpdateArgs {
    id: u64,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    url: Option<String>,
    /// Replace the transform programs, may be repeated
    #[arg(long = "program")]
    programs: Vec<String>,
    /// Remove every transform program
    #[arg(long, conflicts_with = "programs")]
    clear_programs: bool,
    /// Move to this tag
    #[arg(long)]
    tag: Option<String>,
    /// Move out of any tag
    #[arg(long, conflicts_with = "tag")]
    no_tag: bool,
}

impl UpdateArgs {
    fn into_patch(self) -> SubscriptionPatch {
        let programs = if self.clear_programs {
            Some(Vec::new())
        } else if self.programs.is_empty() {
            None
        } else {
            Some(self.programs)
        };
        let tag = if self.no_tag { Some(None) } else { self.tag.map(Some) };

        SubscriptionPatch {
            title: self.title,
            url: self.url,
            programs,
            tag,
        }
    }
}

#[derive(Subcommand, Debug)]
enum TagCommand {
    Add { name: String },
    Rename { id: u64, name: String },
    Rm {
        #[arg(required = true)]
        ids: Vec<u64>,
    },
    Ls,
}

#[derive(Subcommand, Debug)]
enum ExternCommand {
    Add { name: String, url: String },
    Upd {
        id: u64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        url: Option<String>,
    },
    Rm {
        #[arg(required = true)]
        ids: Vec<u64>,
    },
    Ls,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Format {
    Text,
    Json,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load_or_default(&cli.config)?;
    config.apply_env()?;

    if let Some(output) = &cli.output {
        config.output = output.clone();
    }
    if let Some(jobs) = cli.jobs {
        config.jobs = jobs;
    }
    if let Some(size) = cli.package_size {
        config.package_size_kb = size;
    }
    if let Some(size) = cli.max_download {
        config.max_download_kb = size;
    }
    config.force |= cli.force;

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_filter = if cli.debug { "feedpack=debug" } else { "feedpack=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&cli)?;
    let storage = Backend::open(&config.output)?;
    info!("Using storage at {}", storage.describe());
    let force = config.force;

    match cli.command {
        Command::Add {
            title,
            url,
            programs,
            tag,
        } => {
            let id = commands::add_subscription(
                &storage,
                force,
                NewSubscription {
                    title,
                    url,
                    programs,
                    tag,
                },
            )
            .await?;
            println!("{id}");
        }
        Command::Upd(args) => {
            let id = args.id;
            commands::update_subscription(&storage, force, id, args.into_patch()).await?;
        }
        Command::Rm { ids } => {
            commands::remove_subscriptions(&storage, force, &ids).await?;
        }
        Command::Ls { format } => {
            let listing = commands::list_subscriptions(&storage).await?;
            match format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&listing)?),
                Format::Text => {
                    for sub in listing {
                        let tag = sub.tag.map(|t| format!(" [{t}]")).unwrap_or_default();
                        println!("{:>5}  {}{}  {}", sub.id, sub.title, tag, sub.url);
                        if let Some(error) = sub.error {
                            println!("       error: {error}");
                        }
                    }
                }
            }
        }
        Command::Fetch { tag } => {
            let coordinator = Coordinator::new(&config)?;
            let report =
                commands::fetch(&storage, &config, &coordinator, tag.as_deref()).await?;
            println!(
                "fetched {} subscriptions, {} failed, {} new articles",
                report.fetched, report.failed, report.new_entries
            );
        }
        Command::Tag(command) => match command {
            TagCommand::Add { name } => {
                let id = commands::add_tag(&storage, force, &name).await?;
                println!("{id}");
            }
            TagCommand::Rename { id, name } => {
                commands::rename_tag(&storage, force, id, &name).await?;
            }
            TagCommand::Rm { ids } => {
                commands::remove_tags(&storage, force, &ids).await?;
            }
            TagCommand::Ls => {
                for tag in commands::list_tags(&storage).await? {
                    println!("{:>5}  {} ({})", tag.id, tag.name, tag.subscriptions.len());
                }
            }
        },
        Command::Extern(command) => match command {
            ExternCommand::Add { name, url } => {
                let id = commands::add_extern(&storage, force, &name, &url).await?;
                println!("{id}");
            }
            ExternCommand::Upd { id, name, url } => {
                commands::update_extern(&storage, force, id, name.as_deref(), url.as_deref())
                    .await?;
            }
            ExternCommand::Rm { ids } => {
                commands::remove_externs(&storage, force, &ids).await?;
            }
            ExternCommand::Ls => {
                for ext in commands::list_externs(&storage).await? {
                    println!("{:>5}  {}  {}", ext.id, ext.name, ext.url);
                }
            }
        },
        Command::History { id, pages, format } => {
            let pages = commands::history(&storage, id, pages).await?;
            for page in pages {
                match format {
                    Format::Json => {
                        for entry in &page.entries {
                            println!("{}", serde_json::to_string(entry)?);
                        }
                    }
                    Format::Text => {
                        println!("-- chunk {}", page.chunk);
                        for entry in &page.entries {
                            println!("{}  {}  {}", entry.published, entry.title, entry.link);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
