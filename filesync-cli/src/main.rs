use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use filesync::pool::BufferPool;
use filesync::{ContentHasher, Context, CopyInfo, DiffEngine, EngineConfig, HashAlgorithm, LocalFs, ReadFs, WalkFs};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "filesync")]
#[command(about = "Diff, hash and copy directory trees")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the changes that turn LOWER into UPPER
    Diff {
        lower: PathBuf,
        upper: PathBuf,
        /// Print one JSON object per change
        #[arg(long)]
        json: bool,
    },
    /// Copy SRC under SRC_ROOT to DST under DST_ROOT with cp -a semantics
    Copy {
        src_root: PathBuf,
        src: String,
        dst_root: PathBuf,
        dst: String,
        /// Only copy paths matching this pattern (repeatable)
        #[arg(long = "include")]
        include: Vec<String>,
        /// Skip paths matching this pattern (repeatable)
        #[arg(long = "exclude")]
        exclude: Vec<String>,
        /// Respect .gitignore files in the source root
        #[arg(long)]
        gitignore: bool,
        /// Expand wildcards in SRC
        #[arg(long)]
        wildcards: bool,
        /// Copy the contents of a source directory instead of the directory
        #[arg(long)]
        contents: bool,
        /// Follow a symlink in the last component of SRC
        #[arg(long)]
        follow_links: bool,
        /// Replace existing destination entries of another type
        #[arg(long)]
        replace: bool,
        /// Fixed permission bits, in octal
        #[arg(long)]
        mode: Option<String>,
        /// Ignore extended attributes that cannot be set
        #[arg(long)]
        allow_xattr_errors: bool,
    },
    /// Print the identity hash of every entry under ROOT
    Hash {
        root: PathBuf,
        #[arg(long, value_enum, default_value_t = Algorithm::Sha256)]
        algorithm: Algorithm,
        /// Mix regular file content into the hash
        #[arg(long)]
        content: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Algorithm {
    Sha256,
    Blake3,
}

impl From<Algorithm> for HashAlgorithm {
    fn from(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Sha256 => HashAlgorithm::Sha256,
            Algorithm::Blake3 => HashAlgorithm::Blake3,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            EngineConfig::from_file(path)
                .await
                .with_context(|| format!("failed to load {}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    if !BufferPool::init_global(config.copy_buffer_size) {
        debug!("Copy buffer pool already initialized");
    }

    let ctx = Context::new();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel_with_cause("interrupted");
        }
    });

    match cli.command {
        Commands::Diff { lower, upper, json } => run_diff(&ctx, &config, lower, upper, json).await,
        Commands::Copy {
            src_root,
            src,
            dst_root,
            dst,
            include,
            exclude,
            gitignore,
            wildcards,
            contents,
            follow_links,
            replace,
            mode,
            allow_xattr_errors,
        } => {
            let mut info = CopyInfo::new().with_change_notifier(|kind, path, _| {
                println!("{} {}", kind, path);
                Ok(())
            });
            for pattern in include {
                info = info.with_include_pattern(pattern);
            }
            for pattern in exclude {
                info = info.with_exclude_pattern(pattern);
            }
            if gitignore {
                info = info.with_gitignore();
            }
            if wildcards {
                info = info.allow_wildcards();
            }
            if contents {
                info = info.copy_dir_contents();
            }
            if follow_links {
                info = info.follow_links();
            }
            if replace {
                info = info.always_replace_existing_dest_paths();
            }
            if allow_xattr_errors {
                info = info.allow_xattr_errors();
            }
            if let Some(mode) = mode {
                let mode = u32::from_str_radix(&mode, 8).with_context(|| format!("invalid mode '{}'", mode))?;
                info = info.with_mode(mode);
            }

            info!("Copying {} to {}", src, dst);
            filesync::copy(&ctx, &src_root, &src, &dst_root, &dst, &info).await?;
            Ok(())
        }
        Commands::Hash {
            root,
            algorithm,
            content,
        } => run_hash(&ctx, &config, root, algorithm.into(), content).await,
    }
}

async fn run_diff(ctx: &Context, config: &EngineConfig, lower: PathBuf, upper: PathBuf, json: bool) -> Result<()> {
    for dir in [&lower, &upper] {
        if !dir.is_dir() {
            bail!("{} is not a directory", dir.display());
        }
    }
    let lower = LocalFs::with_config(lower, config);
    let upper = LocalFs::with_config(upper, config);

    DiffEngine::with_config(config)
        .diff(ctx, &lower, &upper, |change| async move {
            if json {
                println!("{}", serde_json::to_string(&change)?);
            } else {
                println!("{} {}", change.kind, change.path);
            }
            Ok(())
        })
        .await?;
    Ok(())
}

async fn run_hash(
    ctx: &Context,
    config: &EngineConfig,
    root: PathBuf,
    algorithm: HashAlgorithm,
    content: bool,
) -> Result<()> {
    let fs = LocalFs::with_config(root, config);
    let hasher = ContentHasher::new(algorithm);
    let lines = Mutex::new(Vec::new());

    fs.walk(ctx, |stat| {
        let (fs, lines) = (&fs, &lines);
        async move {
            let digest = if content && stat.is_regular() {
                let reader = fs.read_file(ctx, &stat.path).await?;
                hasher.hash_with_content(&stat, reader).await?
            } else {
                hasher.hash_stat(&stat)
            };
            lines
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(format!("{}  {}", digest, stat.path));
            Ok(())
        }
    })
    .await?;

    for line in lines.into_inner().unwrap_or_else(|p| p.into_inner()) {
        println!("{}", line);
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("filesync={}", level))),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
