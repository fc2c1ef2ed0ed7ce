//! edgestore CLI: build and query a weighted assertion store.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use rand::{RngCore, SeedableRng};

use edgestore::Edge;
use edgestore::combine::RowFormat;
use edgestore::config::StoreConfig;
use edgestore::index::{BackendKind, IndexManifest};
use edgestore::paths::{AppPaths, StorePaths};
use edgestore::pipeline;
use edgestore::query::{AssertionFinder, Page};
use edgestore::segment::SegmentStore;

#[derive(Parser)]
#[command(name = "edgestore", version, about = "Weighted assertion store")]
struct Cli {
    /// Store root (defaults to the XDG data directory).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (defaults to `<data-dir>/store.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store directories and write its config file.
    Init {
        /// Number of shards rows are distributed over.
        #[arg(long)]
        shards: Option<u32>,
        /// Index backend: redb, cursor or memory.
        #[arg(long)]
        backend: Option<BackendKind>,
    },

    /// Hash raw rows into shard files by grouping URI.
    Distribute {
        /// Raw row files.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(long)]
        shards: Option<u32>,
    },

    /// Sort and combine one file of raw rows into one shard's segments.
    Combine {
        input: PathBuf,
        /// Shard number; its segment ids start at `shard * segments_per_shard`.
        #[arg(long, default_value = "0")]
        shard: u32,
        /// Row layout: raw or flat.
        #[arg(long, default_value = "raw")]
        format: RowFormat,
    },

    /// Full rebuild: distribute, combine every shard, index.
    Build {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(long, default_value = "raw")]
        format: RowFormat,
        #[arg(long)]
        shards: Option<u32>,
        #[arg(long)]
        backend: Option<BackendKind>,
    },

    /// Rebuild the index over the accepted segments.
    Index {
        #[arg(long)]
        backend: Option<BackendKind>,
    },

    /// Look up edges by URI prefix (append `/.` for exact matches).
    Lookup {
        query: String,
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
        /// Print edges as JSON lines.
        #[arg(long)]
        json: bool,
    },

    /// Find edges matching every `field=value` criterion.
    Query {
        /// Criteria, e.g. `start=/c/en/dog rel=/r/IsA`.
        #[arg(required = true)]
        criteria: Vec<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
        #[arg(long)]
        json: bool,
    },

    /// Sample edges at random, weighted by segment size.
    Random {
        #[arg(long, default_value = "1")]
        count: usize,
        /// Seed for a reproducible sample.
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        json: bool,
    },

    /// Print the records of accepted (or rejected) segments.
    Dump {
        /// Dump the reject segments instead.
        #[arg(long)]
        rejects: bool,
        /// Only this segment id.
        #[arg(long)]
        segment: Option<u32>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },

    /// Show store layout, segment and index statistics.
    Info,
}

/// Resolved store location and settings for one invocation.
struct Store {
    paths: StorePaths,
    config: StoreConfig,
    config_file: PathBuf,
}

impl Store {
    fn resolve(cli: &Cli) -> Result<Self> {
        let config_file = match (&cli.config, &cli.data_dir) {
            (Some(path), _) => path.clone(),
            (None, Some(dir)) => StorePaths::new(dir).config_file(),
            (None, None) => AppPaths::resolve()?.default_store().config_file(),
        };
        let config = StoreConfig::load_or_default(&config_file)?;

        let root = match (&cli.data_dir, &config.data_dir) {
            (Some(dir), _) => dir.clone(),
            (None, Some(dir)) => dir.clone(),
            (None, None) => AppPaths::resolve()?.data_dir,
        };
        Ok(Self {
            paths: StorePaths::new(&root),
            config,
            config_file,
        })
    }

    fn override_shards(&mut self, shards: Option<u32>) -> Result<()> {
        if let Some(shards) = shards {
            self.config.shard_count = shards;
        }
        self.config.validate()?;
        Ok(())
    }

    fn override_backend(&mut self, backend: Option<BackendKind>) {
        if let Some(backend) = backend {
            self.config.index_backend = backend;
        }
    }

    fn finder(&self) -> Result<AssertionFinder> {
        self.paths.require()?;
        Ok(AssertionFinder::open(&self.paths.segments_dir, &self.paths.index_dir)?)
    }
}

fn print_edge(edge: &Edge, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(edge).into_diagnostic()?);
    } else {
        match edge.surface_text() {
            Some(text) => println!("{:>8.3}  {}  {}", edge.weight(), edge.uri(), text),
            None => println!("{:>8.3}  {}", edge.weight(), edge.uri()),
        }
    }
    Ok(())
}

fn print_page(page: &Page, json: bool) -> Result<()> {
    for edge in &page.edges {
        print_edge(edge, json)?;
    }
    if !json {
        let more = if page.has_more { " (more available)" } else { "" };
        println!("{} edge(s) from offset {}{more}", page.len(), page.offset);
    }
    Ok(())
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut store = Store::resolve(&cli)?;

    match cli.command {
        Commands::Init { shards, backend } => {
            store.override_shards(shards)?;
            store.override_backend(backend);
            store.paths.ensure_dirs()?;
            store.config.save(&store.config_file)?;
            println!("Initialized edgestore at {}", store.paths.root.display());
            println!("Config written to {}", store.config_file.display());
        }

        Commands::Distribute { inputs, shards } => {
            store.override_shards(shards)?;
            store.paths.ensure_dirs()?;
            let rows = pipeline::distribute(&inputs, &store.paths, store.config.shard_count)?;
            println!(
                "Distributed {rows} rows over {} shards in {}",
                store.config.shard_count,
                store.paths.shards_dir.display()
            );
        }

        Commands::Combine {
            input,
            shard,
            format,
        } => {
            store.paths.ensure_dirs()?;
            let outcome = pipeline::combine_file(&input, shard, &store.paths, &store.config, format)?;
            println!(
                "Shard {} ({} segments): {} groups, {} accepted, {} rejected, {} malformed rows",
                outcome.shard,
                outcome.accepted.len(),
                outcome.stats.groups,
                outcome.stats.accepted,
                outcome.stats.rejected,
                outcome.stats.dropped_rows
            );
        }

        Commands::Build {
            inputs,
            format,
            shards,
            backend,
        } => {
            store.override_shards(shards)?;
            store.override_backend(backend);
            let report = pipeline::build(&inputs, &store.paths, &store.config, format)?;
            println!("Build complete at {}", store.paths.root.display());
            println!("  rows:          {}", report.rows);
            println!("  accepted:      {}", report.accepted());
            println!("  rejected:      {}", report.rejected());
            println!("  malformed:     {}", report.dropped_rows());
            println!("  index backend: {}", report.index.backend);
            println!("  index keys:    {}", report.index.keys);
            println!("  index entries: {}", report.index.entries);
        }

        Commands::Index { backend } => {
            store.override_backend(backend);
            store.paths.require()?;
            let manifest = pipeline::build_index(&store.paths, &store.config)?;
            println!(
                "Indexed {} edges: {} keys, {} entries ({})",
                manifest.edges, manifest.keys, manifest.entries, manifest.backend
            );
        }

        Commands::Lookup {
            query,
            limit,
            offset,
            json,
        } => {
            let finder = store.finder()?;
            let page = finder.lookup(&query, limit, offset)?;
            print_page(&page, json)?;
        }

        Commands::Query {
            criteria,
            limit,
            offset,
            json,
        } => {
            let mut pairs = Vec::with_capacity(criteria.len());
            for criterion in &criteria {
                let Some((field, value)) = criterion.split_once('=') else {
                    miette::bail!("criterion {criterion:?} is not of the form field=value");
                };
                pairs.push((field.trim(), value.trim().to_string()));
            }
            let finder = store.finder()?;
            let page = finder.query(pairs, limit, offset)?;
            print_page(&page, json)?;
        }

        Commands::Random { count, seed, json } => {
            let finder = store.finder()?;
            let mut rng: Box<dyn RngCore> = match seed {
                Some(seed) => Box::new(rand::rngs::StdRng::seed_from_u64(seed)),
                None => Box::new(rand::thread_rng()),
            };
            for _ in 0..count {
                match finder.lookup_random(rng.as_mut())? {
                    Some(edge) => print_edge(&edge, json)?,
                    None => {
                        println!("Store is empty.");
                        break;
                    }
                }
            }
        }

        Commands::Dump {
            rejects,
            segment,
            limit,
            json,
        } => {
            store.paths.require()?;
            let dir = if rejects {
                &store.paths.rejects_dir
            } else {
                &store.paths.segments_dir
            };
            let segments = SegmentStore::open(dir, &store.config.segment_base)?;
            let limit = limit.unwrap_or(usize::MAX);
            let mut printed = 0usize;
            'segments: for reader in segments.segments() {
                if segment.is_some_and(|id| id != reader.segment_id()) {
                    continue;
                }
                for record in reader.iter() {
                    if printed >= limit {
                        break 'segments;
                    }
                    let (_, edge) = record?;
                    print_edge(&edge, json)?;
                    printed += 1;
                }
            }
        }

        Commands::Info => {
            let paths = &store.paths;
            println!("Store:    {}", paths.root.display());
            println!("Config:   {}", store.config_file.display());
            if !paths.exists() {
                println!("(not initialized; run `edgestore init`)");
                return Ok(());
            }
            let base = &store.config.segment_base;
            let accepted = SegmentStore::open(&paths.segments_dir, base)?;
            let rejected = SegmentStore::open(&paths.rejects_dir, base)?;
            println!(
                "Segments: {} ({} edges)",
                accepted.segments().count(),
                accepted.total_records()
            );
            println!(
                "Rejects:  {} ({} edges)",
                rejected.segments().count(),
                rejected.total_records()
            );
            match IndexManifest::load(&paths.index_dir) {
                Ok(manifest) => println!(
                    "Index:    {} over `{}`: {} edges, {} keys, {} entries",
                    manifest.backend,
                    manifest.segment_base,
                    manifest.edges,
                    manifest.keys,
                    manifest.entries
                ),
                Err(_) => println!("Index:    (not built; run `edgestore index`)"),
            }
        }
    }

    Ok(())
}
