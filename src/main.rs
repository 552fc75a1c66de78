//! Fragsim CLI
//!
//! Fragment fingerprint similarities stored as sparse pairs or frozen dense matrices.
//!
//! # Usage
//!
//! ```bash
//! # Load makebits fingerprints into a fingerprint store
//! fragsim fingerprints import fragments.fp fingerprints.kv
//!
//! # Score every fragment pair above a cutoff into a pair store
//! fragsim generate fingerprints.kv fingerprints.kv pairs.fsp --label-map labels.json
//!
//! # Freeze the pairs into a dense matrix and query it
//! fragsim freeze pairs.fsp matrix.fsm
//! fragsim similar matrix.fsm 3j7u_NDP_frag24 --cutoff 0.55
//! ```

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use fragsim::config::ToolConfig;
use fragsim::generate::{dump_pairs, similarity_to_query, DumpOptions, PairsTarget};
use fragsim::pairs::OpenMode;
use fragsim::query::AnyStore;
use fragsim::tsv::{self, ExportOptions};
use fragsim::{
    merge_pair_stores, open_any, FillPolicy, FingerprintStore, FreezeOptions, IngestMode, MatrixStore, PairStore,
    ScoreAxis, SimilarityIndex, Triangle,
};

#[derive(Parser)]
#[command(name = "fragsim")]
#[command(about = "Fragment fingerprint similarity stores")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fingerprint store operations
    #[command(subcommand)]
    Fingerprints(FingerprintCommands),

    /// Score fingerprint pairs above a cutoff into TSV or a pair store
    Generate {
        /// Fingerprint store with the query side
        left: PathBuf,

        /// Fingerprint store with the target side
        right: PathBuf,

        /// Output path, `-` for TSV on stdout
        output: String,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Store)]
        format: OutputFormat,

        /// JSON object mapping fragment labels to ids (store output)
        #[arg(long)]
        label_map: Option<PathBuf>,

        /// Mean on-bit density used for the score corrections
        #[arg(long, default_value_t = 0.01)]
        mean_onbit_density: f64,

        /// Minimum score to keep
        #[arg(long, default_value_t = 0.45)]
        cutoff: f64,

        /// Which pairs to emit
        #[arg(long, value_enum, default_value_t = PolicyArg::Symmetric)]
        policy: PolicyArg,

        /// Quantization precision of stored scores
        #[arg(long)]
        precision: Option<u16>,
    },

    /// Fragments similar to a query in a pair store or frozen matrix
    Similar {
        /// Pair store or frozen matrix
        store: PathBuf,

        /// Fragment label to query
        query: String,

        #[command(flatten)]
        hits: HitArgs,

        /// Output path, `-` for stdout
        #[arg(short, long, default_value = "-")]
        output: String,
    },

    /// Append several pair stores into one indexed store
    Merge {
        /// Input pair stores; labels and precision come from the first
        #[arg(required = true, num_args = 1..)]
        inputs: Vec<PathBuf>,

        /// Output pair store
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Import pairs from a text file into a new pair store
    Import {
        /// Input file, `-` for stdin
        input: String,

        /// Output pair store
        output: PathBuf,

        /// JSON object mapping fragment labels to ids
        #[arg(long)]
        label_map: PathBuf,

        /// Input format
        #[arg(long, value_enum, default_value_t = InputFormat::Tsv)]
        format: InputFormat,

        /// Expected number of pairs
        #[arg(long, default_value_t = 0)]
        nrrows: u64,

        /// Drop rows whose first label sorts after the second
        #[arg(long)]
        upper_only: bool,

        /// Quantization precision of stored scores
        #[arg(long)]
        precision: Option<u16>,
    },

    /// Export every stored pair as TSV
    Export {
        /// Pair store or frozen matrix
        store: PathBuf,

        /// Output path, `-` for stdout
        #[arg(default_value = "-")]
        output: String,

        /// Omit the column header
        #[arg(long)]
        no_header: bool,

        /// Only pairs between `frag1` fragments
        #[arg(long)]
        frag1: bool,

        /// File with PDB codes; only pairs within these are written
        #[arg(long)]
        pdb: Option<PathBuf>,
    },

    /// Copy a pair store keeping only selected fragments
    Filter {
        input: PathBuf,

        /// Output pair store, overwritten if it exists
        output: PathBuf,

        /// File with fragment labels to keep, one per line
        #[arg(long, conflicts_with = "skip", required_unless_present = "skip")]
        keep: Option<PathBuf>,

        /// File with fragment labels to drop, one per line
        #[arg(long)]
        skip: Option<PathBuf>,
    },

    /// Freeze a pair store into a dense matrix
    Freeze {
        input: PathBuf,

        /// Output matrix; an existing matrix with the same labels is updated
        output: PathBuf,

        /// Stop after this many pairs
        #[arg(long)]
        limit: Option<u64>,

        /// Which cells to fill
        #[arg(long, value_enum, default_value_t = PolicyArg::Symmetric)]
        policy: PolicyArg,

        /// Add scores into existing cells instead of overwriting them
        #[arg(long)]
        accumulate: bool,

        /// Pairs read per frame
        #[arg(long)]
        frame_size: Option<usize>,
    },

    /// Expand a dense matrix back into an indexed pair store
    Thaw {
        input: PathBuf,
        output: PathBuf,
    },

    /// Distribution of stored scores
    Histogram {
        /// Pair store or frozen matrix
        store: PathBuf,

        /// Output path, `-` for stdout
        #[arg(default_value = "-")]
        output: String,

        /// Report raw 16 bit scores instead of fractions
        #[arg(long)]
        raw_score: bool,

        /// Count the lower triangle of a matrix instead of the upper one
        #[arg(long)]
        lower_triangle: bool,
    },

    /// Summary of a pair store or frozen matrix as JSON
    Stats {
        store: PathBuf,
    },

    /// Convert fpneigh listings to TSV
    Fpneigh2tsv {
        /// Input file, `-` for stdin
        input: String,

        /// Output path, `-` for stdout
        #[arg(default_value = "-")]
        output: String,
    },
}

#[derive(Subcommand)]
enum FingerprintCommands {
    /// Load a makebits file into a fingerprint store
    Import {
        /// Makebits file, `-` for stdin
        input: String,

        /// Fingerprint store, created if missing
        store: PathBuf,
    },

    /// Write a fingerprint store in makebits layout
    Export {
        store: PathBuf,

        /// Output path, `-` for stdout
        #[arg(default_value = "-")]
        output: String,
    },

    /// Score one fragment, or every fragment sharing a label prefix, against the store
    Similar {
        store: PathBuf,

        /// Exact label or label prefix
        query: String,

        /// Mean on-bit density used for the score corrections
        #[arg(long, default_value_t = 0.01)]
        mean_onbit_density: f64,

        #[command(flatten)]
        hits: HitArgs,

        /// Output path, `-` for stdout
        #[arg(short, long, default_value = "-")]
        output: String,
    },

    /// Mean on-bit density over every stored fingerprint
    Density {
        store: PathBuf,
    },
}

/// Hit reporting knobs, defaulting to the `FRAGSIM_*` environment
#[derive(Args, Debug, Default)]
struct HitArgs {
    /// Minimum score of reported hits
    #[arg(long)]
    cutoff: Option<f64>,

    /// Maximum number of reported hits
    #[arg(long)]
    limit: Option<usize>,
}

fn tool_config() -> anyhow::Result<ToolConfig> {
    ToolConfig::from_env().context("Invalid FRAGSIM_* environment")
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Tsv,
    Store,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum InputFormat {
    Tsv,
    Fpneigh,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyArg {
    Symmetric,
    Upper,
    Lower,
}

impl From<PolicyArg> for FillPolicy {
    fn from(policy: PolicyArg) -> Self {
        match policy {
            PolicyArg::Symmetric => FillPolicy::Symmetric,
            PolicyArg::Upper => FillPolicy::UpperTriangleOnly,
            PolicyArg::Lower => FillPolicy::LowerTriangleOnly,
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr so TSV on stdout stays clean
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Fingerprints(command) => run_fingerprints(command),

        Commands::Generate {
            left,
            right,
            output,
            format,
            label_map,
            mean_onbit_density,
            cutoff,
            policy,
            precision,
        } => {
            let config = tool_config()?.with_overrides(precision, None, None, None);
            let left_set = FingerprintStore::open(&left)
                .and_then(|store| store.materialize())
                .with_context(|| format!("Failed to load fingerprints from {:?}", left))?;
            let right_set = FingerprintStore::open(&right)
                .and_then(|store| store.materialize())
                .with_context(|| format!("Failed to load fingerprints from {:?}", right))?;

            let options = DumpOptions {
                mean_onbit_density,
                cutoff,
                policy: policy.into(),
                precision: config.precision,
            };
            let written = match format {
                OutputFormat::Tsv => {
                    let mut out = open_output(&output)?;
                    dump_pairs(&left_set, &right_set, PairsTarget::Tsv(&mut out), &options)?
                }
                OutputFormat::Store => {
                    let labels = label_map.as_deref().map(read_label_map).transpose()?;
                    let target = PairsTarget::Store {
                        path: &output,
                        label2id: labels.as_ref(),
                    };
                    dump_pairs(&left_set, &right_set, target, &options)
                        .with_context(|| format!("Failed to write pair store {}", output))?
                }
            };
            info!(pairs = written, "generate complete");
            Ok(())
        }

        Commands::Similar {
            store,
            query,
            hits,
            output,
        } => {
            let config = tool_config()?.with_overrides(None, None, hits.cutoff, hits.limit);
            let index = open_store(&store)?;
            let hits = index
                .find(&query, config.cutoff, config.limit)
                .with_context(|| format!("Query {} failed", query))?;
            let mut out = open_output(&output)?;
            tsv::write_hits(&mut out, &query, &hits)?;
            Ok(())
        }

        Commands::Merge { inputs, output } => {
            let merged = merge_pair_stores(&inputs, &output)
                .with_context(|| format!("Failed to merge into {:?}", output))?;
            info!(pairs = merged, inputs = inputs.len(), "merge complete");
            Ok(())
        }

        Commands::Import {
            input,
            output,
            label_map,
            format,
            nrrows,
            upper_only,
            precision,
        } => {
            let config = tool_config()?.with_overrides(precision, None, None, None);
            let labels = read_label_map(&label_map)?;
            let reader = open_input(&input)?;
            let mut store = PairStore::create(&output, nrrows, config.precision)
                .with_context(|| format!("Failed to create pair store {:?}", output))?;

            let written = match format {
                InputFormat::Tsv => tsv::import_pairs(tsv::read_tsv_pairs(reader), &mut store, &labels, upper_only)?,
                InputFormat::Fpneigh => {
                    tsv::import_pairs(tsv::read_fpneigh_pairs(reader), &mut store, &labels, upper_only)?
                }
            };
            store.add_indexes()?;
            store.close()?;
            info!(pairs = written, "import complete");
            Ok(())
        }

        Commands::Export {
            store,
            output,
            no_header,
            frag1,
            pdb,
        } => {
            let pdb_codes = match pdb {
                Some(path) => Some(tsv::load_pdb_codes(BufReader::new(
                    File::open(&path).with_context(|| format!("Failed to open {:?}", path))?,
                ))?),
                None => None,
            };
            let options = ExportOptions {
                no_header,
                frag1_only: frag1,
                pdb_codes,
            };
            let index = open_store(&store)?;
            let mut out = open_output(&output)?;
            tsv::export_pairs(&index, &mut out, &options)?;
            Ok(())
        }

        Commands::Filter {
            input,
            output,
            keep,
            skip,
        } => {
            let source = PairStore::open(&input, OpenMode::Read)
                .with_context(|| format!("Failed to open pair store {:?}", input))?;
            let (labels, keep_listed) = match (keep, skip) {
                (Some(path), _) => (read_label_list(&path)?, true),
                (None, Some(path)) => (read_label_list(&path)?, false),
                (None, None) => bail!("Either --keep or --skip is required"),
            };

            let kept_labels = if keep_listed {
                labels.len()
            } else {
                source.labels().len().saturating_sub(labels.len())
            };
            let expected_rows = if source.labels().is_empty() {
                0
            } else {
                (source.len() as f64 * kept_labels as f64 / source.labels().len() as f64) as u64
            };

            let mut out = PairStore::create(&output, expected_rows, source.precision().value())
                .with_context(|| format!("Failed to create pair store {:?}", output))?;
            let copied = source.copy_filtered(&mut out, |label| labels.contains(label) == keep_listed)?;
            out.add_indexes()?;
            out.close()?;
            info!(pairs = copied, "filter complete");
            Ok(())
        }

        Commands::Freeze {
            input,
            output,
            limit,
            policy,
            accumulate,
            frame_size,
        } => {
            let config = tool_config()?.with_overrides(None, frame_size, None, None);
            let pairs = PairStore::open(&input, OpenMode::Read)
                .with_context(|| format!("Failed to open pair store {:?}", input))?;
            let options = FreezeOptions {
                frame_size: config.frame_size,
                limit,
                policy: policy.into(),
                mode: if accumulate {
                    IngestMode::Accumulate
                } else {
                    IngestMode::Overwrite
                },
            };
            let matrix = MatrixStore::from_pairs(&output, &pairs, &options)
                .with_context(|| format!("Failed to freeze into {:?}", output))?;
            info!(labels = matrix.len(), "freeze complete");
            Ok(())
        }

        Commands::Thaw { input, output } => {
            let matrix =
                MatrixStore::open(&input).with_context(|| format!("Failed to open matrix {:?}", input))?;
            let expected_rows = matrix.len() as u64 * 2;
            let mut pairs = PairStore::create(&output, expected_rows, matrix.precision().value())
                .with_context(|| format!("Failed to create pair store {:?}", output))?;
            let written = matrix.to_pairs(&mut pairs)?;
            pairs.add_indexes()?;
            pairs.close()?;
            info!(pairs = written, "thaw complete");
            Ok(())
        }

        Commands::Histogram {
            store,
            output,
            raw_score,
            lower_triangle,
        } => {
            let axis = if raw_score { ScoreAxis::Raw } else { ScoreAxis::Fraction };
            let index = open_store(&store)?;
            let bins = match &index {
                AnyStore::Matrix(matrix) => {
                    let triangle = if lower_triangle { Triangle::Lower } else { Triangle::Upper };
                    matrix.count_bins(axis, triangle)?
                }
                AnyStore::Pairs(_) => index.histogram()?.bins(axis),
            };
            let mut out = open_output(&output)?;
            tsv::write_histogram(&mut out, &bins)?;
            Ok(())
        }

        Commands::Stats { store } => {
            let index = open_store(&store)?;
            let stats = match &index {
                AnyStore::Pairs(pairs) => serde_json::to_value(pairs.stats()?)?,
                AnyStore::Matrix(matrix) => serde_json::to_value(matrix.stats()?)?,
            };
            let report = serde_json::json!({ "kind": index.kind(), "stats": stats });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }

        Commands::Fpneigh2tsv { input, output } => {
            let reader = open_input(&input)?;
            let mut out = open_output(&output)?;
            let written = tsv::write_pairs(&mut out, tsv::read_fpneigh_pairs(reader), true)?;
            info!(pairs = written, "conversion complete");
            Ok(())
        }
    }
}

fn run_fingerprints(command: FingerprintCommands) -> anyhow::Result<()> {
    match command {
        FingerprintCommands::Import { input, store } => {
            let (number_of_bits, fingerprints) = tsv::read_makebits(open_input(&input)?)
                .with_context(|| format!("Failed to parse makebits input {}", input))?;
            let mut fingerprint_store = FingerprintStore::open(&store)
                .with_context(|| format!("Failed to open fingerprint store {:?}", store))?;

            match fingerprint_store.number_of_bits()? {
                Some(existing) if existing != number_of_bits => bail!(
                    "Fingerprint store {:?} holds {}-bit fingerprints, input has {}",
                    store,
                    existing,
                    number_of_bits
                ),
                Some(_) => {}
                None => fingerprint_store.set_number_of_bits(number_of_bits),
            }
            let count = fingerprints.len();
            fingerprint_store.extend(fingerprints);
            fingerprint_store.flush()?;
            info!(fingerprints = count, number_of_bits, "fingerprint import complete");
            Ok(())
        }

        FingerprintCommands::Export { store, output } => {
            let set = FingerprintStore::open(&store)
                .and_then(|store| store.materialize())
                .with_context(|| format!("Failed to load fingerprints from {:?}", store))?;
            let mut out = open_output(&output)?;
            tsv::write_makebits(&mut out, set.number_of_bits(), set.iter().map(|(l, b)| (l.as_str(), b)))?;
            Ok(())
        }

        FingerprintCommands::Similar {
            store,
            query,
            mean_onbit_density,
            hits,
            output,
        } => {
            let config = tool_config()?.with_overrides(None, None, hits.cutoff, hits.limit);
            let set = FingerprintStore::open(&store)
                .and_then(|store| store.materialize())
                .with_context(|| format!("Failed to load fingerprints from {:?}", store))?;
            let mut hits = similarity_to_query(&set, &query, config.cutoff, mean_onbit_density)?;
            if let Some(limit) = config.limit {
                hits.truncate(limit);
            }
            let pairs = hits.into_iter().map(Ok);
            let mut out = open_output(&output)?;
            tsv::write_pairs(&mut out, pairs, true)?;
            Ok(())
        }

        FingerprintCommands::Density { store } => {
            let set = FingerprintStore::open(&store)
                .and_then(|store| store.materialize())
                .with_context(|| format!("Failed to load fingerprints from {:?}", store))?;
            println!("{}", set.mean_on_bit_density()?);
            Ok(())
        }
    }
}

fn open_store(path: &Path) -> anyhow::Result<AnyStore> {
    open_any(path).with_context(|| format!("Failed to open store {:?}", path))
}

fn open_input(path: &str) -> anyhow::Result<Box<dyn BufRead>> {
    if path == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file = File::open(path).with_context(|| format!("Failed to open {}", path))?;
    Ok(Box::new(BufReader::new(file)))
}

fn open_output(path: &str) -> anyhow::Result<Box<dyn Write>> {
    if path == "-" {
        return Ok(Box::new(BufWriter::new(io::stdout())));
    }
    let file = File::create(path).with_context(|| format!("Failed to create {}", path))?;
    Ok(Box::new(BufWriter::new(file)))
}

fn read_label_map(path: &Path) -> anyhow::Result<fragsim::LabelIndex> {
    let file = File::open(path).with_context(|| format!("Failed to open label map {:?}", path))?;
    tsv::load_label_map(BufReader::new(file)).with_context(|| format!("Failed to read label map {:?}", path))
}

fn read_label_list(path: &Path) -> anyhow::Result<HashSet<String>> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    Ok(tsv::load_label_list(BufReader::new(file))?)
}
