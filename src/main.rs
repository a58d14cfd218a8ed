//! moe-offload CLI: inspect expert layouts and replay selection traces

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use moe_offload::expert::DiskIndex;
use moe_offload::trace::read_trace;
use moe_offload::{
    remap_parallel, CacheConfig, CpuBackend, Error, ExpertCache, ModelConfig, Result, Selection,
    ShardNaming, ShardRole, WeightManifest,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "moe-offload")]
#[command(about = "Demand-paged expert weights for MoE inference", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show model and pool geometry
    Info {
        /// Path to model directory
        #[arg(short, long)]
        model: PathBuf,

        /// Use HF fused-expert tensor names instead of GGUF names
        #[arg(long)]
        hf: bool,
    },

    /// List expert shard locations
    Index {
        /// Path to model directory
        #[arg(short, long)]
        model: PathBuf,

        /// Only show this MoE layer
        #[arg(short, long)]
        layer: Option<usize>,

        /// Use HF fused-expert tensor names instead of GGUF names
        #[arg(long)]
        hf: bool,
    },

    /// Replay a selection trace through the cache
    Replay {
        /// Path to model directory
        #[arg(short, long)]
        model: PathBuf,

        /// Trace file
        #[arg(short, long)]
        trace: PathBuf,

        /// Cache config JSON (overridden by the flags below)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Fraction of memory the pool may use
        #[arg(long)]
        utilization: Option<f32>,

        /// Memory size to budget against, in MiB
        #[arg(long)]
        memory_mib: Option<u64>,

        /// Maximum number of slots
        #[arg(long)]
        max_slots: Option<usize>,

        /// Worker threads per node
        #[arg(long, default_value = "4")]
        threads: usize,

        /// Load whole layers up front
        #[arg(long)]
        prefill: bool,

        /// Route every load through a staging buffer
        #[arg(long)]
        staged: bool,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    let directive = "moe_offload=info"
        .parse::<Directive>()
        .map_err(|e| Error::Config(format!("bad log directive: {}", e)))?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Info { model, hf } => {
            show_info(&model, naming(hf))?;
        }

        Commands::Index { model, layer, hf } => {
            list_locations(&model, layer, naming(hf))?;
        }

        Commands::Replay {
            model,
            trace,
            config,
            utilization,
            memory_mib,
            max_slots,
            threads,
            prefill,
            staged,
        } => {
            let mut cache_config = match config {
                Some(path) => CacheConfig::from_file(path)?,
                None => CacheConfig::default(),
            };
            if let Some(u) = utilization {
                cache_config.utilization = u;
            }
            if let Some(mib) = memory_mib {
                cache_config.memory_total = Some(mib * 1024 * 1024);
            }
            if max_slots.is_some() {
                cache_config.max_slots = max_slots;
            }
            replay(&model, &trace, cache_config, threads, prefill, staged)?;
        }
    }

    Ok(())
}

fn naming(hf: bool) -> ShardNaming {
    if hf {
        ShardNaming::fused_hf()
    } else {
        ShardNaming::default()
    }
}

fn show_info(model_dir: &Path, naming: ShardNaming) -> Result<()> {
    let config = ModelConfig::from_dir(model_dir)?;
    let manifest = WeightManifest::open(model_dir)?;
    let index = DiskIndex::build(&manifest, &config, &naming, CacheConfig::default().alignment)?;

    println!("Model Information");
    println!("=================");
    println!("Layers: {}", config.n_layer);
    println!("Dense lead layers: {}", config.n_layer_dense_lead);
    println!("MoE layers: {}", index.n_layers());
    println!("Experts per layer: {}", index.n_expert());
    println!("Experts per token: {}", config.n_expert_used);
    println!("Backing files: {}", index.files().len());

    println!("\nSlot geometry");
    let mut group = 0;
    for role in ShardRole::ALL {
        let g = index.roles()[role.index()];
        println!(
            "  {:<5} {} [{} x {}] {} bytes",
            role, g.dtype, g.rows, g.cols, g.slot_bytes
        );
        group += g.slot_bytes;
    }
    println!("  group {} bytes", group);
    println!(
        "  one layer block: {:.2} MiB",
        (group * index.n_expert()) as f64 / 1024.0 / 1024.0
    );

    Ok(())
}

fn list_locations(model_dir: &Path, layer: Option<usize>, naming: ShardNaming) -> Result<()> {
    let config = ModelConfig::from_dir(model_dir)?;
    let manifest = WeightManifest::open(model_dir)?;
    let index = DiskIndex::build(&manifest, &config, &naming, CacheConfig::default().alignment)?;

    println!("Expert shard locations:");
    println!("=======================");

    let mut count = 0;
    for il in 0..index.n_layers() {
        if layer.map_or(false, |l| l != il) {
            continue;
        }
        let format = index.format(il)?;
        for e in 0..index.n_expert() {
            for role in ShardRole::ALL {
                let loc = index.location(il, e, role)?;
                println!(
                    "  layer {:>3} expert {:>4} {:<5} file {} @ {:>12} ({} bytes, {})",
                    il,
                    e,
                    role,
                    loc.file_index,
                    loc.byte_offset,
                    format.expert_bytes(role),
                    format.dtype(role)
                );
                count += 1;
            }
        }
    }

    println!("\nTotal: {} shards", count);

    Ok(())
}

fn replay(
    model_dir: &Path,
    trace_path: &Path,
    config: CacheConfig,
    threads: usize,
    prefill: bool,
    staged: bool,
) -> Result<()> {
    let steps = read_trace(trace_path)?;
    println!("Loaded {} trace steps from {}", steps.len(), trace_path.display());

    let backend = if staged {
        CpuBackend::new().staged()
    } else {
        CpuBackend::new()
    };
    let cache = ExpertCache::from_dir(model_dir, config, &backend)?;
    println!(
        "Pool: {} slots, {:.2} MiB on {}",
        cache.n_slots(),
        cache.total_size() as f64 / 1024.0 / 1024.0,
        cache.pool().backend_name()
    );

    if prefill {
        let layers = cache.prefill_init()?;
        println!("Prefilled {} layers", layers);
    }

    let pb = ProgressBar::new(steps.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} steps")
            .map_err(|e| Error::Config(format!("progress template: {}", e)))?,
    );

    let naming = cache.config().naming.clone();
    for (step, entry) in steps.iter().enumerate() {
        let node = naming.node_name(entry.layer);
        let ids = entry.ids();
        let sel = Selection::new(&node, step as u64, &ids, entry.n_ids());
        remap_parallel(&cache, &sel, threads)?;
        pb.inc(1);
    }
    pb.finish_and_clear();

    let stats = cache.stats();
    println!("\nReplay statistics");
    println!("=================");
    println!("Hits: {}", stats.hits);
    println!("Misses: {}", stats.misses);
    println!("Expert loads: {}", stats.expert_loads);
    println!("Layer loads: {}", stats.layer_loads);
    println!("Evictions: {}", stats.evictions);
    println!(
        "Bytes read: {:.2} MiB",
        stats.bytes_read as f64 / 1024.0 / 1024.0
    );
    println!("Resident slots: {}/{}", cache.resident_slots(), cache.n_slots());

    Ok(())
}
