//! `mkdwarfs` — create or rewrite DwarFS images.

use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dwarfs::categorizer::CategorizerManager;
use dwarfs::codec::{self, Codec};
use dwarfs::entry::EntryKind;
use dwarfs::error::Error;
use dwarfs::history::History;
use dwarfs::inode::{InodeManager, OrderPolicy};
use dwarfs::metadata::MetadataOptions;
use dwarfs::options::{level_preset, split_entry, CategorizedOption};
use dwarfs::progress::Progress;
use dwarfs::scanner::{ScanOptions, Scanner};
use dwarfs::segmenter::SegmenterConfig;
use dwarfs::writer::{
    recompress_image, CategoryFilter, CategoryWriterConfig, ImageWriter, RecompressMode,
    RecompressOptions, WriterOptions,
};

#[derive(Parser, Debug)]
#[command(
    name = "mkdwarfs",
    version,
    about = "Create a read-only, content-addressed, block-compressed filesystem image"
)]
struct Args {
    /// Input directory, or an existing image when --recompress is used
    #[arg(short, long)]
    input: PathBuf,

    /// File with a newline-separated list of paths (relative to --input)
    #[arg(long)]
    input_list: Option<PathBuf>,

    /// Output image file, or '-' for stdout
    #[arg(short, long)]
    output: String,

    /// Compression level preset (0..9)
    #[arg(short = 'l', long, default_value_t = 7)]
    compress_level: u32,

    /// Block size in bits (10..30); accepts [cat::]value entries
    #[arg(short = 'S', long = "block-size-bits")]
    block_size_bits: Vec<String>,

    /// Segmenter window size in bits; 0 disables; accepts [cat::]value
    #[arg(short = 'W', long)]
    window_size: Vec<String>,

    /// Window step shift; accepts [cat::]value
    #[arg(short = 'w', long)]
    window_step: Vec<String>,

    /// Blocks kept searchable by the segmenter; accepts [cat::]value
    #[arg(short = 'B', long)]
    max_lookback_blocks: Vec<String>,

    /// Bloom filter size shift; accepts [cat::]value
    #[arg(long)]
    bloom_filter_size: Vec<String>,

    /// Inode order: none|path|revpath|similarity|nilsimsa; [cat::]value
    #[arg(long)]
    order: Vec<String>,

    /// Block compression, e.g. zstd:level=19; accepts [cat::]value
    #[arg(short = 'C', long)]
    compression: Vec<String>,

    /// Schema section compression
    #[arg(long)]
    schema_compression: Option<String>,

    /// Metadata section compression
    #[arg(long)]
    metadata_compression: Option<String>,

    /// History section compression
    #[arg(long)]
    history_compression: Option<String>,

    /// Enable categorizers, in priority order (comma-separated)
    #[arg(long, value_delimiter = ',')]
    categorize: Vec<String>,

    /// Recompress an existing image: none|block|metadata|all
    #[arg(long)]
    recompress: Option<String>,

    /// Restrict --recompress to these categories ('!' negates)
    #[arg(long)]
    recompress_categories: Option<String>,

    /// Re-encode the metadata tables when rewriting
    #[arg(long)]
    rebuild_metadata: bool,

    /// Change the block size when rewriting (not supported)
    #[arg(long)]
    change_block_size: Option<String>,

    /// Overwrite the output if it exists
    #[arg(short, long)]
    force: bool,

    #[arg(long)]
    no_section_index: bool,

    #[arg(long)]
    no_history: bool,

    /// Remove a raw header carried by the input image
    #[arg(long)]
    remove_header: bool,

    /// Set the owner (uid) of all entries
    #[arg(long)]
    set_owner: Option<u32>,

    /// Set the group (gid) of all entries
    #[arg(long)]
    set_group: Option<u32>,

    /// Set all timestamps; epoch seconds or 'now'
    #[arg(long)]
    set_time: Option<String>,

    /// Timestamp resolution: sec|min|hour|day or seconds
    #[arg(long)]
    time_resolution: Option<String>,

    /// Force permission bits (octal) on all entries
    #[arg(long)]
    chmod: Option<String>,

    /// Keep atime/ctime instead of collapsing them onto mtime
    #[arg(long)]
    keep_all_times: bool,

    /// Detect runs of zero bytes and store them as holes
    #[arg(long)]
    detect_sparse_files: bool,

    /// Progress mode: none|simple|ascii|unicode
    #[arg(long, default_value = "simple")]
    progress: String,

    /// Print the scanned file list and exit: all|files|included|excluded
    #[arg(long)]
    debug_filter: Option<String>,

    /// Number of compression worker threads
    #[arg(long)]
    num_workers: Option<usize>,

    /// Concurrently segmented category streams
    #[arg(long, default_value_t = 1)]
    max_active_slots: usize,

    /// In-flight block byte budget
    #[arg(long, default_value_t = 512u64 << 20)]
    max_queue_size: u64,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    std::process::exit(match run(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("mkdwarfs: {e}");
            1
        }
    });
}

fn parse_u32_stack(entries: &[String], default: u32) -> Result<CategorizedOption<u32>, Error> {
    let mut opt = CategorizedOption::new(default);
    opt.parse_all(entries, |s| {
        s.parse::<u32>()
            .map_err(|_| Error::Config(format!("'{s}' is not a number")))
    })?;
    Ok(opt)
}

fn parse_codec(spec: &str) -> Result<Arc<dyn Codec>, Error> {
    codec::parse_codec_spec(spec)
        .map(Arc::from)
        .map_err(|e| Error::Config(e.to_string()))
}

fn run(args: &Args) -> Result<i32, Error> {
    if args.change_block_size.is_some() {
        return Err(Error::Config(
            "--change-block-size is not supported: splitting existing blocks cannot \
             preserve chunk semantics bit-exactly"
                .into(),
        ));
    }

    let output_path = resolve_output(args)?;

    if let Some(mode) = &args.recompress {
        let code = run_recompress(args, mode, &output_path)?;
        emit_stdout(args, &output_path)?;
        return Ok(code);
    }

    let code = run_build(args, &output_path)?;
    emit_stdout(args, &output_path)?;
    Ok(code)
}

fn resolve_output(args: &Args) -> Result<PathBuf, Error> {
    if args.output == "-" {
        return Ok(std::env::temp_dir().join(format!("mkdwarfs-{}.tmp", std::process::id())));
    }
    let path = PathBuf::from(&args.output);
    if path.exists() && !args.force {
        return Err(Error::Config(format!(
            "output '{}' exists; use --force to overwrite",
            path.display()
        )));
    }
    Ok(path)
}

fn emit_stdout(args: &Args, output_path: &PathBuf) -> Result<(), Error> {
    if args.output != "-" || !output_path.exists() {
        return Ok(());
    }
    let mut f = std::fs::File::open(output_path).map_err(|e| Error::io_read(output_path, e))?;
    std::io::copy(&mut f, &mut std::io::stdout()).map_err(Error::Io)?;
    let _ = std::fs::remove_file(output_path);
    Ok(())
}

// ── Build ────────────────────────────────────────────────────────────────────

fn run_build(args: &Args, output_path: &PathBuf) -> Result<i32, Error> {
    let preset = level_preset(args.compress_level)?;

    let scan_opts = ScanOptions {
        set_owner: args.set_owner,
        set_group: args.set_group,
        set_time: parse_set_time(args.set_time.as_deref())?,
        chmod: args
            .chmod
            .as_deref()
            .map(|s| u32::from_str_radix(s, 8))
            .transpose()
            .map_err(|_| Error::Config("chmod expects octal permission bits".into()))?,
        keep_all_times: args.keep_all_times,
        detect_sparse_files: args.detect_sparse_files,
        ..ScanOptions::default()
    };

    let categorizers = CategorizerManager::with_builtins(&args.categorize)
        .map_err(Error::Config)?;
    let progress = Arc::new(Progress::default());
    let scanner = Scanner::new(scan_opts, &categorizers, Arc::clone(&progress));

    let mut tree = match &args.input_list {
        Some(list_path) => {
            let list = std::fs::read_to_string(list_path)
                .map_err(|e| Error::io_read(list_path, e))?;
            let paths: Vec<PathBuf> = list
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(PathBuf::from)
                .collect();
            scanner.scan_list(&args.input, &paths)?
        }
        None => scanner.scan(&args.input)?,
    };

    if let Some(mode) = &args.debug_filter {
        return run_debug_filter(mode, &tree);
    }

    let inode_mgr = InodeManager::build(&tree, &progress);
    let layout = inode_mgr.assign_inode_numbers(&mut tree);

    // Per-category option stacks; the preset seeds the defaults.
    let block_size_bits = parse_u32_stack(&args.block_size_bits, preset.block_size_bits)?;
    for (_, v) in args.block_size_bits.iter().map(|e| split_entry(e)) {
        let n: u32 = v.parse().unwrap_or(0);
        if !(10..=30).contains(&n) {
            return Err(Error::Config(format!("block size bits {n} out of range (10..30)")));
        }
    }
    let window_size = parse_u32_stack(&args.window_size, preset.window_size)?;
    let window_step = parse_u32_stack(&args.window_step, preset.window_step_shift)?;
    let bloom_filter_size = parse_u32_stack(&args.bloom_filter_size, 4)?;
    let max_lookback =
        parse_u32_stack(&args.max_lookback_blocks, preset.max_lookback_blocks as u32)?;

    let mut order = CategorizedOption::new(
        OrderPolicy::parse(preset.order).expect("preset order is valid"),
    );
    order.parse_all(&args.order, |s| {
        OrderPolicy::parse(s).ok_or_else(|| Error::Config(format!("unknown order '{s}'")))
    })?;

    let mut compression = CategorizedOption::new(preset.default_compression.to_owned());
    compression.parse_all(&args.compression, |s| Ok(s.to_owned()))?;

    // The waveform categories default to the frame-aware codec unless the
    // user said otherwise.
    let default_overrides: &[(&str, &str)] =
        &[("pcmaudio/waveform", "pcmaudio"), ("incompressible", "null")];

    let resolve = |name: &str| -> CategoryWriterConfig {
        let spec: String = if compression.has_override(name) {
            compression.get(name).clone()
        } else {
            default_overrides
                .iter()
                .find(|(cat, _)| *cat == name)
                .map(|(_, codec)| codec.to_string())
                .unwrap_or_else(|| compression.default_value().clone())
        };
        let codec = parse_codec(&spec).unwrap_or_else(|e| {
            log::warn!("{e}; falling back to the default codec");
            Arc::from(codec::parse_codec_spec("zstd").expect("zstd spec is valid"))
        });
        CategoryWriterConfig {
            codec,
            segmenter: SegmenterConfig {
                context: format!("[{name}] "),
                block_size_bits: *block_size_bits.get(name),
                blockhash_window_size: *window_size.get(name),
                window_increment_shift: *window_step.get(name),
                max_active_blocks: *max_lookback.get(name) as usize,
                bloom_filter_size: *bloom_filter_size.get(name),
            },
            order: *order.get(name),
        }
    };

    let metadata_options = MetadataOptions {
        mtime_only: !args.keep_all_times,
        time_resolution_sec: parse_time_resolution(args.time_resolution.as_deref())?,
        ..MetadataOptions::default()
    };
    metadata_options.validate()?;

    let schema_codec = parse_codec(args.schema_compression.as_deref().unwrap_or("zstd:level=9"))?;
    let metadata_codec = parse_codec(
        args.metadata_compression
            .as_deref()
            .unwrap_or(preset.metadata_compression),
    )?;
    let history_codec =
        parse_codec(args.history_compression.as_deref().unwrap_or("zstd:level=9"))?;

    let mut history = History::new();
    history.append(std::env::args().collect());

    let mut writer = ImageWriter {
        tree: &tree,
        inode_mgr: &inode_mgr,
        layout: &layout,
        categorizers: &categorizers,
        progress: Arc::clone(&progress),
        metadata_options,
        options: WriterOptions {
            num_workers: args.num_workers.unwrap_or_else(num_cpus::get),
            max_active_slots: args.max_active_slots,
            max_queue_size: args.max_queue_size,
            no_section_index: args.no_section_index,
            no_history: args.no_history,
            header: None,
            schema_codec,
            metadata_codec,
            history_codec,
        },
        history,
    };

    writer.write(output_path, &resolve)?;

    if args.progress != "none" {
        print_summary(&progress);
    }

    Ok(if progress.errors.load(Ordering::Relaxed) > 0 { 2 } else { 0 })
}

fn run_debug_filter(mode: &str, tree: &dwarfs::entry::EntryTree) -> Result<i32, Error> {
    if !["all", "files", "included", "excluded"].contains(&mode) {
        return Err(Error::Config(format!("unknown debug-filter mode '{mode}'")));
    }
    tree.walk(|id, e| {
        let show = match &e.kind {
            EntryKind::File { .. } => true,
            _ => mode == "all",
        };
        if show {
            println!("{}", tree.path_of(id).display());
        }
    });
    Ok(0)
}

fn print_summary(progress: &Progress) {
    let errors = progress.errors.load(Ordering::Relaxed);
    eprintln!(
        "scanned: {} dirs, {} files, {} symlinks ({} errors)",
        progress.dirs_scanned.load(Ordering::Relaxed),
        progress.files_scanned.load(Ordering::Relaxed),
        progress.symlinks_scanned.load(Ordering::Relaxed),
        errors,
    );
    eprintln!(
        "original size: {} B, hardlinked: {} B, duplicate: {} B",
        progress.original_size.load(Ordering::Relaxed),
        progress.hardlink_size.load(Ordering::Relaxed),
        progress.duplicate_size.load(Ordering::Relaxed),
    );
    eprintln!(
        "saved by segmentation: {} B; filesystem: {} B in {} blocks / {} chunks",
        progress.saved_by_segmentation.load(Ordering::Relaxed),
        progress.filesystem_size.load(Ordering::Relaxed),
        progress.block_count.load(Ordering::Relaxed),
        progress.chunk_count.load(Ordering::Relaxed),
    );
    eprintln!(
        "compressed size: {} B",
        progress.compressed_size.load(Ordering::Relaxed),
    );
}

// ── Recompress ───────────────────────────────────────────────────────────────

fn run_recompress(args: &Args, mode: &str, output_path: &PathBuf) -> Result<i32, Error> {
    let mode = RecompressMode::parse(mode)
        .ok_or_else(|| Error::Config(format!("unknown recompress mode '{mode}'")))?;

    let mut block_codecs: HashMap<String, Arc<dyn Codec>> = HashMap::new();
    if args.compression.is_empty() {
        block_codecs.insert(String::new(), parse_codec("zstd:level=22")?);
    }
    for entry in &args.compression {
        let (category, spec) = split_entry(entry);
        block_codecs.insert(category.unwrap_or("").to_owned(), parse_codec(spec)?);
    }

    let opts = RecompressOptions {
        mode,
        categories: args
            .recompress_categories
            .as_deref()
            .map(CategoryFilter::parse)
            .unwrap_or_default(),
        block_codecs,
        schema_codec: parse_codec(args.schema_compression.as_deref().unwrap_or("zstd:level=9"))?,
        metadata_codec: parse_codec(args.metadata_compression.as_deref().unwrap_or("null"))?,
        history_codec: parse_codec(args.history_compression.as_deref().unwrap_or("zstd:level=9"))?,
        rebuild_metadata: args.rebuild_metadata.then(MetadataOptions::default),
        remove_header: args.remove_header,
        no_section_index: args.no_section_index,
        no_history: args.no_history,
        history_args: std::env::args().collect(),
    };

    recompress_image(&args.input, output_path, &opts)?;
    Ok(0)
}

// ── Small parsers ────────────────────────────────────────────────────────────

fn parse_set_time(s: Option<&str>) -> Result<Option<u64>, Error> {
    match s {
        None => Ok(None),
        Some("now") => Ok(Some(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        )),
        Some(v) => v
            .parse::<u64>()
            .map(Some)
            .map_err(|_| Error::Config(format!("bad --set-time value '{v}'"))),
    }
}

fn parse_time_resolution(s: Option<&str>) -> Result<u32, Error> {
    Ok(match s {
        None | Some("sec") => 1,
        Some("min") => 60,
        Some("hour") => 3600,
        Some("day") => 86400,
        Some(v) => v
            .parse::<u32>()
            .map_err(|_| Error::Config(format!("bad --time-resolution value '{v}'")))?,
    })
}
