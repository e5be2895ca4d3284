use clap::{Parser, Subcommand};
use imagetask::imaging::{Dimensions, EntropyAnalyzer, ImageBackend, RustBackend};
use imagetask::orchestrator::{Orchestrator, Schedule, SourceImage};
use imagetask::task::Task;
use imagetask::{config, imaging, output};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Parser)]
#[command(name = "imagetask")]
#[command(about = "Run batch image tasks: resize, crop, optimize, rename")]
#[command(long_about = "\
Run batch image tasks: resize, crop, optimize, rename

A task is a JSON file listing processing steps:

  {
    \"name\": \"Instagram\",
    \"steps\": [
      { \"processor\": \"resize\",   \"options\": { \"dimension\": 1080 } },
      { \"processor\": \"crop\",     \"options\": { \"width\": 1080, \"height\": 1080 } },
      { \"processor\": \"optimize\", \"options\": { \"format\": \"webp\", \"quality\": 80 } },
      { \"processor\": \"rename\",   \"options\": { \"pattern\": \"ig-{index}\" } }
    ]
  }

Steps run resize → crop → optimize → rename, then template and favicon,
whatever order they are written in.

Run 'imagetask gen-config' to generate a documented config.toml.")]
#[command(version)]
struct Cli {
    /// Engine config file (defaults apply when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a task over every image in a directory
    Run {
        /// Task JSON file
        #[arg(long)]
        task: PathBuf,
        /// Directory of source images (searched recursively)
        #[arg(long)]
        input: PathBuf,
        /// Output directory
        #[arg(long, default_value = "out")]
        output: PathBuf,
        /// Process images in parallel groups of this size
        #[arg(long)]
        parallel: Option<usize>,
    },
    /// Check a task, optionally simulating it against one image
    Validate {
        #[arg(long)]
        task: PathBuf,
        #[arg(long)]
        image: Option<PathBuf>,
    },
    /// Estimate outputs and processing time
    Estimate {
        #[arg(long)]
        task: PathBuf,
        /// Number of images
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Print a stock config.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let engine = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            task,
            input,
            output: output_dir,
            parallel,
        } => {
            let mut task = load_task(&task)?;
            task.set_cost_model(engine.estimates.clone());
            let images = collect_images(&input);
            if images.is_empty() {
                return Err(format!("no images found in {}", input.display()).into());
            }
            output::print_lines(&output::format_task(&task));

            init_thread_pool(&engine.processing);
            let mut options = engine.run_options();
            if let Some(group_size) = parallel {
                options.schedule = Schedule::Parallel {
                    group_size: group_size.max(1),
                };
            }
            let backend = RustBackend::new();
            let analyzer = EntropyAnalyzer::new(engine.detection.entropy_grid);
            let orchestrator = Orchestrator::new(&backend, &analyzer, options);

            let (tx, rx) = std::sync::mpsc::channel();
            let printer = std::thread::spawn(move || {
                for event in rx {
                    for line in output::format_batch_event(&event) {
                        println!("{}", line);
                    }
                }
            });
            let report = orchestrator.run(&task, &images, &output_dir, Some(tx));
            printer.join().ok();
            let report = report?;

            output::print_lines(&output::format_batch_report(&report));
            let report_path = output_dir.join("report.json");
            std::fs::write(&report_path, serde_json::to_string_pretty(&report)?)?;
            println!("Report: {}", report_path.display());
            if report.summary.failed > 0 {
                std::process::exit(1);
            }
        }
        Command::Validate { task, image } => {
            let task = load_task(&task)?;
            output::print_lines(&output::format_task(&task));
            let dims = match image {
                Some(path) => Some(probe(&RustBackend::new(), &path)?),
                None => None,
            };
            let report = task.validate(dims);
            output::print_lines(&output::format_validation(&report));
            if !report.is_valid() {
                std::process::exit(1);
            }
        }
        Command::Estimate { task, count } => {
            let mut task = load_task(&task)?;
            task.set_cost_model(engine.estimates.clone());
            output::print_lines(&output::format_task(&task));
            output::print_lines(&output::format_estimate(&task, &task.time_estimate(count)));
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .init();
}

/// Initialize the rayon thread pool based on processing config.
///
/// Caps at the number of available CPU cores; config can constrain down, not up.
fn init_thread_pool(processing: &config::ProcessingConfig) {
    let threads = config::effective_threads(processing);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}

fn load_task(path: &Path) -> Result<Task, Box<dyn std::error::Error>> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read task {}: {}", path.display(), e))?;
    Ok(Task::from_json(&json)?)
}

fn probe(
    backend: &dyn ImageBackend,
    path: &Path,
) -> Result<Dimensions, Box<dyn std::error::Error>> {
    Ok(backend.identify(path)?)
}

/// Supported images under `dir`, sorted by path.
fn collect_images(dir: &Path) -> Vec<SourceImage> {
    let supported = imaging::supported_input_extensions();
    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            !e.path()
                .components()
                .any(|c| c.as_os_str() == imagetask::orchestrator::WORK_DIR)
        })
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
                .is_some_and(|ext| supported.contains(&ext.as_str()))
        })
        .map(|e| e.into_path())
        .collect();
    paths.sort();
    paths.into_iter().map(SourceImage::new).collect()
}
