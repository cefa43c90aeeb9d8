use std::fs;
use std::num::NonZeroUsize;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use qvectors::args::{Cli, Command, RunArgs, WeightsArgs};
use qvectors::event::EventReader;
use qvectors::geom::ChannelPositions;
use qvectors::output::{table_path, Cell, OutputTables, TableWriter};
use qvectors::qa::QA_JSON;
use qvectors::store::{now_ms, LocalStore, MemoryStore, ObjectStore};
use qvectors::task::QvecTask;
use qvectors::taskfile::{parse_task_file, TaskFileData};
use qvectors::weights::{weight_columns, WeightSource, WeightsLoader, WEIGHTS_TABLE};

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn configure_threads(cpu: Option<usize>) -> Result<()> {
    let Some(cpu) = cpu else {
        return Ok(());
    };
    let available = std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    if cpu == 0 {
        bail!("--cpu must be at least 1");
    }
    if cpu > available {
        bail!("--cpu value ({cpu}) exceeds the number of available cores ({available})");
    }
    rayon::ThreadPoolBuilder::new()
        .num_threads(cpu)
        .build_global()
        .context("failed to configure the worker pool")?;
    Ok(())
}

fn run(mut args: RunArgs, task_file: Option<&TaskFileData>) -> Result<()> {
    if let Some(file) = task_file {
        args.apply_task_file(file);
    }
    let config = args.task_config()?;
    let store_root = args
        .store
        .clone()
        .context("a calibration store is required (--store or 'store' in the task file)")?;
    let geometry = args
        .geometry
        .clone()
        .context("channel geometry is required (--geometry or 'geometry' in the task file)")?;
    let positions = ChannelPositions::load(&geometry)
        .with_context(|| format!("failed to load geometry {}", geometry.display()))?;
    let store = LocalStore::new(&store_root, args.no_later_than.unwrap_or_else(now_ms));
    info!("[store] using {}", store.root().display());

    fs::create_dir_all(&args.output)
        .with_context(|| format!("failed to create {}", args.output.display()))?;
    let enabled = config.enabled;
    let mut task = QvecTask::new(config, positions)?;
    let mut tables = OutputTables::create(&args.output, &enabled)?;

    let reader = EventReader::open(&args.events)
        .with_context(|| format!("failed to open {}", args.events.display()))?;
    for event in reader {
        let event = event?;
        let out = task.process(&store, &event)?;
        tables.write_event(&out)?;
    }

    for path in tables.finalize()? {
        info!("[output] wrote {}", path.display());
    }
    task.qa().write_json(&args.output.join(QA_JSON))?;
    if !args.no_plots {
        for path in task.qa().plot(&args.output) {
            info!("[qa] plotted {}", path.display());
        }
    }
    task.log_summary();
    Ok(())
}

fn weights(mut args: WeightsArgs, task_file: Option<&TaskFileData>) -> Result<()> {
    if let Some(file) = task_file {
        if args.store.is_none() {
            args.store.clone_from(&file.store);
        }
        if args.no_later_than.is_none() {
            args.no_later_than = file.no_later_than;
        }
    }
    let source = WeightSource::parse(&args.source, &args.key, args.by_run)?;
    let store: Box<dyn ObjectStore> = match (&source, &args.store) {
        (WeightSource::Store { .. }, None) => {
            bail!("weight source '{}' needs a calibration store (--store)", args.source)
        }
        (_, Some(root)) => Box::new(LocalStore::new(
            root,
            args.no_later_than.unwrap_or_else(now_ms),
        )),
        (WeightSource::LocalFile(_), None) => Box::new(MemoryStore::new()),
    };
    let mut loader = WeightsLoader::new(source)?;

    fs::create_dir_all(&args.output)
        .with_context(|| format!("failed to create {}", args.output.display()))?;
    let mut table = TableWriter::create(
        &table_path(&args.output, WEIGHTS_TABLE),
        WEIGHTS_TABLE,
        weight_columns(),
    )?;
    let reader = EventReader::open(&args.events)
        .with_context(|| format!("failed to open {}", args.events.display()))?;
    let mut events = 0u64;
    for event in reader {
        let event = event?;
        for w in loader.weights_for(store.as_ref(), &event)? {
            table.write_row(&[Cell::F32(w.phi_weight), Cell::F32(w.eff_weight)])?;
        }
        events += 1;
    }
    if loader.load_count() > 0 && !loader.has_map() {
        warn!("[weights] last run had no weight map; unit weights were written");
    }
    let rows = table.rows_written();
    let path = table.finalize()?;
    info!(
        "[weights] {} events, {} tracks -> {}",
        events,
        rows,
        path.display()
    );
    Ok(())
}

fn main() -> Result<()> {
    if std::env::args_os().len() == 1 {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    }

    let cli = Cli::parse();
    init_logging(cli.debug);
    configure_threads(cli.cpu)?;

    let task_file = match &cli.config {
        Some(path) => Some(
            parse_task_file(path)
                .with_context(|| format!("failed to read task file {}", path.display()))?,
        ),
        None => None,
    };

    match cli.command {
        Command::Run(args) => run(args, task_file.as_ref()),
        Command::Weights(args) => weights(args, task_file.as_ref()),
    }
}
