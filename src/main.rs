use clap::{Args, Parser, Subcommand};
use prepost::config::Config;
use prepost::diagram::write_diagram;
use prepost::download::HttpTransport;
use prepost::pipeline::{plot_idata, run_pipeline, summarize_idata};
use prepost::summary::global_parameter_table;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "prepost")]
#[command(about = "Bayesian hierarchical pre/post model for multi-instrument scores", long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// error, warn, info, debug or trace.
    #[arg(long = "log-level", global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch the dataset, fit the model and write draws and tables.
    Run(RunArgs),
    /// Summarize persisted draws.
    Summarize(SummarizeArgs),
    /// Draw trace and forest figures from persisted draws.
    Plot(PlotArgs),
    /// Write the model structure as a Graphviz DOT file.
    Diagram(DiagramArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long = "config")]
    config: PathBuf,
}

#[derive(Args, Debug)]
struct SummarizeArgs {
    #[arg(long = "idata")]
    idata: PathBuf,
    #[arg(long = "outdir", default_value = "results")]
    outdir: PathBuf,
    #[arg(long = "hdi-prob", default_value_t = 0.95)]
    hdi_prob: f64,
}

#[derive(Args, Debug)]
struct PlotArgs {
    #[arg(long = "idata")]
    idata: PathBuf,
    #[arg(long = "outdir", default_value = "results")]
    outdir: PathBuf,
    #[arg(long = "hdi-prob", default_value_t = 0.95)]
    hdi_prob: f64,
}

#[derive(Args, Debug)]
struct DiagramArgs {
    #[arg(long = "out", default_value = "docs/model_diagram.dot")]
    out: PathBuf,
}

fn init_logging(level: &str) {
    let filter = level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Warning: invalid log level '{level}'; defaulting to info.");
        log::LevelFilter::Info
    });
    env_logger::Builder::new()
        .filter_level(filter)
        .format_timestamp_micros()
        .init();
}

fn check_hdi_prob(p: f64) -> Result<(), String> {
    if p > 0.0 && p < 1.0 {
        Ok(())
    } else {
        Err(format!("--hdi-prob must be in (0, 1), got {p}"))
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    match cli.command {
        Command::Run(args) => run_fit(args),
        Command::Summarize(args) => run_summarize(args),
        Command::Plot(args) => run_plot(args),
        Command::Diagram(args) => run_diagram(args),
    }
}

fn run_fit(args: RunArgs) -> Result<(), String> {
    let config = Config::from_path(&args.config).map_err(|e| e.to_string())?;
    let outcome = run_pipeline(&config, &HttpTransport::new()).map_err(|e| e.to_string())?;
    println!("Global parameters:");
    println!(
        "{}",
        global_parameter_table(&outcome.summary_rows, config.model.hdi_prob)
    );
    if let Some(path) = &outcome.idata {
        println!("draws: {}", path.display());
    }
    if let Some(path) = &outcome.summary {
        println!("summary: {}", path.display());
    }
    if let Some(path) = &outcome.slope_table {
        println!("slopes: {}", path.display());
    }
    Ok(())
}

fn run_summarize(args: SummarizeArgs) -> Result<(), String> {
    check_hdi_prob(args.hdi_prob)?;
    let outcome =
        summarize_idata(&args.idata, &args.outdir, args.hdi_prob).map_err(|e| e.to_string())?;
    println!("Global parameters:");
    println!("{}", global_parameter_table(&outcome.rows, args.hdi_prob));
    println!("summary: {}", outcome.summary.display());
    if let Some(path) = &outcome.slope_table {
        println!("slopes: {}", path.display());
    }
    Ok(())
}

fn run_plot(args: PlotArgs) -> Result<(), String> {
    check_hdi_prob(args.hdi_prob)?;
    let written = plot_idata(&args.idata, &args.outdir, args.hdi_prob).map_err(|e| e.to_string())?;
    for path in written {
        println!("figure: {}", path.display());
    }
    Ok(())
}

fn run_diagram(args: DiagramArgs) -> Result<(), String> {
    write_diagram(&args.out).map_err(|e| e.to_string())?;
    println!("diagram: {}", args.out.display());
    Ok(())
}
