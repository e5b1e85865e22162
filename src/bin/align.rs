//! Align the simulation and real-world training datasets onto one canonical
//! feature table.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use vajra_ddos::dataset::{self, DatasetTable, SourceProfile};
use vajra_ddos::{MissingLabelPolicy, Result};

#[derive(Parser)]
#[command(name = "vajra-align")]
#[command(version)]
#[command(about = "Merge the training datasets into one canonical table", long_about = None)]
struct Cli {
    /// Simulated traffic CSV (`label` column, -1/1)
    #[arg(long)]
    simulation: PathBuf,

    /// Real-world capture CSV (`Label` column, Benign/Normal or attack name)
    #[arg(long)]
    real_world: PathBuf,

    /// Aligned table
    #[arg(long, default_value = "aligned.csv")]
    out: PathBuf,

    /// Where to write the derived feature list
    #[arg(long)]
    features_out: Option<PathBuf>,

    /// What to do with a missing label: reject or benign
    #[arg(long, default_value = "reject")]
    missing_label: MissingLabelPolicy,

    /// Use this feature list instead of deriving one
    #[arg(long)]
    features: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let simulation = DatasetTable::from_path(&cli.simulation)?;
    let real_world = DatasetTable::from_path(&cli.real_world)?;
    info!("Simulation dataset: {} rows, {} columns", simulation.len(), simulation.headers.len());
    info!("Real-world dataset: {} rows, {} columns", real_world.len(), real_world.headers.len());

    let tables = vec![
        dataset::prepare(simulation, &SourceProfile::simulation()),
        dataset::prepare(real_world, &SourceProfile::real_world()),
    ];

    let features = match &cli.features {
        Some(path) => dataset::read_feature_list(path)?,
        None => dataset::derive_feature_list(&tables),
    };
    info!("Columns used for training: {:?}", features);

    let aligned = dataset::align_tables(&tables, features, cli.missing_label)?;
    aligned.write_csv(&cli.out)?;
    info!(
        "Wrote {} rows ({} attack) to {}",
        aligned.len(),
        aligned.attacks(),
        cli.out.display()
    );

    if let Some(path) = &cli.features_out {
        dataset::write_feature_list(path, &aligned.feature_names)?;
        info!("Feature list saved to {}", path.display());
    }
    Ok(())
}
