use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{debug, error, info};

use vajra_ddos::capture::{self, LiveCapture};
use vajra_ddos::{
    ArtifactBundle, ConsoleSink, DetectionRuntime, DetectorConfig, DetectorError, Mode, Result,
};

/// Real-time and offline DDoS detection over captured packets.
#[derive(Parser)]
#[command(name = "vajra")]
#[command(version)]
#[command(about = "Classify packets as normal or DDoS traffic", long_about = None)]
struct Cli {
    /// live: capture from an interface; offline: replay a pcap file
    #[arg(long, value_enum, required_unless_present = "list_interfaces")]
    mode: Option<Mode>,

    /// Capture file for offline mode
    #[arg(long)]
    pcap: Option<PathBuf>,

    /// Prediction table written in offline mode
    #[arg(long, default_value = "predictions.csv")]
    out: PathBuf,

    /// Maximum number of packets analysed in offline mode
    #[arg(long, default_value_t = 500)]
    max: usize,

    /// Directory holding the model, scaler and feature list
    #[arg(long, env = "VAJRA_ARTIFACTS", default_value = ".")]
    artifacts: PathBuf,

    /// Interface to capture on in live mode
    #[arg(long, short)]
    interface: Option<String>,

    /// Print the capture interfaces and exit
    #[arg(long)]
    list_interfaces: bool,

    /// Threads used to score offline batches
    #[arg(long)]
    workers: Option<usize>,
}

impl Cli {
    fn into_config(self, mode: Mode) -> DetectorConfig {
        let defaults = DetectorConfig::default();
        DetectorConfig {
            mode,
            artifact_dir: self.artifacts,
            pcap: self.pcap,
            output: self.out,
            max_packets: self.max,
            interface: self.interface,
            workers: self.workers.unwrap_or(defaults.workers),
            ..defaults
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if cli.list_interfaces {
        println!("Available Network Interfaces:");
        for line in capture::describe_interfaces() {
            println!("{}", line);
        }
        return ExitCode::SUCCESS;
    }

    let Some(mode) = cli.mode else {
        eprintln!("--mode is required");
        return ExitCode::from(2);
    };
    let config = cli.into_config(mode);

    if let Err(e) = config.validate() {
        eprintln!("{}", e);
        return ExitCode::from(2);
    }

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if !e.is_fatal() => {
            eprintln!("{}", e);
            ExitCode::from(2)
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config: &DetectorConfig) -> Result<()> {
    info!("Loading trained model from {}", config.artifact_dir.display());
    let bundle = ArtifactBundle::load(&config.artifact_dir, config.workers)?;

    let runtime = DetectionRuntime::new(&bundle).with_batch_size(config.batch_size);
    let stop = runtime.stop_handle();
    ctrlc::set_handler(move || {
        if stop.request_stop() {
            eprintln!("\nCtrl+C received, stopping...");
        }
    })?;

    let summary = match config.mode {
        Mode::Live => {
            let interface = capture::select_interface(config.interface.as_deref())?;
            let mut source = LiveCapture::open(&interface, config.poll_interval, config.channel_capacity)?;
            info!("Capturing on {}... Press Ctrl+C to stop", source.interface());
            let mut sink = ConsoleSink::stdout();
            runtime.run_live(&mut source, &mut sink)?
        }
        Mode::Offline => {
            let pcap = config
                .pcap
                .as_deref()
                .ok_or_else(|| DetectorError::UserInput("please provide --pcap <path> for offline mode".to_string()))?;
            runtime.run_offline_file(pcap, &config.output, config.max_packets)?
        }
    };
    debug!("Run summary: {}", serde_json::to_string(&summary)?);
    Ok(())
}
