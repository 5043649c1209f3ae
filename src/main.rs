use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use kvfinder_web_client::app_state::AppState;
use kvfinder_web_client::config::AppConfig;
use kvfinder_web_client::models::job::JobRecord;
use kvfinder_web_client::models::settings::{Resolution, Settings};
use kvfinder_web_client::services::controller::JobController;
use kvfinder_web_client::services::reconcile::JobEvent;

#[derive(Parser, Debug)]
#[command(name = "kvfinder", version, about = "Submit and track KVFinder-web cavity detection jobs")]
struct Cli {
    /// KVFinder-web server URL (overrides KVFINDER_SERVER_URL)
    #[arg(long, global = true)]
    server: Option<String>,

    /// Directory receiving exported results (overrides KVFINDER_OUTPUT_DIR)
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a structure for cavity detection
    Submit(SubmitArgs),
    /// Track a job submitted elsewhere by its id
    Add { id: String },
    /// Show the locally stored state of a job
    Status { id: String },
    /// List tracked job ids
    List,
    /// Check whether the service answers
    Ping,
    /// Poll tracked jobs and export results until interrupted
    Watch {
        /// Acknowledge expired jobs right away so their records are removed
        #[arg(long)]
        ack_expired: bool,
    },
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// Protein structure (PDB)
    pdb: PathBuf,

    /// Ligand structure (PDB); enables ligand mode
    #[arg(long)]
    ligand: Option<PathBuf>,

    #[arg(long)]
    probe_in: Option<f64>,

    #[arg(long)]
    probe_out: Option<f64>,

    #[arg(long)]
    removal_distance: Option<f64>,

    #[arg(long)]
    volume_cutoff: Option<f64>,

    /// Grid resolution: low, medium or high
    #[arg(long)]
    resolution: Option<Resolution>,
}

impl SubmitArgs {
    fn settings(&self) -> Settings {
        let mut settings = Settings::default();
        if let Some(probe_in) = self.probe_in {
            settings.probes.probe_in = probe_in;
        }
        if let Some(probe_out) = self.probe_out {
            settings.probes.probe_out = probe_out;
        }
        if let Some(removal_distance) = self.removal_distance {
            settings.cutoffs.removal_distance = removal_distance;
        }
        if let Some(volume_cutoff) = self.volume_cutoff {
            settings.cutoffs.volume_cutoff = volume_cutoff;
        }
        if let Some(resolution) = self.resolution {
            settings.modes.resolution_mode = resolution;
        }
        settings
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut config = AppConfig::from_env()?;
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    if let Some(output_dir) = cli.output_dir {
        config.output_dir = output_dir;
    }

    init_tracing(config.log_json);

    let state = AppState::from_config(&config)?;
    let mut controller = JobController::new(state.clone(), config.output_dir.clone(), config.reconcile_settings())?;

    match cli.command {
        Command::Submit(args) => {
            let settings = args.settings();
            let record = controller
                .submit(Some(&args.pdb), args.ligand.as_deref(), settings)
                .await?;
            print_record(&record);
        }
        Command::Add { id } => print_record(&controller.add_existing(&id)?),
        Command::Status { id } => print_record(&controller.status(&id)?),
        Command::List => {
            for id in controller.tracked_ids()? {
                match controller.status(&id) {
                    Ok(record) => println!("{}\t{}", id, record.status()),
                    Err(e) => println!("{}\tunreadable ({})", id, e),
                }
            }
        }
        Command::Ping => {
            if state.client.ping().await {
                println!("{} is up", state.client.base_url());
            } else {
                println!("{} is down", state.client.base_url());
                std::process::exit(1);
            }
        }
        Command::Watch { ack_expired } => {
            controller.start();
            watch(&mut controller, ack_expired).await?;
            controller.shutdown().await;
        }
    }

    Ok(())
}

async fn watch(controller: &mut JobController, ack_expired: bool) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(output_dir = %controller.output_dir().display(), "Watching jobs, press Ctrl-C to stop");
    loop {
        let event = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                tracing::info!("Interrupted, stopping");
                return Ok(());
            }
            event = controller.next_event() => event,
        };
        let Some(event) = event else { return Ok(()) };

        match event {
            JobEvent::Updated { id, status } => println!("{}: {}", id, status),
            JobEvent::Exported { id, dir } => println!("{}: results saved to {}", id, dir.display()),
            JobEvent::ExportFailed { id, error } => println!("{}: export failed: {}", id, error),
            JobEvent::Failed { id } => println!("{}: failed on the server", id),
            JobEvent::Expired { id } => {
                println!("{}: no longer available on the server", id);
                if ack_expired {
                    controller.acknowledge(&id)?;
                }
            }
            JobEvent::ServiceDown => println!("service unreachable"),
            JobEvent::ServiceUp => println!("service reachable"),
        }
    }
}

fn print_record(record: &JobRecord) {
    println!("id:      {}", record.id().unwrap_or("-"));
    println!("status:  {}", record.status());
    if let Some(pdb) = &record.files.pdb {
        println!("pdb:     {}", pdb.display());
    }
    if let Some(ligand) = &record.files.ligand {
        println!("ligand:  {}", ligand.display());
    }
    println!("output:  {}", record.files.output.display());
    if let Some(at) = record.submitted_at {
        println!("submitted: {}", at.to_rfc3339());
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
