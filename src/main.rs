//! sensor-frames CLI
//!
//! Multi-channel sensor acquisition for gesture training.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use sensor_frames::{
    config::{Config, SourceKind},
    control::{
        command_channel, send_request, ChannelCommands, Command, ControlRequest, ControlServer,
        FileCommandSlot, FileLabelSlot, LabelChain, LabelSource, LivenessGuard, LivenessToken,
        SharedLabel,
    },
    core::{compile_training_set, FeatureKind},
    pipeline::{Pipeline, PipelineSettings, RunOutcome},
    source::{
        serial::{find_preferred_port, open_serial_port},
        FrameSource, FrameSynchronizer, LineSource, RecordLayout, SensorMultiplexer, UdpPacketSource,
    },
    stats::{create_shared_stats_with_persistence, read_persisted, SharedStats},
    store::LabelStore,
    VERSION,
};

#[derive(Parser)]
#[command(name = "sensor-frames")]
#[command(version = VERSION)]
#[command(about = "Multi-channel sensor acquisition for gesture training", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the acquisition loop
    Run {
        /// Sensor source (serial, udp, line, audio, or ble)
        #[arg(long, default_value = "serial")]
        source: String,

        /// Serial port path (auto-detected if not specified)
        #[arg(long)]
        port: Option<String>,

        /// Label for saved collections (can be changed with `send label`)
        #[arg(long)]
        label: Option<String>,
    },

    /// Send a control request to a running acquisition process
    Send {
        /// start, stop, exit, or `label <name>`
        #[arg(required = true, num_args = 1..)]
        request: Vec<String>,

        /// Write to the file slots instead of the control socket
        #[arg(long)]
        via_file: bool,
    },

    /// Remove the most recent collection for a label
    DeleteLast {
        #[arg(long)]
        label: String,
    },

    /// Show stored collections and acquisition status
    Status,

    /// Featurize stored collections into a training set
    Compile {
        /// Labels to include (default: every stored label)
        #[arg(long, value_delimiter = ',')]
        labels: Vec<String>,

        /// Feature kind (overrides the configuration)
        #[arg(long)]
        kind: Option<String>,

        /// Number of bins (overrides the configuration)
        #[arg(long)]
        bins: Option<usize>,

        /// Output directory (default: the data directory)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Show configuration
    Config,

    /// List serial ports
    Ports,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            source,
            port,
            label,
        } => cmd_run(&source, port, label),
        Commands::Send { request, via_file } => cmd_send(&request, via_file),
        Commands::DeleteLast { label } => cmd_delete_last(&label),
        Commands::Status => cmd_status(),
        Commands::Compile {
            labels,
            kind,
            bins,
            output,
        } => cmd_compile(labels, kind, bins, output),
        Commands::Config => cmd_config(),
        Commands::Ports => cmd_ports(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Everything a pipeline needs besides its source.
struct Session {
    config: Config,
    settings: PipelineSettings,
    store: LabelStore,
    label: Arc<dyn LabelSource>,
    commands: ChannelCommands,
    stats: SharedStats,
}

fn cmd_run(source: &str, port: Option<String>, label: Option<String>) -> Result<()> {
    let config = Config::load().context("loading configuration")?;
    config.validate()?;
    let kind: SourceKind = source.parse()?;
    config
        .ensure_directories()
        .context("creating data directories")?;

    println!("sensor-frames v{VERSION}");
    println!();

    if let Err(e) = config.features.validate(config.acquisition.frame_length) {
        tracing::warn!(error = %e, "featurization settings will not work with this frame length");
    }

    let (sender, commands) = command_channel();
    let interrupt = sender.clone();
    ctrlc::set_handler(move || {
        interrupt.send(Command::Exit);
    })
    .context("installing Ctrl+C handler")?;

    let shared_label = SharedLabel::new(label);
    let mut label_sources: Vec<Box<dyn LabelSource>> = vec![Box::new(shared_label.clone())];
    if let Some(path) = &config.control.label_slot {
        label_sources.push(Box::new(FileLabelSlot::new(path)));
    }

    let _server = ControlServer::spawn(config.control.bind, sender, shared_label)
        .with_context(|| format!("starting control server on {}", config.control.bind))?;

    let session = Session {
        settings: PipelineSettings::from_config(&config),
        store: LabelStore::new(config.store_path()),
        label: Arc::new(LabelChain::new(label_sources)),
        commands,
        stats: create_shared_stats_with_persistence(config.stats_path()),
        config,
    };

    println!("Source: {kind}");
    println!("  Instances per collection: {}", session.settings.instances);
    println!("  Frame length: {}", session.settings.frame_length);
    println!("  Control: {}", session.config.control.bind);
    println!();
    println!("Send `sensor-frames send start` to collect, Ctrl+C to stop");
    println!();

    match kind {
        SourceKind::Serial => {
            let serial = &session.config.serial;
            let path = port
                .or_else(|| serial.port.clone())
                .or_else(find_preferred_port)
                .context("no serial port found")?;
            let (baud_rate, read_timeout) = (serial.baud_rate, serial.read_timeout);
            let reader = open_serial_port(&path, baud_rate, read_timeout).with_context(|| format!("opening {path}"))?;
            let layout = RecordLayout::new(serial.samples_per_record, session.config.acquisition.channels);
            let source = FrameSynchronizer::new(reader, layout)
                .with_description(format!("serial:{path}"))
                .with_reopen(reopen_serial(path, baud_rate, read_timeout));
            run_pipeline(source, session)
        }
        SourceKind::Udp => {
            let udp = &session.config.udp;
            let packets = UdpPacketSource::bind(udp.bind).with_context(|| format!("binding {}", udp.bind))?;
            let source = SensorMultiplexer::new(packets, session.settings.frame_length, udp.timeout);
            run_pipeline(source, session)
        }
        SourceKind::Line => {
            let line = &session.config.line;
            let path = port
                .or_else(|| line.port.clone())
                .or_else(find_preferred_port)
                .context("no serial port found")?;
            let baud_rate = line.baud_rate;
            let reader = open_serial_port(&path, baud_rate, LINE_READ_TIMEOUT).with_context(|| format!("opening {path}"))?;
            let source = LineSource::new(reader)
                .with_description(format!("line:{path}"))
                .with_reopen(reopen_serial(path, baud_rate, LINE_READ_TIMEOUT));

            let (overlap, frame_length) = (Some(line.overlap), line.frame_length);
            let mut session = session;
            session.settings = session
                .settings
                .with_overlap(overlap)
                .with_frame_length(frame_length);
            run_pipeline(source, session)
        }
        SourceKind::Audio => run_audio(session),
        SourceKind::Ble => run_ble(session),
    }
}

const LINE_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Reopen a serial port by path after it dropped off the bus.
fn reopen_serial(
    path: String,
    baud_rate: u32,
    read_timeout: Duration,
) -> impl FnMut() -> std::io::Result<Box<dyn serialport::SerialPort>> + Send + 'static {
    move || open_serial_port(&path, baud_rate, read_timeout).map_err(std::io::Error::from)
}

#[cfg(feature = "audio")]
fn run_audio(session: Session) -> Result<()> {
    use sensor_frames::source::audio::AudioSource;

    let audio = &session.config.audio;
    let source = AudioSource::open(
        audio.channels,
        audio.sample_rate,
        session.settings.frame_length,
        audio.timeout,
    )?;
    run_pipeline(source, session)
}

#[cfg(not(feature = "audio"))]
fn run_audio(_session: Session) -> Result<()> {
    bail!("audio capture requires building with `--features audio`")
}

#[cfg(feature = "ble")]
fn run_ble(session: Session) -> Result<()> {
    use sensor_frames::source::ble::BtleplugLink;
    use sensor_frames::source::BlePacketSource;

    let ble = &session.config.ble;
    println!("Scanning for service {}...", ble.service);
    let link = BtleplugLink::new(ble).context("starting bluetooth runtime")?;
    let device = ble.device_name.clone().unwrap_or_else(|| ble.service.to_string());
    let packets = BlePacketSource::connect(device, link).context("connecting to ble sensor")?;
    let source = SensorMultiplexer::new(packets, session.settings.frame_length, ble.timeout);
    run_pipeline(source, session)
}

#[cfg(not(feature = "ble"))]
fn run_ble(_session: Session) -> Result<()> {
    bail!("bluetooth capture requires building with `--features ble`")
}

fn run_pipeline<S: FrameSource>(source: S, session: Session) -> Result<()> {
    let Session {
        config,
        settings,
        store,
        label,
        commands,
        stats,
    } = session;

    let _liveness = LivenessGuard::publish(config.liveness_path(), LivenessToken::new(source.describe()))
        .context("writing liveness token")?;

    let mut pipeline = Pipeline::new(source, settings, store, label, stats.clone()).with_commands(commands);
    if let Some(path) = &config.control.command_slot {
        pipeline = pipeline.with_commands(FileCommandSlot::new(path));
    }
    if config.acquisition.preview {
        pipeline = pipeline.with_preview(sensor_frames::store::PreviewSink::new(
            config.preview_path(),
            config.acquisition.tag_columns,
        ));
    }

    let outcome = pipeline.run();

    println!();
    println!("{}", stats.summary());

    match outcome? {
        RunOutcome::Stopped(command) => {
            tracing::info!(%command, "stopped by request");
            Ok(())
        }
        RunOutcome::EndOfStream => bail!("sensor stream ended"),
    }
}

fn cmd_send(words: &[String], via_file: bool) -> Result<()> {
    let request = parse_request(words)?;
    let config = Config::load().unwrap_or_default();

    if via_file {
        match &request {
            ControlRequest::Command(command) => {
                let path = config
                    .control
                    .command_slot
                    .as_ref()
                    .context("control.command_slot is not configured")?;
                FileCommandSlot::new(path).write(*command)?;
            }
            ControlRequest::SetLabel(label) => {
                let path = config
                    .control
                    .label_slot
                    .as_ref()
                    .context("control.label_slot is not configured")?;
                FileLabelSlot::new(path).write(label)?;
            }
        }
        println!("Wrote {}", request.encode());
        return Ok(());
    }

    let reply = send_request(config.control.bind, &request, Duration::from_secs(2))?;
    println!("{reply}");
    Ok(())
}

fn parse_request(words: &[String]) -> Result<ControlRequest> {
    let text = match words.first().map(|w| w.to_lowercase()).as_deref() {
        Some("start") => "START_COLLECTING".to_string(),
        _ => words.join(" "),
    };
    Ok(ControlRequest::parse(&text)?)
}

fn cmd_delete_last(label: &str) -> Result<()> {
    let config = Config::load().unwrap_or_default();
    let store = LabelStore::new(config.store_path());

    match store.delete_last(label)? {
        Some(remaining) => println!("Deleted last collection for '{label}' ({remaining} remaining)"),
        None => println!("No collections stored for '{label}'"),
    }
    Ok(())
}

fn cmd_status() -> Result<()> {
    let config = Config::load().unwrap_or_default();
    let store = LabelStore::new(config.store_path());

    println!("sensor-frames Status");
    println!("====================");
    println!();

    match LivenessToken::read(&config.liveness_path()) {
        Ok(Some(token)) => println!(
            "Acquisition: running (pid {}, {}, since {})",
            token.pid,
            token.source,
            token.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        Ok(None) => println!("Acquisition: not running"),
        Err(e) => println!("Acquisition: unknown ({e})"),
    }
    println!();

    let labels = store.labels()?;
    if labels.is_empty() {
        println!("No collections stored in {:?}", store.root());
    } else {
        println!("Stored collections:");
        for label in &labels {
            println!("  {label}: {}", store.event_count(label)?);
        }
    }
    println!();

    match read_persisted(&config.stats_path()) {
        Ok(Some(stats)) => {
            println!("Cumulative Statistics:");
            println!("  Frames synchronized: {}", stats.frames_synced);
            println!("  Groups discarded: {}", stats.groups_discarded);
            println!("  Corrupt packets: {}", stats.corrupt_packets);
            println!("  Windows emitted: {}", stats.windows_emitted);
            println!("  Short windows skipped: {}", stats.short_windows);
            println!("  Collections saved: {}", stats.collections_saved);
            println!("  Flush failures: {}", stats.flush_failures);
            println!("  Reconnects: {}", stats.reconnects);
        }
        Ok(None) => println!("No previous session data found."),
        Err(e) => println!("Could not read statistics: {e}"),
    }
    Ok(())
}

fn cmd_compile(
    labels: Vec<String>,
    kind: Option<String>,
    bins: Option<usize>,
    output: Option<PathBuf>,
) -> Result<()> {
    let config = Config::load().unwrap_or_default();
    let store = LabelStore::new(config.store_path());

    let mut features = config.features.clone();
    if let Some(kind) = kind {
        features.kind = kind.parse::<FeatureKind>()?;
    }
    if let Some(bins) = bins {
        features.num_bins = bins;
    }

    let labels = if labels.is_empty() { store.labels()? } else { labels };
    if labels.is_empty() {
        bail!("no stored collections in {:?}", store.root());
    }

    let set = compile_training_set(&store, &labels, &features, config.acquisition.tag_columns)?;
    let dir = output.unwrap_or_else(|| config.data_path.clone());
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {dir:?}"))?;
    let (features_path, labels_path) = set.write(&dir, &features)?;

    println!(
        "Compiled {} instances x {} features ({} over {} bins)",
        set.features.nrows(),
        set.features.ncols(),
        features.kind,
        features.num_bins
    );
    println!("  Features: {features_path:?}");
    println!("  Labels: {labels_path:?}");
    Ok(())
}

fn cmd_config() -> Result<()> {
    let config = Config::load().unwrap_or_default();

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!("Data directory: {:?}", config.data_path);
    println!("Store directory: {:?}", config.store_path());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn cmd_ports() -> Result<()> {
    let ports = serialport::available_ports().context("listing serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}", port.port_name);
    }
    if let Some(preferred) = find_preferred_port() {
        println!();
        println!("Preferred: {preferred}");
    }
    Ok(())
}
