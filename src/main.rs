use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use voice_led_edge::{
    actuator::{
        AccentOutput, ActuatorMapper, Actuators, BlinkController, FadeConfig, MappingPreset,
        OutputBackend, Outputs, RuleTable, SimulatedOutputs,
    },
    capture::{
        CpalSegmentSource, CpalSourceConfig, SegmentSource, WavSegmentSource, WavSourceConfig,
        WindowAssembler, WindowGeometry,
    },
    classifier::{ClassifierAdapter, SampleEncoding, TfliteClassifier},
    config::{load_model_paths, load_rule_table, CapturePolicy, Config},
    controller::{spawn_blinker, spawn_ticker, CaptureController, InterruptFlags},
    led_ring::LedRingOutputs,
    EdgeError, Result as EdgeResult,
};

/// Where window samples come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Source {
    /// Live input device
    Mic,
    /// A mono 16-bit WAV file, replayed in a loop
    Wav,
}

/// Where actuator output goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputKind {
    /// In-memory pins, reported through the log
    Sim,
    /// ReSpeaker USB LED ring
    #[value(name = "led-ring")]
    LedRing,
}

#[derive(Parser, Debug)]
#[command(version, about = "Classify fixed audio windows and drive indicator LEDs")]
struct Args {
    /// Sample source
    #[arg(long, value_enum, default_value = "mic")]
    source: Source,

    /// WAV file for `--source wav`
    #[arg(long)]
    wav: Option<PathBuf>,

    /// Replay the WAV file at the capture rate instead of as fast as possible
    #[arg(long)]
    realtime: bool,

    /// Input device name (default device if omitted)
    #[arg(long)]
    device: Option<String>,

    /// Input channel to keep
    #[arg(long, default_value_t = 0)]
    channel: u16,

    /// TensorFlow Lite model (or EDGE_MODEL_PATH)
    #[arg(long)]
    model: Option<PathBuf>,

    /// Label file, one label per line (or EDGE_LABELS_PATH)
    #[arg(long)]
    labels: Option<PathBuf>,

    /// JSON rule table; overrides --preset
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Built-in rule table
    #[arg(long, value_enum, default_value = "lights")]
    preset: MappingPreset,

    /// When capture cycles start
    #[arg(long, value_enum, default_value = "timer")]
    policy: CapturePolicy,

    /// Capture tick period in milliseconds
    #[arg(long, default_value_t = 3000)]
    capture_period_ms: u64,

    /// Blink tick period in milliseconds
    #[arg(long, default_value_t = 500)]
    blink_period_ms: u64,

    /// Fade step size in percent
    #[arg(long, default_value_t = 1)]
    fade_step: u8,

    /// Time between fade steps in milliseconds
    #[arg(long, default_value_t = 5)]
    fade_interval_ms: u64,

    /// Samples per classifier window
    #[arg(long, default_value_t = 16_000)]
    window: usize,

    /// Samples per segment transfer
    #[arg(long, default_value_t = 1_000)]
    segment: usize,

    /// Capture sample rate in Hz
    #[arg(long, default_value_t = 16_000)]
    sample_rate: u32,

    /// Accent channel output
    #[arg(long, value_enum, default_value = "pwm")]
    accent: AccentOutput,

    /// Sample encoding handed to the classifier
    #[arg(long, value_enum, default_value = "normalized")]
    encoding: SampleEncoding,

    /// Discard classifications slower than this (0 disables)
    #[arg(long, default_value_t = 2000)]
    classify_budget_ms: u64,

    /// Actuator backend
    #[arg(long, value_enum, default_value = "sim")]
    outputs: OutputKind,
}

impl Args {
    fn config(&self) -> EdgeResult<Config> {
        let rules = match &self.rules {
            Some(path) => load_rule_table(path)?,
            None => RuleTable::preset(self.preset),
        };

        let config = Config {
            sample_rate: self.sample_rate,
            window: WindowGeometry::new(self.window, self.segment),
            capture_policy: self.policy,
            capture_period: Duration::from_millis(self.capture_period_ms),
            blink_period: Duration::from_millis(self.blink_period_ms),
            fade: FadeConfig {
                step_percent: self.fade_step,
                step_interval: Duration::from_millis(self.fade_interval_ms),
            },
            accent_output: self.accent,
            input_encoding: self.encoding,
            classify_budget: (self.classify_budget_ms > 0)
                .then(|| Duration::from_millis(self.classify_budget_ms)),
            rules,
        };
        config.validate()?;
        Ok(config)
    }
}

fn open_source(args: &Args, config: &Config) -> EdgeResult<Box<dyn SegmentSource>> {
    match args.source {
        Source::Mic => {
            let source = CpalSegmentSource::open(CpalSourceConfig {
                device_name: args.device.clone(),
                sample_rate: config.sample_rate,
                channel: args.channel,
            })?;
            log::info!("🎤 Capturing from microphone");
            Ok(Box::new(source))
        }
        Source::Wav => {
            let path = args
                .wav
                .clone()
                .ok_or_else(|| EdgeError::Audio("--source wav needs --wav <FILE>".into()))?;
            Ok(Box::new(WavSegmentSource::open(WavSourceConfig {
                path,
                sample_rate: config.sample_rate,
                realtime: args.realtime,
            })?))
        }
    }
}

fn open_outputs(kind: OutputKind) -> EdgeResult<Box<dyn OutputBackend>> {
    match kind {
        OutputKind::Sim => Ok(Box::new(SimulatedOutputs::new())),
        OutputKind::LedRing => Ok(Box::new(LedRingOutputs::open()?)),
    }
}

#[tokio::main]
async fn main() -> EdgeResult<()> {
    dotenvy::dotenv().ok();
    env_logger::init();
    log::info!("🚀 Initializing voice-led-edge");

    let args = Args::parse();
    let config = args.config()?;
    let paths = load_model_paths(args.model.clone(), args.labels.clone())?;

    let labels = TfliteClassifier::load_labels(&paths.labels)?;
    config.validate_rules(labels.len())?;
    let classifier = TfliteClassifier::new(&paths.model, labels, config.window.total_samples)?;
    let adapter = ClassifierAdapter::new(
        Box::new(classifier),
        config.window.total_samples,
        config.input_encoding,
    )
    .with_budget(config.classify_budget);

    let outputs = Outputs::new(open_outputs(args.outputs)?);
    let actuators = Actuators::new(outputs.clone(), config.accent_output, config.fade);
    let blink = BlinkController::new(outputs.clone(), actuators.shared(), config.accent_output);

    let flags = InterruptFlags::new();
    let source = open_source(&args, &config)?;
    let assembler = WindowAssembler::new(
        config.window,
        source,
        Arc::new(outputs),
        flags.waker(),
    );

    let mut controller = CaptureController::new(
        config.capture_policy,
        assembler,
        adapter,
        ActuatorMapper::new(config.rules.clone()),
        actuators,
        Arc::clone(&flags),
    );

    let cancel = CancellationToken::new();
    let ticker = spawn_ticker(Arc::clone(&flags), config.capture_period, cancel.clone());
    let blinker = spawn_blinker(blink, config.blink_period, cancel.clone());

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Received Ctrl+C, shutting down...");
            }
            cancel.cancel();
        });
    }

    println!(
        "🎧 Classifying {} ms windows",
        config.window.total_samples as u64 * 1000 / config.sample_rate as u64
    );
    println!("   Press Ctrl+C to exit");

    controller.run(cancel.clone()).await;

    let _ = ticker.await;
    let _ = blinker.await;
    println!("\n👋 Goodbye!");
    Ok(())
}
