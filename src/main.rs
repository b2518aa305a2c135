// The weights are fetched on first use from the HuggingFace hub:
// https://huggingface.co/lllyasviel/ControlNet-v1-1
// https://huggingface.co/stable-diffusion-v1-5/stable-diffusion-v1-5
use clap::{Args, Parser, Subcommand};
use controlnet_predictor::assets::{AssetLayout, HttpFetcher};
use controlnet_predictor::diagnostics::{synthetic_room, Report};
use controlnet_predictor::{
    generate_with, provision, CannyThresholds, Control, ControlType, DispatchOptions,
    GenerationRequest, NormalParams, Registry, Settings, TorchFactory,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// The directory holding the downloaded weights and configs.
    #[arg(long, global = true, env = "CONTROLNET_MODELS_DIR", default_value = "models")]
    models_dir: PathBuf,

    /// Never download anything, control types with missing files are skipped.
    #[arg(long, global = true, env = "CONTROLNET_OFFLINE")]
    offline: bool,

    /// When set, use the CPU for the listed devices, can be 'all', 'unet', 'clip', 'vae' or
    /// 'annotator'. Multiple values can be set.
    #[arg(long, global = true)]
    cpu: Vec<String>,

    /// The size of the sliced attention or 0 for automatic slicing.
    #[arg(long, global = true, default_value_t = 0)]
    sliced_attention_size: i64,

    /// Disable sliced attention.
    #[arg(long, global = true, action)]
    no_sliced_attention: bool,

    /// The length in pixels of the short side of the generated image.
    #[arg(long, global = true, default_value_t = 512)]
    resolution: u32,
}

impl GlobalArgs {
    fn settings(&self) -> Settings {
        Settings {
            models_dir: self.models_dir.clone(),
            offline: self.offline,
            cpu: self.cpu.clone(),
            sliced_attention_size: (!self.no_sliced_attention).then_some(self.sliced_attention_size),
            resolution: self.resolution,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Download the missing assets and load every pipeline.
    Setup,
    /// Generate an image guided by the structure of the input image.
    Predict(PredictArgs),
    /// Report the available backends and assets, and write a test image.
    Check {
        /// Where to write the synthetic test image.
        #[arg(long, value_name = "FILE", default_value = "test_room.png")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct PredictArgs {
    /// The input image.
    #[arg(long, value_name = "FILE")]
    image: PathBuf,

    /// The prompt to be used for image generation.
    #[arg(long)]
    prompt: String,

    /// The structural signal to condition on: canny, depth or normal.
    #[arg(long, default_value = "canny")]
    control_type: ControlType,

    /// What the image should not look like.
    #[arg(long, default_value = "")]
    negative_prompt: String,

    /// The number of steps to run the diffusion for.
    #[arg(long, default_value_t = 20)]
    num_inference_steps: usize,

    /// How strongly the image follows the prompt.
    #[arg(long, default_value_t = 7.5)]
    guidance_scale: f64,

    /// Lower Canny gradient threshold.
    #[arg(long, default_value_t = 100)]
    low_threshold: u32,

    /// Upper Canny gradient threshold.
    #[arg(long, default_value_t = 200)]
    high_threshold: u32,

    /// Normalized depth below which normals are flattened.
    #[arg(long, default_value_t = 0.1)]
    bg_threshold: f32,

    /// The random seed to be used for the generation, random when not set.
    #[arg(long)]
    seed: Option<i64>,

    /// Use autocast (disabled by default as it may use more memory in some cases).
    #[arg(long, action)]
    autocast: bool,
}

impl PredictArgs {
    fn control(&self) -> Control {
        match self.control_type {
            ControlType::Canny => {
                Control::Canny(CannyThresholds::new(self.low_threshold, self.high_threshold))
            }
            ControlType::Depth => Control::Depth,
            ControlType::Normal => {
                Control::Normal(NormalParams { background_threshold: self.bg_threshold })
            }
        }
    }
}

fn setup(settings: &Settings) -> anyhow::Result<Registry> {
    tch::maybe_init_cuda();
    log::info!("Cuda available: {}", tch::Cuda::is_available());
    log::info!("MPS available: {}", tch::utils::has_mps());
    let registry = provision(settings, &HttpFetcher::new(), &TorchFactory::new(settings))?;
    Ok(registry)
}

fn predict(settings: &Settings, args: PredictArgs) -> anyhow::Result<()> {
    let registry = setup(settings)?;
    let image = std::fs::read(&args.image)
        .map_err(|e| anyhow::anyhow!("error reading {:?}: {e}", args.image))?;
    let mut request = GenerationRequest::new(image, args.prompt.clone(), args.control());
    request.negative_prompt = args.negative_prompt.clone();
    request.num_inference_steps = args.num_inference_steps;
    request.guidance_scale = args.guidance_scale;
    request.seed = args.seed;
    let options = DispatchOptions::from(settings);
    let run = || generate_with(&request, &registry, &options);
    let result = if args.autocast { tch::autocast(true, run)? } else { run()? };
    log::info!("Seed: {}", result.seed);
    println!("{}", result.path.display());
    Ok(())
}

fn check(settings: &Settings, output: PathBuf) -> anyhow::Result<bool> {
    let report = Report::collect(&AssetLayout::new(&settings.models_dir));
    print!("{report}");
    synthetic_room(512).save(&output)?;
    println!("Test image saved as {output:?}");
    Ok(report.is_ready())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let settings = cli.global.settings();
    match cli.command {
        Command::Setup => {
            let registry = setup(&settings)?;
            for control_type in registry.control_types() {
                println!("{control_type}");
            }
        }
        Command::Predict(args) => predict(&settings, args)?,
        Command::Check { output } => {
            if !check(&settings, output)? {
                std::process::exit(1)
            }
        }
    }
    Ok(())
}
