use burn::backend::NdArray;
use burn::prelude::Tensor;
use burn::tensor::Distribution;
use clap::{Parser, arg};
use mhnet::models::resnet::MultiHeadOptions;
use mhnet::models::resnet::prefabs::{DEFAULT_CHECKPOINT_PATH, lookup_prefab};
use tracing_subscriber::EnvFilter;

/// Default image edge.
const DEFAULT_RESOLUTION: usize = 32;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Model prefab: ``resnet18`` (basic blocks) or ``resnet50`` (bottleneck blocks).
    #[arg(long, default_value = "resnet18")]
    model: String,

    /// Batch size of the random input.
    #[arg(long, default_value_t = 1)]
    batch: usize,

    /// Label count of each head; 2 to 4 values.
    #[arg(long, value_delimiter = ',', default_value = "10,10")]
    heads: Vec<usize>,

    /// Use the dense projection instead of average pooling.
    #[arg(long, default_value_t = false)]
    no_pool: bool,

    /// Overlay pretrained ``torch`` weights.
    #[arg(long, default_value_t = false)]
    pretrained: bool,

    /// Keep the trunk trainable.
    #[arg(long, default_value_t = false)]
    fine_tune: bool,

    /// Pretrained weights path.
    #[arg(long, default_value = DEFAULT_CHECKPOINT_PATH)]
    weights: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    type B = NdArray;
    let device = Default::default();

    let prefab = lookup_prefab(&args.model)?;
    tracing::info!(model = prefab.name, description = prefab.description, "prefab");

    let options = MultiHeadOptions::new()
        .with_classes(args.heads.clone())
        .with_pool(!args.no_pool)
        .with_pretrained(args.pretrained)
        .with_fine_tune(args.fine_tune)
        .with_checkpoint_path(args.weights.clone());

    let [height, width] = prefab
        .to_config(&options)
        .input_resolution()
        .unwrap_or([DEFAULT_RESOLUTION; 2]);

    let model = prefab.build::<B>(&options, &device)?;

    let input = Tensor::random(
        [args.batch, 3, height, width],
        Distribution::Normal(0.0, 1.0),
        &device,
    );
    tracing::info!(shape = ?input.dims(), "input");

    for (idx, output) in model.forward(input).into_vec().into_iter().enumerate() {
        tracing::info!(head = idx, shape = ?output.dims(), "output");
    }

    Ok(())
}
