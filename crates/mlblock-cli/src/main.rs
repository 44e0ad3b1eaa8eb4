use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::error;
use tracing_subscriber::EnvFilter;

use mlblock_core::{Backend, CpuBackend, DType, Result, StringStore};
use mlblock_ctx::{Block, Config, CtxFlags, Linear, MlCtx, Mlp, Stats};
use mlblock_io::{LocalTensor, MemoryStore, SafeTensorStore, TensorStore};

#[derive(Parser)]
#[command(name = "mlblock")]
#[command(about = "mlblock development CLI")]
struct Args {
    /// Print results and statistics as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run a linear layer with built-in weights.
    Smoke,
    /// Run a linear layer with weights from a safetensors file.
    Linear {
        #[arg(long)]
        weights: PathBuf,
        /// Prefix of every key, e.g. `model` for `model.fc.weight`.
        #[arg(long, default_value = "")]
        prefix: String,
        /// Block name; keys are `<prefix>.<name>.weight` and `.bias`.
        #[arg(long, default_value = "fc")]
        name: String,
        #[arg(long)]
        n_out: usize,
        /// Comma-separated input row.
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        input: Vec<f32>,
        /// Dtype parameters are held in.
        #[arg(long, default_value = "f32")]
        wtype: String,
    },
    /// List the tensors of a safetensors file.
    Keys {
        #[arg(long)]
        weights: PathBuf,
    },
    /// Write the DOT graph of an MLP block.
    Dump {
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 4)]
        n_in: usize,
        #[arg(long, default_value_t = 16)]
        n_hidden: usize,
        /// Place the second layer on another backend.
        #[arg(long)]
        split: bool,
    },
}

#[derive(Serialize)]
struct RunReport<'a> {
    shape: &'a [i64],
    output: Vec<f32>,
    stats: &'a Stats,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let res = match args.cmd {
        Cmd::Smoke => smoke(args.json),
        Cmd::Linear {
            weights,
            prefix,
            name,
            n_out,
            input,
            wtype,
        } => linear(args.json, &weights, &prefix, &name, n_out, &input, &wtype),
        Cmd::Keys { weights } => keys(args.json, &weights),
        Cmd::Dump {
            out,
            n_in,
            n_hidden,
            split,
        } => dump(&out, n_in, n_hidden, split),
    };
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(kind = ?e.kind(), "{e}");
            ExitCode::FAILURE
        }
    }
}

fn report(json: bool, out: &LocalTensor, stats: &Stats) -> Result<()> {
    let values = out.to_f32()?;
    if json {
        let report = RunReport {
            shape: &out.shape().0,
            output: values,
            stats,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&report).map_err(|e| mlblock_core::MlbError::Io(e.into()))?
        );
    } else {
        println!("output {} = {:?}", out.shape(), values);
        println!("{stats}");
    }
    Ok(())
}

fn cpu_ctx() -> MlCtx {
    MlCtx::new(Arc::new(CpuBackend::new()), Arc::new(StringStore::new()))
}

fn smoke(json: bool) -> Result<()> {
    // W = [[1, 0], [0, 1], [1, 1]], b = [0.5, -0.5]
    let store = MemoryStore::new()
        .with(
            "fc.weight",
            LocalTensor::from_f32([3, 2], &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0])?,
        )
        .with("fc.bias", LocalTensor::from_f32([2], &[0.5, -0.5])?);
    let mut ctx = cpu_ctx()
        .with_store(Arc::new(store))
        .with_config(Config::new().with_wtype(DType::F32).with_flags(CtxFlags::QUIET));

    let x = LocalTensor::from_f32([1, 3], &[1.0, 2.0, 3.0])?;
    let out = ctx.run("smoke", &[&x], |ctx, inputs| {
        Linear::new("fc", 3, 2).forward(ctx, &inputs[0])
    })?;
    report(json, &out, ctx.info())
}

fn parse_dtype(s: &str) -> Result<DType> {
    match s.to_ascii_lowercase().as_str() {
        "f32" => Ok(DType::F32),
        "f16" => Ok(DType::F16),
        "bf16" => Ok(DType::BF16),
        other => Err(mlblock_core::MlbError::InvalidArgument(format!(
            "unsupported weight dtype `{other}` (f32, f16, bf16)"
        ))),
    }
}

fn linear(
    json: bool,
    weights: &Path,
    prefix: &str,
    name: &str,
    n_out: usize,
    input: &[f32],
    wtype: &str,
) -> Result<()> {
    if input.is_empty() {
        return Err(mlblock_core::MlbError::usage("--input needs at least one value"));
    }
    let store = Arc::new(SafeTensorStore::open(weights)?);
    let config = Config::new()
        .with_wtype(parse_dtype(wtype)?)
        .with_tprefix(prefix);
    let mut ctx = cpu_ctx().with_store(store).with_config(config);

    let n_in = input.len();
    let x = LocalTensor::from_f32([1, n_in as i64], input)?;
    let out = ctx.run("linear", &[&x], |ctx, inputs| {
        Linear::new(name, n_in, n_out).forward(ctx, &inputs[0])
    })?;
    report(json, &out, ctx.info())
}

fn keys(json: bool, weights: &Path) -> Result<()> {
    let store = SafeTensorStore::open(weights)?;
    let mut keys = store.keys();
    keys.sort();
    let mut listed = Vec::with_capacity(keys.len());
    for key in keys {
        if let Some(info) = store.info(&key) {
            listed.push((key, info.dtype.to_string(), info.shape.0.clone()));
        }
    }
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&listed).map_err(|e| mlblock_core::MlbError::Io(e.into()))?
        );
    } else {
        for (key, dtype, shape) in &listed {
            println!("{key}\t{dtype}\t{shape:?}");
        }
        println!("{} tensors", listed.len());
    }
    Ok(())
}

/// `mlp` with its first layer closed as its own segment when `split` is set.
fn define_mlp(ctx: &mut MlCtx, n_in: usize, n_hidden: usize, split: bool) -> Result<mlblock_core::Tensor> {
    let x = ctx.input_new("x", DType::F32, [1, n_in as i64])?;
    let mlp = Mlp::new("mlp", n_in, n_hidden, n_in);
    ctx.block_begin(&mlp.name)?;
    let h = mlp.fc1.forward(ctx, &x)?;
    if split {
        ctx.split_add(&h)?;
    }
    let h = ctx.ops()?.gelu(&h)?;
    ctx.tensor_add("act", &h)?;
    let y = mlp.fc2.forward(ctx, &h)?;
    ctx.block_end()?;
    Ok(y)
}

fn dump(out: &Path, n_in: usize, n_hidden: usize, split: bool) -> Result<()> {
    let backends: Vec<Arc<dyn Backend>> = if split {
        vec![
            Arc::new(CpuBackend::named("cpu0")),
            Arc::new(CpuBackend::named("cpu1")),
        ]
    } else {
        vec![Arc::new(CpuBackend::new())]
    };
    let mut ctx = MlCtx::with_backends(backends, Arc::new(StringStore::new()))?
        .with_config(Config::new().with_flags(CtxFlags::QUIET));

    ctx.begin("dump")?;
    let written = define_mlp(&mut ctx, n_in, n_hidden, split)
        .and_then(|y| ctx.build_alloc(&y))
        .and_then(|()| ctx.graph_dump_path(out));
    ctx.end()?;
    written?;
    println!("wrote {}", out.display());
    Ok(())
}
