//! End-to-end computations through the context lifecycle.

use std::sync::Arc;

use mlblock_core::{CpuBackend, DType, ErrorKind, MlbError, Shape, StringStore};
use mlblock_ctx::{Block, Config, CtxFlags, Linear, MlCtx, Phase};
use mlblock_io::{LocalTensor, MemoryStore};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn weights() -> (Vec<f32>, Vec<f32>) {
    let w: Vec<f32> = (0..16).map(|i| (i as f32 - 8.0) * 0.25).collect();
    let b = vec![0.5, -0.5, 1.0, 0.0];
    (w, b)
}

fn store() -> Arc<MemoryStore> {
    let (w, b) = weights();
    Arc::new(
        MemoryStore::new()
            .with("fc.weight", LocalTensor::from_f32([4, 4], &w).unwrap())
            .with("fc.bias", LocalTensor::from_f32([4], &b).unwrap()),
    )
}

/// x @ W + b
fn reference(x: &[f32]) -> Vec<f32> {
    let (w, b) = weights();
    (0..4)
        .map(|o| (0..4).map(|i| x[i] * w[i * 4 + o]).sum::<f32>() + b[o])
        .collect()
}

fn ctx() -> MlCtx {
    MlCtx::new(Arc::new(CpuBackend::new()), Arc::new(StringStore::new()))
        .with_store(store())
        .with_config(Config::new().with_wtype(DType::F32))
}

fn assert_close(got: &[f32], want: &[f32]) {
    assert_eq!(got.len(), want.len());
    for (g, w) in got.iter().zip(want) {
        assert!((g - w).abs() < 1e-4, "got {got:?}, want {want:?}");
    }
}

#[test]
fn linear_step_by_step() {
    init_tracing();
    let mut ctx = ctx();
    ctx.begin("linear").unwrap();
    let x = ctx.input_new("x", DType::F32, [1, 4]).unwrap();
    let y = Linear::new("fc", 4, 4).forward(&mut ctx, &x).unwrap();
    ctx.build_alloc(&y).unwrap();
    assert_eq!(ctx.phase(), Phase::Sealed);
    assert!(ctx.info().mem_params > 0);
    assert_eq!(ctx.info().mem_total, ctx.info().mem_params + ctx.info().mem_compute);

    ctx.tstore_load(store().as_ref()).unwrap();
    assert_eq!(ctx.phase(), Phase::Loaded);

    let xs = [1.0, 2.0, 3.0, 4.0];
    ctx.input_set(0, &LocalTensor::from_f32([1, 4], &xs).unwrap())
        .unwrap();
    assert_eq!(ctx.phase(), Phase::Ready);
    ctx.compute().unwrap();
    assert_eq!(ctx.phase(), Phase::Computed);

    let out = ctx.output_get().unwrap();
    assert_eq!(out.shape().0, vec![1, 4]);
    assert_close(&out.to_f32().unwrap(), &reference(&xs));
    assert_eq!(ctx.info().n_compute, 1);
    ctx.end().unwrap();
    assert_eq!(ctx.phase(), Phase::Idle);
}

#[test]
fn run_matches_step_by_step() {
    init_tracing();
    let mut ctx = ctx();
    let xs = [0.5, -1.0, 2.0, 0.0];
    let x = LocalTensor::from_f32([1, 4], &xs).unwrap();
    let out = ctx
        .run("linear", &[&x], |ctx, inputs| {
            Linear::new("fc", 4, 4).forward(ctx, &inputs[0])
        })
        .unwrap();
    assert_close(&out.to_f32().unwrap(), &reference(&xs));
    assert_eq!(ctx.phase(), Phase::Idle);
}

#[test]
fn run_ends_the_computation_on_error() {
    let mut ctx = ctx();
    let x = LocalTensor::from_f32([1, 3], &[1.0, 2.0, 3.0]).unwrap();
    let err = ctx
        .run("bad", &[&x], |ctx, inputs| {
            Linear::new("fc", 4, 4).forward(ctx, &inputs[0])
        })
        .unwrap_err();
    assert!(matches!(err, MlbError::ShapeMismatch { .. }));
    assert_eq!(ctx.phase(), Phase::Idle);
    ctx.begin("next").unwrap();
    ctx.end().unwrap();
}

#[test]
fn duplicate_names_are_rejected() {
    let mut ctx = ctx();
    ctx.begin("dup").unwrap();
    ctx.block_begin("enc").unwrap();
    ctx.weight_new("w", [2]).unwrap();
    let err = ctx.weight_new("w", [2]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Usage);
    assert!(err.to_string().contains("enc.w"));
    ctx.block_end().unwrap();
    // Same local name in another scope is fine.
    ctx.block_begin("dec").unwrap();
    ctx.weight_new("w", [2]).unwrap();
    ctx.block_end().unwrap();
    assert_eq!(ctx.entries().len(), 2);
    ctx.end().unwrap();
}

#[test]
fn a_tensor_is_registered_under_one_name() {
    let mut ctx = ctx();
    ctx.begin("alias").unwrap();
    let w = ctx.weight_new("a", [2]).unwrap();
    let err = ctx.tensor_add("b", &w).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Usage);
    assert!(err.to_string().contains("`a`"), "{err}");

    let y = ctx.ops().unwrap().neg(&w).unwrap();
    ctx.tensor_add("y", &y).unwrap();
    assert!(ctx.tensor_add("y2", &y).is_err());

    let names: Vec<String> = ctx.entries().iter().map(|e| e.name.to_string()).collect();
    assert_eq!(names, ["a", "y"]);
    assert_eq!(ctx.phase(), Phase::Building);
    ctx.end().unwrap();
}

#[test]
fn nested_scopes_and_prefix_build_keys() {
    let mut ctx = MlCtx::new(Arc::new(CpuBackend::new()), Arc::new(StringStore::new()))
        .with_config(Config::new().with_tprefix("model"));
    ctx.begin("keys").unwrap();
    ctx.block_begin("blockA").unwrap();
    ctx.block_begin("sub").unwrap();
    let w = ctx.weight_new("weight", [2]).unwrap();
    ctx.block_end().unwrap();
    ctx.block_end().unwrap();

    let entries = ctx.entries();
    assert_eq!(entries[0].key.as_ref(), "model.blockA.sub.weight");
    assert_eq!(entries[0].name, entries[0].key);
    assert_eq!(entries[0].tensor.dtype(), DType::F16);

    ctx.build_alloc(&w).unwrap();
    let store = MemoryStore::new().with(
        "model.blockA.sub.weight",
        LocalTensor::from_f32_as(DType::F16, [2], &[1.5, -2.0]).unwrap(),
    );
    ctx.tstore_load(&store).unwrap();
    // No inputs: ready right after loading.
    assert_eq!(ctx.phase(), Phase::Ready);
    ctx.compute().unwrap();
    let out = ctx.output_get().unwrap();
    assert_eq!(out.dtype(), DType::F16);
    assert_eq!(out.to_f32().unwrap(), vec![1.5, -2.0]);
    ctx.end().unwrap();
}

#[test]
fn compute_before_build_alloc_is_a_usage_error() {
    let mut ctx = ctx();
    assert!(matches!(ctx.compute(), Err(MlbError::Usage(_))));
    ctx.begin("early").unwrap();
    let x = ctx.input_new("x", DType::F32, [1, 4]).unwrap();
    let y = Linear::new("fc", 4, 4).forward(&mut ctx, &x).unwrap();
    assert!(matches!(ctx.compute(), Err(MlbError::Usage(_))));
    assert!(matches!(ctx.output_get(), Err(MlbError::Usage(_))));
    assert!(ctx.input_set(0, &LocalTensor::zeros(DType::F32, Shape::from([1, 4])).unwrap()).is_err());
    // Guard errors do not fail the computation.
    assert_eq!(ctx.phase(), Phase::Building);

    ctx.build_alloc(&y).unwrap();
    assert!(matches!(ctx.compute(), Err(MlbError::Usage(_))));
    ctx.tstore_load(store().as_ref()).unwrap();
    // Input still unbound.
    assert!(matches!(ctx.compute(), Err(MlbError::Usage(_))));
    assert!(matches!(ctx.build_alloc(&y), Err(MlbError::Usage(_))));
    ctx.end().unwrap();
}

#[test]
fn input_set_checks_shape_and_index() {
    let mut ctx = ctx();
    ctx.begin("inputs").unwrap();
    let x = ctx.input_new("x", DType::F32, [1, 4]).unwrap();
    let y = Linear::new("fc", 4, 4).forward(&mut ctx, &x).unwrap();
    ctx.prep(&y).unwrap();

    let wrong = LocalTensor::from_f32([2, 2], &[0.0; 4]).unwrap();
    assert!(matches!(ctx.input_set(0, &wrong), Err(MlbError::ShapeMismatch { .. })));
    let ints = LocalTensor::zeros(DType::I32, Shape::from([1, 4])).unwrap();
    assert!(ctx.input_set(0, &ints).is_err());
    let ok = LocalTensor::from_f32([1, 4], &[1.0; 4]).unwrap();
    assert!(ctx.input_set(1, &ok).is_err());
    // A squeezable leading dimension is the same layout.
    ctx.input_set(0, &LocalTensor::from_f32([4], &[1.0; 4]).unwrap())
        .unwrap();
    // Half-precision data is converted into the f32 input.
    let half = LocalTensor::from_f32_as(DType::F16, [1, 4], &[1.0, 2.0, 3.0, 4.0]).unwrap();
    ctx.input_set(0, &half).unwrap();
    ctx.compute().unwrap();
    assert_close(
        &ctx.output_get().unwrap().to_f32().unwrap(),
        &reference(&[1.0, 2.0, 3.0, 4.0]),
    );
    ctx.end().unwrap();
}

#[test]
fn multi_compute_reuses_the_compute_pool() {
    init_tracing();
    let mut ctx = ctx();
    ctx.config_mut().flags = CtxFlags::MULTI_COMPUTE | CtxFlags::QUIET;
    ctx.begin("multi").unwrap();
    let x = ctx.input_new("x", DType::F32, [1, 4]).unwrap();
    let y = Linear::new("fc", 4, 4).forward(&mut ctx, &x).unwrap();
    ctx.prep(&y).unwrap();

    let first = [1.0, 0.0, 0.0, 0.0];
    ctx.input_set(0, &LocalTensor::from_f32([1, 4], &first).unwrap())
        .unwrap();
    ctx.compute().unwrap();
    let layout = ctx.compute_pool_layout().unwrap();
    assert_close(&ctx.output_get().unwrap().to_f32().unwrap(), &reference(&first));

    let second = [0.0, 1.0, -1.0, 2.0];
    ctx.input_set(0, &LocalTensor::from_f32([1, 4], &second).unwrap())
        .unwrap();
    ctx.compute().unwrap();
    assert_eq!(ctx.compute_pool_layout().unwrap(), layout);
    assert_close(&ctx.output_get().unwrap().to_f32().unwrap(), &reference(&second));
    assert_eq!(ctx.info().n_compute, 2);
    ctx.end().unwrap();
}

#[test]
fn single_shot_computes_once() {
    let mut ctx = ctx();
    ctx.begin("once").unwrap();
    let x = ctx.input_new("x", DType::F32, [1, 4]).unwrap();
    let y = Linear::new("fc", 4, 4).forward(&mut ctx, &x).unwrap();
    ctx.prep(&y).unwrap();
    ctx.input_set(0, &LocalTensor::from_f32([1, 4], &[1.0; 4]).unwrap())
        .unwrap();
    ctx.compute().unwrap();
    // The compute pool is released right after.
    assert!(ctx.compute_pool_layout().is_none());
    assert!(matches!(ctx.compute(), Err(MlbError::Usage(_))));
    // The stashed result is still there.
    assert!(ctx.output_get().is_ok());
    ctx.end().unwrap();
}

#[test]
fn flags_once_apply_to_one_computation() {
    let mut ctx = ctx();
    ctx.config_mut().flags_once = CtxFlags::MULTI_COMPUTE;
    for (name, twice_ok) in [("first", true), ("second", false)] {
        ctx.begin(name).unwrap();
        let w = ctx.weight_new("fc.bias", [4]).unwrap();
        ctx.prep(&w).unwrap();
        ctx.compute().unwrap();
        assert_eq!(ctx.compute().is_ok(), twice_ok, "{name}");
        ctx.end().unwrap();
    }
    assert_eq!(ctx.config().flags_once, CtxFlags::NONE);
}

#[test]
fn capacity_error_kind() {
    let mut ctx = ctx();
    ctx.config_mut().n_tensor_max = 2;
    ctx.begin("cap").unwrap();
    ctx.weight_new("a", [1]).unwrap();
    ctx.weight_new("b", [1]).unwrap();
    let err = ctx.weight_new("c", [1]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capacity);
    ctx.end().unwrap();
}

#[test]
fn failed_computation_only_accepts_end() {
    let mut ctx = MlCtx::new(Arc::new(CpuBackend::new()), Arc::new(StringStore::new()));
    ctx.begin("missing").unwrap();
    let w = ctx.weight_new("w", [2]).unwrap();
    // No store configured: the key cannot resolve.
    let err = ctx.prep(&w).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resolution);
    assert_eq!(ctx.phase(), Phase::Failed);
    assert!(matches!(ctx.compute(), Err(MlbError::Usage(_))));
    assert!(matches!(ctx.begin("other"), Err(MlbError::Usage(_))));
    ctx.end().unwrap();
    ctx.begin("other").unwrap();
    ctx.end().unwrap();
}

#[test]
fn stats_serialize() {
    let mut ctx = ctx();
    let x = LocalTensor::from_f32([1, 4], &[1.0; 4]).unwrap();
    ctx.run("stats", &[&x], |ctx, inputs| {
        Linear::new("fc", 4, 4).forward(ctx, &inputs[0])
    })
    .unwrap();
    let json = serde_json::to_value(ctx.info()).unwrap();
    assert_eq!(json["n_compute"], 1);
    assert_eq!(json["n_conv"], 0);
    assert!(json["mem_params"].as_u64().unwrap() > 0);
}

#[test]
fn oversized_tensors_are_capacity_errors() {
    let mut ctx = ctx().with_config(Config::new().with_wtype(DType::F32));
    ctx.begin("huge").unwrap();
    // 2^64 elements do not fit any size type.
    let err = ctx.param_new("w", DType::F32, [1 << 32, 1 << 32]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capacity);
    assert_eq!(ctx.phase(), Phase::Building);
    assert!(ctx.entries().is_empty());

    // 2^62 bytes each is a valid tensor, two of them overflow the arena.
    let a = ctx.weight_new("a", [1 << 30, 1 << 30]).unwrap();
    let b = ctx.weight_new("b", [1 << 30, 1 << 30]).unwrap();
    let y = ctx.ops().unwrap().add(&a, &b).unwrap();
    let err = ctx.build_alloc(&y).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capacity);
    assert_eq!(ctx.phase(), Phase::Failed);
    assert_eq!(ctx.info().mem_params, 0);
    assert!(ctx.compute().is_err());
    ctx.end().unwrap();
}
