mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use burn_fsdp::comm::ThreadedWorld;
use burn_fsdp::fsdp::{
    BackwardPrefetch, CpuOffload, FsdpConfig, FsdpModel, FullyShardOptions, ModuleKindPolicy,
    ParamValue, ReshardAfterForward, ShardingStrategy, StateDictEntry, StateDictOptions,
    get_model_state_dict,
};
use burn_fsdp::optim::{AdamW, Optimizer, Sgd};
use burn_fsdp::rendezvous::init_device_mesh;
use burn_fsdp::Result;
use common::*;
use rstest::rstest;

const SEED: u64 = 17;

fn options(config: FsdpConfig) -> FullyShardOptions {
    FullyShardOptions::new(config).with_policy(Arc::new(ModuleKindPolicy::new(["Linear"])))
}

fn full_params(model: &FsdpModel) -> Result<BTreeMap<String, Vec<f64>>> {
    let state_dict = get_model_state_dict(
        model,
        StateDictOptions {
            full_state_dict: true,
            ..StateDictOptions::default()
        },
    )?;
    Ok(state_dict
        .entries
        .iter()
        .map(|(name, entry)| match entry {
            StateDictEntry::Full(tensor) => (name.clone(), to_vec(tensor)),
            StateDictEntry::Sharded { .. } => panic!("{name} was not gathered"),
        })
        .collect())
}

fn assert_matches_reference(actual: &BTreeMap<String, Vec<f64>>, reference: &ReferenceDdp) {
    for name in PARAMS {
        assert_close(name, &actual[name], &to_vec(&reference.params[name]), 1e-9);
    }
}

#[rstest]
#[case::reshard(2, FsdpConfig::default())]
#[case::keep_unsharded(2, FsdpConfig::default().with_reshard_after_forward(ReshardAfterForward::Never))]
#[case::reshard_to_pairs(4, FsdpConfig::default().with_reshard_after_forward(ReshardAfterForward::ToWorldSize(2)))]
#[case::forward_prefetch_backward_post(
    2,
    FsdpConfig::default()
        .with_forward_prefetch(true)
        .with_backward_prefetch(Some(BackwardPrefetch::BackwardPost))
        .with_limit_all_gathers(true)
)]
#[case::forward_prefetch_backward_pre(
    2,
    FsdpConfig::default()
        .with_forward_prefetch(true)
        .with_backward_prefetch(Some(BackwardPrefetch::BackwardPre))
        .with_limit_all_gathers(false)
)]
#[case::no_backward_prefetch(4, FsdpConfig::default().with_backward_prefetch(None))]
#[case::cpu_offload(2, FsdpConfig::default().with_cpu_offload(CpuOffload { offload_params: true }))]
fn test_training_matches_data_parallel(#[case] world_size: usize, #[case] config: FsdpConfig) {
    let steps = 10;
    let results = ThreadedWorld::run(world_size, |rank| {
        let mesh = init_device_mesh(rank.factory(), &[world_size], None)?;
        let (tree, mlp) = build_mlp(SEED);
        let mut model = FsdpModel::new(tree, mesh)?;
        model.fully_shard(mlp.root, options(config.clone()))?;
        let mut optim = AdamW::new(1e-2);

        let mut losses = Vec::new();
        for step in 0..steps {
            let (x, target) = batch(rank.rank(), step);
            losses.push(fsdp_step(&mut model, mlp, &x, &target)?);
            optim.step(&mut model)?;
            model.zero_grad()?;
        }
        Ok((full_params(&model)?, losses))
    })
    .unwrap();

    let mut reference = ReferenceDdp::new(SEED, AdamW::new(1e-2));
    let mut reference_losses = Vec::new();
    for step in 0..steps {
        let per_rank: Vec<_> = (0..world_size).map(|rank| vec![batch(rank, step)]).collect();
        reference_losses.push(reference.step(&per_rank).unwrap());
    }

    for (rank, (params, losses)) in results.iter().enumerate() {
        assert_matches_reference(params, &reference);
        let expected: Vec<f64> = reference_losses.iter().map(|per_rank| per_rank[rank]).collect();
        assert_close(&format!("loss of rank {rank}"), losses, &expected, 1e-9);
    }
}

#[test]
fn test_gradient_accumulation_without_sync() {
    let microbatches = 3;
    let results = ThreadedWorld::run(2, |rank| {
        let mesh = init_device_mesh(rank.factory(), &[2], None)?;
        let (tree, mlp) = build_mlp(SEED);
        let mut model = FsdpModel::new(tree, mesh)?;
        model.fully_shard(mlp.root, options(FsdpConfig::default()))?;

        for step in 0..microbatches - 1 {
            let (x, target) = batch(rank.rank(), step);
            model.no_sync(|model| fsdp_step(model, mlp, &x, &target))?;
        }
        let (x, target) = batch(rank.rank(), microbatches - 1);
        fsdp_step(&mut model, mlp, &x, &target)?;

        let mut optim = Sgd::new(0.1);
        optim.step(&mut model)?;
        full_params(&model)
    })
    .unwrap();

    let reference = ReferenceDdp::new(SEED, AdamW::new(0.0));
    let per_rank: Vec<Vec<_>> = (0..2)
        .map(|rank| (0..microbatches).map(|step| batch(rank, step)).collect())
        .collect();
    let grads = reference.grads(&per_rank).unwrap();
    for params in &results {
        for name in PARAMS {
            let expected = (&reference.params[name] - grads[name].affine(0.1, 0.0).unwrap()).unwrap();
            assert_close(name, &params[name], &to_vec(&expected), 1e-9);
        }
    }
}

#[test]
fn test_hybrid_shard_defers_replica_all_reduce() {
    let microbatches = 3;
    let results = ThreadedWorld::run(4, |rank| {
        let mesh = init_device_mesh(rank.factory(), &[2, 2], Some(&["replicate", "shard"]))?;
        let (tree, mlp) = build_mlp(SEED);
        let mut model = FsdpModel::new(tree, mesh)?;
        let config = FsdpConfig::default().with_sharding_strategy(ShardingStrategy::HybridShard);
        model.fully_shard(mlp.root, options(config))?;

        model.set_requires_all_reduce(mlp.root, false, true)?;
        for step in 0..microbatches - 1 {
            let (x, target) = batch(rank.rank(), step);
            fsdp_step(&mut model, mlp, &x, &target)?;
        }
        let pending = model.handle(mlp.fc1)?.partial_reduce().is_some();
        let applied = model.handle(mlp.fc1)?.sharded_grad().is_some();

        model.set_requires_all_reduce(mlp.root, true, true)?;
        let (x, target) = batch(rank.rank(), microbatches - 1);
        fsdp_step(&mut model, mlp, &x, &target)?;

        let mut optim = Sgd::new(0.1);
        optim.step(&mut model)?;
        Ok((pending, applied, full_params(&model)?))
    })
    .unwrap();

    let reference = ReferenceDdp::new(SEED, AdamW::new(0.0));
    let per_rank: Vec<Vec<_>> = (0..4)
        .map(|rank| (0..microbatches).map(|step| batch(rank, step)).collect())
        .collect();
    let grads = reference.grads(&per_rank).unwrap();
    for (pending, applied, params) in &results {
        assert!(pending);
        assert!(!applied);
        for name in PARAMS {
            let expected = (&reference.params[name] - grads[name].affine(0.1, 0.0).unwrap()).unwrap();
            assert_close(name, &params[name], &to_vec(&expected), 1e-9);
        }
    }
}

#[test]
fn test_clip_grad_norm_is_global() {
    let results = ThreadedWorld::run(2, |rank| {
        let mesh = init_device_mesh(rank.factory(), &[2], None)?;
        let (tree, mlp) = build_mlp(SEED);
        let mut model = FsdpModel::new(tree, mesh)?;
        model.fully_shard(mlp.root, options(FsdpConfig::default()))?;
        let (x, target) = batch(rank.rank(), 0);
        fsdp_step(&mut model, mlp, &x, &target)?;
        model.clip_grad_norm(1e6, 2.0)
    })
    .unwrap();

    let reference = ReferenceDdp::new(SEED, AdamW::new(0.0));
    let per_rank: Vec<_> = (0..2).map(|rank| vec![batch(rank, 0)]).collect();
    let grads = reference.grads(&per_rank).unwrap();
    let expected: f64 = grads
        .values()
        .map(|g| to_vec(g).iter().map(|v| v * v).sum::<f64>())
        .sum::<f64>()
        .sqrt();
    for norm in results {
        assert!((norm - expected).abs() < 1e-9, "{norm} vs {expected}");
    }
}

#[test]
fn test_ignored_module_keeps_full_parameters() {
    let results = ThreadedWorld::run(2, |rank| {
        let mesh = init_device_mesh(rank.factory(), &[2], None)?;
        let (tree, mlp) = build_mlp(SEED);
        let mut model = FsdpModel::new(tree, mesh)?;
        model.fully_shard(mlp.root, options(FsdpConfig::default()).with_ignored_modules(vec![mlp.fc2]))?;

        let fc2_is_unit = model.handle(mlp.fc2).is_ok();
        let fc1_local = model.handle(mlp.fc1)?.param_local(0)?.dims().to_vec();
        let named: BTreeMap<String, ParamValue> = model.named_parameters()?.into_iter().collect();
        let fc2_weight = match &named["fc2.weight"] {
            ParamValue::Unmanaged(tensor) => to_vec(tensor),
            _ => panic!("fc2.weight is managed"),
        };

        let (x, _) = batch(rank.rank(), 0);
        let y = model.forward(mlp.root, x.clone(), |ctx, p, x| {
            let h = ctx.call(mlp.fc1, x, |_, p, x| {
                Ok(x.matmul(&p.get("weight")?.t()?)?.broadcast_add(p.get("bias")?)?.tanh()?)
            })?;
            Ok(h.matmul(&p.get("fc2.weight")?.t()?)?.broadcast_add(p.get("fc2.bias")?)?)
        })?;
        Ok((fc2_is_unit, fc1_local, fc2_weight, to_vec(&y), x))
    })
    .unwrap();

    let params = init_params(SEED);
    for (fc2_is_unit, fc1_local, fc2_weight, y, x) in results {
        assert!(!fc2_is_unit);
        assert_eq!(fc1_local, vec![HIDDEN / 2, INPUT]);
        assert_eq!(fc2_weight, to_vec(&params["fc2.weight"]));
        assert_close("output", &y, &to_vec(&reference_output(&params, &x).unwrap()), 1e-12);
    }
}

#[test]
fn test_sync_module_states_uses_first_rank_weights() {
    let results = ThreadedWorld::run(2, |rank| {
        let mesh = init_device_mesh(rank.factory(), &[2], None)?;
        let (tree, mlp) = build_mlp(SEED + rank.rank() as u64);
        let mut model = FsdpModel::new(tree, mesh)?;
        model.fully_shard(mlp.root, options(FsdpConfig::default().with_sync_module_states(true)))?;
        full_params(&model)
    })
    .unwrap();

    let expected = init_params(SEED);
    for params in results {
        for name in PARAMS {
            assert_close(name, &params[name], &to_vec(&expected[name]), 0.0);
        }
    }
}
