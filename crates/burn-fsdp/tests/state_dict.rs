mod common;

use std::sync::Arc;

use burn_fsdp::comm::ThreadedWorld;
use burn_fsdp::fsdp::{
    FsdpConfig, FsdpModel, FullyShardOptions, ModuleKindPolicy, OptimizerStateDict, StateDict,
    StateDictEntry, StateDictOptions, get_model_state_dict, get_optimizer_state_dict,
    set_model_state_dict, set_optimizer_state_dict,
};
use burn_fsdp::optim::{AdamW, Optimizer};
use burn_fsdp::rendezvous::init_device_mesh;
use burn_fsdp::{DistError, Result};
use common::*;

const SEED: u64 = 3;

fn sharded_model(rank: &burn_fsdp::comm::ThreadedRank, world_size: usize) -> Result<(FsdpModel, Mlp)> {
    let mesh = init_device_mesh(rank.factory(), &[world_size], None)?;
    let (tree, mlp) = build_mlp(SEED);
    let mut model = FsdpModel::new(tree, mesh)?;
    let options = FullyShardOptions::new(FsdpConfig::default())
        .with_policy(Arc::new(ModuleKindPolicy::new(["Linear"])));
    model.fully_shard(mlp.root, options)?;
    Ok((model, mlp))
}

fn full(entry: &StateDictEntry) -> Vec<f64> {
    match entry {
        StateDictEntry::Full(tensor) => to_vec(tensor),
        StateDictEntry::Sharded { .. } => panic!("expected a full entry"),
    }
}

#[test]
fn test_reshard_checkpoint_to_larger_world() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path();

    // Train on two ranks and write one sharded checkpoint per rank.
    ThreadedWorld::run(2, |rank| {
        let (mut model, mlp) = sharded_model(&rank, 2)?;
        let mut optim = AdamW::new(1e-2);
        for step in 0..2 {
            let (x, target) = batch(rank.rank(), step);
            fsdp_step(&mut model, mlp, &x, &target)?;
            optim.step(&mut model)?;
            model.zero_grad()?;
        }
        let options = StateDictOptions::default();
        get_model_state_dict(&model, options)?.save(path.join(format!("model-{}.json", rank.rank())))?;
        get_optimizer_state_dict(&model, &optim, options)?
            .save(path.join(format!("optim-{}.json", rank.rank())))
    })
    .unwrap();

    let parts: Vec<StateDict> = (0..2)
        .map(|r| StateDict::load(path.join(format!("model-{r}.json"))).unwrap())
        .collect();
    let StateDictEntry::Sharded { global_offset, .. } = parts[1].get("fc1.weight").unwrap() else {
        panic!("expected a sharded entry");
    };
    assert_eq!(global_offset, &vec![HIDDEN / 2, 0]);

    let model = StateDict::consolidate(&parts).unwrap();
    let optim = OptimizerStateDict::consolidate(
        &(0..2)
            .map(|r| OptimizerStateDict::load(path.join(format!("optim-{r}.json"))).unwrap())
            .collect::<Vec<_>>(),
    )
    .unwrap();
    assert_eq!(model.len(), PARAMS.len());
    assert_eq!(optim.state["fc2.bias"].step, 2);

    // Load into four ranks and gather everything back.
    let results = ThreadedWorld::run(4, |rank| {
        let (mut fresh, _) = sharded_model(&rank, 4)?;
        let rejected = set_model_state_dict(&mut fresh, &parts[0], StateDictOptions::default());
        assert!(matches!(rejected, Err(DistError::Configuration(_))));

        set_model_state_dict(&mut fresh, &model, StateDictOptions::default())?;
        let mut adam = AdamW::new(1e-2);
        set_optimizer_state_dict(&fresh, &mut adam, &optim)?;

        let full_options = StateDictOptions {
            full_state_dict: true,
            ..StateDictOptions::default()
        };
        Ok((
            get_model_state_dict(&fresh, full_options)?,
            get_optimizer_state_dict(&fresh, &adam, full_options)?,
        ))
    })
    .unwrap();

    for (params, optim_state) in &results {
        for name in PARAMS {
            assert_close(name, &full(params.get(name).unwrap()), &full(model.get(name).unwrap()), 0.0);
            let expected = &optim.state[name];
            let actual = &optim_state.state[name];
            assert_eq!(actual.step, expected.step);
            for (key, value) in &expected.tensors {
                assert_close(key, &full(&actual.tensors[key]), &full(value), 0.0);
            }
        }
    }
}

#[test]
fn test_strict_loading_reports_missing_keys() {
    let results = ThreadedWorld::run(2, |rank| {
        let (mut model, _) = sharded_model(&rank, 2)?;
        let mut state_dict = get_model_state_dict(&model, StateDictOptions::default())?;
        state_dict.entries.remove("fc2.bias");

        let strict = set_model_state_dict(&mut model, &state_dict, StateDictOptions::default());
        let relaxed = set_model_state_dict(
            &mut model,
            &state_dict,
            StateDictOptions {
                strict: false,
                ..StateDictOptions::default()
            },
        );
        Ok((strict.map_err(|e| e.to_string()), relaxed.is_ok()))
    })
    .unwrap();

    for (strict, relaxed) in results {
        assert_eq!(strict, Err("configuration error: missing key fc2.bias in state dict".to_string()));
        assert!(relaxed);
    }
}
