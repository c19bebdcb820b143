#![allow(dead_code)]

use std::collections::BTreeMap;

use burn_fsdp::Result;
use burn_fsdp::fsdp::{FsdpModel, ModuleId, ModuleTree};
use burn_fsdp::optim::AdamW;
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const INPUT: usize = 6;
pub const HIDDEN: usize = 32;
/// Not divisible by 4, so the last rank of a 4-way shard holds no row.
pub const OUTPUT: usize = 3;
pub const BATCH: usize = 8;

pub const PARAMS: [&str; 4] = ["fc1.weight", "fc1.bias", "fc2.weight", "fc2.bias"];

/// Module ids of the two-layer MLP.
#[derive(Clone, Copy, Debug)]
pub struct Mlp {
    pub root: ModuleId,
    pub fc1: ModuleId,
    pub fc2: ModuleId,
}

fn uniform(rng: &mut StdRng, shape: &[usize]) -> Tensor {
    let numel = shape.iter().product();
    let values: Vec<f64> = (0..numel).map(|_| rng.random_range(-0.5..0.5)).collect();
    Tensor::from_vec(values, shape, &Device::Cpu).unwrap()
}

/// Deterministic initial parameters, identical on every rank.
pub fn init_params(seed: u64) -> BTreeMap<String, Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let shapes: [&[usize]; 4] = [&[HIDDEN, INPUT], &[HIDDEN], &[OUTPUT, HIDDEN], &[OUTPUT]];
    PARAMS
        .iter()
        .zip(shapes)
        .map(|(name, shape)| (name.to_string(), uniform(&mut rng, shape)))
        .collect()
}

pub fn build_mlp(seed: u64) -> (ModuleTree, Mlp) {
    let params = init_params(seed);
    let mut tree = ModuleTree::new("Mlp");
    let root = tree.root();
    let fc1 = tree.add_child(root, "fc1", "Linear").unwrap();
    let fc2 = tree.add_child(root, "fc2", "Linear").unwrap();
    for (module, prefix) in [(fc1, "fc1"), (fc2, "fc2")] {
        for name in ["weight", "bias"] {
            tree.add_parameter(module, name, params[&format!("{prefix}.{name}")].clone())
                .unwrap();
        }
    }
    (tree, Mlp { root, fc1, fc2 })
}

/// The batch `rank` trains on at `step`.
pub fn batch(rank: usize, step: usize) -> (Tensor, Tensor) {
    let mut rng = StdRng::seed_from_u64(7919 * step as u64 + rank as u64);
    (uniform(&mut rng, &[BATCH, INPUT]), uniform(&mut rng, &[BATCH, OUTPUT]))
}

fn linear(x: &Tensor, weight: &Tensor, bias: &Tensor) -> Result<Tensor> {
    Ok(x.matmul(&weight.t()?)?.broadcast_add(bias)?)
}

/// Weight, bias and input gradients of a linear layer.
fn linear_backward(x: &Tensor, weight: &Tensor, dy: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
    Ok((dy.t()?.matmul(x)?, dy.sum(0)?, dy.matmul(weight)?))
}

fn tanh_backward(h: &Tensor, dh: &Tensor) -> Result<Tensor> {
    Ok((dh * h.sqr()?.affine(-1.0, 1.0)?)?)
}

/// Mean squared error and its gradient.
fn mse(y: &Tensor, target: &Tensor) -> Result<(f64, Tensor)> {
    let diff = (y - target)?;
    let n = diff.elem_count() as f64;
    let loss = diff.sqr()?.sum_all()?.to_scalar::<f64>()? / n;
    Ok((loss, diff.affine(2.0 / n, 0.0)?))
}

/// One forward and backward through the sharded model. Returns the loss.
pub fn fsdp_step(model: &mut FsdpModel, mlp: Mlp, x: &Tensor, target: &Tensor) -> Result<f64> {
    let mut hidden = None;
    let y = model.forward(mlp.root, x.clone(), |ctx, _, x| {
        let h = ctx.call(mlp.fc1, x, |_, p, x| {
            Ok(linear(&x, p.get("weight")?, p.get("bias")?)?.tanh()?)
        })?;
        ctx.call(mlp.fc2, h, |_, p, h| {
            hidden = Some(h.clone());
            linear(&h, p.get("weight")?, p.get("bias")?)
        })
    })?;
    let h = hidden.expect("forward keeps the hidden activations");
    let (loss, dy) = mse(&y, target)?;

    model.backward(|ctx| {
        let dh = ctx.call(mlp.fc2, dy, |p, grads, dy: Tensor| {
            let (dw, db, dh) = linear_backward(&h, p.get("weight")?, &dy)?;
            grads.accumulate("weight", &dw)?;
            grads.accumulate("bias", &db)?;
            Ok(dh)
        })?;
        ctx.call(mlp.fc1, dh, |p, grads, dh: Tensor| {
            let dz = tanh_backward(&h, &dh)?;
            let (dw, db, _) = linear_backward(x, p.get("weight")?, &dz)?;
            grads.accumulate("weight", &dw)?;
            grads.accumulate("bias", &db)
        })
    })?;
    Ok(loss)
}

/// Output of the MLP on full tensors.
pub fn reference_output(params: &BTreeMap<String, Tensor>, x: &Tensor) -> Result<Tensor> {
    let h = linear(x, &params["fc1.weight"], &params["fc1.bias"])?.tanh()?;
    linear(&h, &params["fc2.weight"], &params["fc2.bias"])
}

/// Loss and gradients of the MLP on one batch, computed on full tensors.
pub fn reference_grads(
    params: &BTreeMap<String, Tensor>,
    x: &Tensor,
    target: &Tensor,
) -> Result<(f64, BTreeMap<String, Tensor>)> {
    let h = linear(x, &params["fc1.weight"], &params["fc1.bias"])?.tanh()?;
    let y = linear(&h, &params["fc2.weight"], &params["fc2.bias"])?;
    let (loss, dy) = mse(&y, target)?;
    let (dw2, db2, dh) = linear_backward(&h, &params["fc2.weight"], &dy)?;
    let dz = tanh_backward(&h, &dh)?;
    let (dw1, db1, _) = linear_backward(x, &params["fc1.weight"], &dz)?;
    let grads = BTreeMap::from([
        ("fc1.weight".to_string(), dw1),
        ("fc1.bias".to_string(), db1),
        ("fc2.weight".to_string(), dw2),
        ("fc2.bias".to_string(), db2),
    ]);
    Ok((loss, grads))
}

/// Data parallel training on full tensors: every rank's gradient, summed over
/// its microbatches, then averaged across ranks.
pub struct ReferenceDdp {
    pub params: BTreeMap<String, Tensor>,
    optim: AdamW,
}

impl ReferenceDdp {
    pub fn new(seed: u64, optim: AdamW) -> Self {
        Self {
            params: init_params(seed),
            optim,
        }
    }

    pub fn grads(&self, per_rank: &[Vec<(Tensor, Tensor)>]) -> Result<BTreeMap<String, Tensor>> {
        Ok(self.losses_and_grads(per_rank)?.1)
    }

    /// Loss of every rank, summed over its microbatches, and the averaged gradients.
    fn losses_and_grads(
        &self,
        per_rank: &[Vec<(Tensor, Tensor)>],
    ) -> Result<(Vec<f64>, BTreeMap<String, Tensor>)> {
        let mut losses = Vec::with_capacity(per_rank.len());
        let mut total: BTreeMap<String, Tensor> = BTreeMap::new();
        for microbatches in per_rank {
            let mut rank_loss = 0.0;
            for (x, target) in microbatches {
                let (loss, grads) = reference_grads(&self.params, x, target)?;
                rank_loss += loss;
                for (name, grad) in grads {
                    let sum = match total.remove(&name) {
                        Some(acc) => (acc + grad)?,
                        None => grad,
                    };
                    total.insert(name, sum);
                }
            }
            losses.push(rank_loss);
        }
        let ranks = per_rank.len() as f64;
        let grads = total
            .into_iter()
            .map(|(name, grad)| Ok((name, grad.affine(1.0 / ranks, 0.0)?)))
            .collect::<Result<_>>()?;
        Ok((losses, grads))
    }

    /// One optimizer step. Returns the loss of every rank before the update.
    pub fn step(&mut self, per_rank: &[Vec<(Tensor, Tensor)>]) -> Result<Vec<f64>> {
        let (losses, grads) = self.losses_and_grads(per_rank)?;
        for (name, grad) in grads {
            let value = self.optim.update_tensor(&name, &self.params[&name], &grad)?;
            self.params.insert(name, value);
        }
        Ok(losses)
    }
}

pub fn to_vec(tensor: &Tensor) -> Vec<f64> {
    tensor
        .to_dtype(DType::F64)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f64>()
        .unwrap()
}

pub fn assert_close(name: &str, actual: &[f64], expected: &[f64], tolerance: f64) {
    assert_eq!(actual.len(), expected.len(), "{name}: length");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "{name}[{i}]: {a} differs from {e}"
        );
    }
}
