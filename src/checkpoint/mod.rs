//! Persistence of the running statistics of a group of optimizer shards.
//!
//! Every shard owns a contiguous slice of the state, `save` gathers the slices into flat
//! vectors and `load` scatters them back through a [`Collective`].

mod collective;
mod items;

use std::{collections::HashMap, path::Path, sync::Arc};

use log::{info, warn};

pub use collective::{Collective, LocalCollective};
pub use items::{Item, load_items, save_items};

use crate::{
    backend::Backend,
    error::{OptimErr, Result},
    optimization::{Adagrad, Adam, Optimizer, UpdateRule},
    tensor::Tensor,
};

pub const ADAGRAD_GT: &str = "adagrad_gt";
pub const ADAM_MT: &str = "adam_mt";
pub const ADAM_VT: &str = "adam_vt";
pub const ADAM_DENOMS: &str = "adam_denoms";
pub const SMOOTHED_PARAMS: &str = "smoothed_params";

/// Saves the running statistics of every shard into a single file.
///
/// # Arguments
/// * `path` - The destination file.
/// * `shards` - The optimizers of every local shard, in shard order.
/// * `collective` - Gathers the per shard state.
/// * `is_main` - Whether this process writes the file, the others only take part in the gathers.
///
/// # Returns
/// `StateNotAllocated` if a shard never allocated its state, or an io error.
pub fn save<C>(path: &Path, shards: &[Optimizer], collective: &C, is_main: bool) -> Result<()>
where
    C: Collective + ?Sized,
{
    let Some(first) = shards.first() else {
        return Ok(());
    };
    check_algorithms(shards.iter().map(Optimizer::rule))?;

    let mut items = match first.rule() {
        UpdateRule::Sgd(_) => Vec::new(),
        UpdateRule::Adagrad(_) => {
            let gt = collective.gather(&mut |i| {
                host_state(as_adagrad(shards, i)?.state(), Adagrad::NAME, i)
            })?;

            vec![Item::from_f32(ADAGRAD_GT, &gt)]
        }
        UpdateRule::Adam(main) => {
            let mt = collective.gather(&mut |i| {
                host_state(as_adam(shards, i)?.first_moment(), Adam::NAME, i)
            })?;
            let vt = collective.gather(&mut |i| {
                host_state(as_adam(shards, i)?.second_moment(), Adam::NAME, i)
            })?;
            let (denom1, denom2) = main.denominators();

            vec![
                Item::from_f32(ADAM_MT, &mt),
                Item::from_f32(ADAM_VT, &vt),
                Item::from_f64(ADAM_DENOMS, &[denom1, denom2]),
            ]
        }
    };

    if first.average().is_some() {
        let avg = collective.gather(&mut |i| {
            host_state(shard(shards, i)?.average(), "exponential smoothing", i)
        })?;
        items.push(Item::from_f32(SMOOTHED_PARAMS, &avg));
    }

    if is_main && !items.is_empty() {
        info!("saving {} parameters to {}", first.rule().name(), path.display());
        save_items(path, &items)?;
    }

    Ok(())
}

/// Restores the running statistics of every shard from a file written by `save`.
///
/// A missing file is a cold start and leaves the shards untouched, as does a file without
/// the items of the shards' algorithm.
///
/// # Arguments
/// * `path` - The checkpoint file.
/// * `shards` - The optimizers of every local shard, in shard order.
/// * `backends` - The device of every shard, state is allocated there when missing.
/// * `collective` - Scatters the flat state over the shards.
///
/// # Returns
/// `ShardCountMismatch` if `shards` and `backends` differ in length, or an error if the
/// file is malformed.
pub fn load<C>(
    path: &Path,
    shards: &mut [Optimizer],
    backends: &[Arc<dyn Backend>],
    collective: &C,
) -> Result<()>
where
    C: Collective + ?Sized,
{
    if shards.len() != backends.len() {
        return Err(OptimErr::ShardCountMismatch {
            optimizers: shards.len(),
            backends: backends.len(),
        });
    }

    let Some(first) = shards.first() else {
        return Ok(());
    };
    check_algorithms(shards.iter().map(Optimizer::rule))?;

    let name = first.rule().name();
    let stateful = first.rule().is_stateful();
    let smooths = first.smooths();
    if !stateful && !smooths {
        return Ok(());
    }

    if !path.exists() {
        info!("no {name} parameters at {}, starting from scratch", path.display());
        return Ok(());
    }

    info!("loading {name} parameters from {}", path.display());
    let items = load_items(path)?;

    match name {
        Adagrad::NAME => load_adagrad(path, &items, shards, backends, collective)?,
        Adam::NAME => load_adam(path, &items, shards, backends, collective)?,
        _ => {}
    }

    if smooths {
        match items.get(SMOOTHED_PARAMS) {
            Some(avg) => collective.scatter(&avg.to_f32_vec()?, &mut |i, slice| {
                shard_mut(shards, i)?.restore_average(slice)
            })?,
            None => warn!("smoothed parameters not found in {}", path.display()),
        }
    }

    Ok(())
}

fn load_adagrad<C>(
    path: &Path,
    items: &HashMap<String, Item>,
    shards: &mut [Optimizer],
    backends: &[Arc<dyn Backend>],
    collective: &C,
) -> Result<()>
where
    C: Collective + ?Sized,
{
    let Some(gt) = items.get(ADAGRAD_GT) else {
        warn!("adagrad parameters not found in {}", path.display());
        return Ok(());
    };

    collective.scatter(&gt.to_f32_vec()?, &mut |i, slice| {
        as_adagrad_mut(shards, i)?.load_state(&backends[i], slice)
    })
}

fn load_adam<C>(
    path: &Path,
    items: &HashMap<String, Item>,
    shards: &mut [Optimizer],
    backends: &[Arc<dyn Backend>],
    collective: &C,
) -> Result<()>
where
    C: Collective + ?Sized,
{
    let (Some(mt), Some(vt)) = (items.get(ADAM_MT), items.get(ADAM_VT)) else {
        warn!("adam parameters not found in {}", path.display());
        return Ok(());
    };

    let mt = mt.to_f32_vec()?;
    let vt = vt.to_f32_vec()?;
    if mt.len() != vt.len() {
        return Err(OptimErr::MomentLengthMismatch {
            mt: mt.len(),
            vt: vt.len(),
        });
    }

    // Files without denominators restart the bias correction.
    let denoms = match items.get(ADAM_DENOMS) {
        Some(item) => item.to_f64_vec()?,
        None => vec![0.; 2],
    };

    let &[denom1, denom2] = denoms.as_slice() else {
        return Err(OptimErr::InvalidItem {
            name: ADAM_DENOMS.to_string(),
            reason: format!("expected 2 entries, got {}", denoms.len()),
        });
    };

    collective.scatter(&mt, &mut |i, slice| {
        as_adam_mut(shards, i)?.load_first_moment(&backends[i], slice)
    })?;
    collective.scatter(&vt, &mut |i, slice| {
        as_adam_mut(shards, i)?.load_second_moment(&backends[i], slice)
    })?;

    for i in 0..shards.len() {
        as_adam_mut(shards, i)?.set_denominators(denom1, denom2);
    }

    Ok(())
}

/// Checks that every shard runs the same update rule as the first one.
fn check_algorithms<'a, I>(mut rules: I) -> Result<()>
where
    I: Iterator<Item = &'a UpdateRule>,
{
    let Some(expected) = rules.next().map(UpdateRule::name) else {
        return Ok(());
    };

    for (i, rule) in rules.enumerate() {
        if rule.name() != expected {
            return Err(OptimErr::AlgorithmMismatch {
                shard: i + 1,
                got: rule.name(),
                expected,
            });
        }
    }

    Ok(())
}

fn mismatch(rule: &UpdateRule, shard: usize, expected: &'static str) -> OptimErr {
    OptimErr::AlgorithmMismatch {
        shard,
        got: rule.name(),
        expected,
    }
}

fn shard(shards: &[Optimizer], i: usize) -> Result<&Optimizer> {
    shards.get(i).ok_or(OptimErr::UnknownShard {
        shard: i,
        shards: shards.len(),
    })
}

fn shard_mut(shards: &mut [Optimizer], i: usize) -> Result<&mut Optimizer> {
    let len = shards.len();
    shards
        .get_mut(i)
        .ok_or(OptimErr::UnknownShard { shard: i, shards: len })
}

fn as_adagrad(shards: &[Optimizer], i: usize) -> Result<&Adagrad> {
    match shard(shards, i)?.rule() {
        UpdateRule::Adagrad(adagrad) => Ok(adagrad),
        other => Err(mismatch(other, i, Adagrad::NAME)),
    }
}

fn as_adagrad_mut(shards: &mut [Optimizer], i: usize) -> Result<&mut Adagrad> {
    match shard_mut(shards, i)?.rule_mut() {
        UpdateRule::Adagrad(adagrad) => Ok(adagrad),
        other => Err(mismatch(other, i, Adagrad::NAME)),
    }
}

fn as_adam(shards: &[Optimizer], i: usize) -> Result<&Adam> {
    match shard(shards, i)?.rule() {
        UpdateRule::Adam(adam) => Ok(adam),
        other => Err(mismatch(other, i, Adam::NAME)),
    }
}

fn as_adam_mut(shards: &mut [Optimizer], i: usize) -> Result<&mut Adam> {
    match shard_mut(shards, i)?.rule_mut() {
        UpdateRule::Adam(adam) => Ok(adam),
        other => Err(mismatch(other, i, Adam::NAME)),
    }
}

/// Copies an allocated state tensor to the host.
fn host_state(state: Option<&Tensor>, algorithm: &'static str, shard: usize) -> Result<Vec<f32>> {
    let state = state.ok_or(OptimErr::StateNotAllocated { algorithm, shard })?;
    Ok(state.as_f32()?.to_vec())
}
