//! # Data-Parallel Updates (CPU Threading)
//!
//! [`DataParallel`] wraps another set of hooks and supplies the distributed-mode
//! hooks for the CPU backend. Each update splits the batch into row shards, runs
//! forward and loss on every shard in parallel with `rayon`, combines the shard
//! losses, and then computes and applies gradients once.

use crate::backend::{Backend, CpuBackend, GradientMap, ParamOptimizerPair};
use crate::batch::{self, ModuleId, MultiAgentBatch, NestedTensorDict, TensorDict};
use crate::config::TrainerConfig;
use crate::error::{Result, TrainerError};
use crate::rl_module::{ModuleSpec, MultiAgentRlModule, RlModule};
use crate::tensor::{ops, Tensor};
use crate::trainer::{finish_update, LossResult, LossStats, Metric, ResultDict, TrainerHooks, UpdateArgs, UpdateContext};
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Output of one shard: forward pass, losses, and the rows each module contributed.
struct ShardOutput {
    fwd_out: NestedTensorDict<Tensor>,
    loss: LossResult<Tensor>,
    rows: BTreeMap<ModuleId, usize>,
}

#[derive(Debug, Default)]
pub struct DataParallel<H> {
    inner: H,
}

impl<H> DataParallel<H>
where
    H: TrainerHooks<CpuBackend> + Sync,
{
    pub fn new(inner: H) -> Self {
        DataParallel { inner }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }

    pub fn into_inner(self) -> H {
        self.inner
    }

    /// Forward pass and loss over every shard, in parallel.
    fn scatter(
        &self,
        backend: &CpuBackend,
        module: &MultiAgentRlModule<CpuBackend>,
        shards: &[MultiAgentBatch],
    ) -> Result<Vec<ShardOutput>> {
        shards
            .par_iter()
            .map(|shard| {
                let tensors = backend.convert_batch_type(shard)?;
                let fwd_out = module.forward_train(&tensors)?;
                let loss = self.inner.compute_loss(backend, &fwd_out, &tensors)?;
                let mut rows = BTreeMap::new();
                for (module_id, sample_batch) in shard {
                    rows.insert(module_id.clone(), batch::num_rows(sample_batch)?);
                }
                Ok(ShardOutput { fwd_out, loss, rows })
            })
            .collect()
    }
}

/// Row-weighted average of the shard losses, so mean-reduced losses match the
/// full-batch value. The top-level total is the sum of the combined module totals.
fn combine_losses(backend: &CpuBackend, outputs: &[ShardOutput]) -> Result<LossResult<Tensor>> {
    let mut total_rows: BTreeMap<&str, usize> = BTreeMap::new();
    for output in outputs {
        for module_id in output.loss.per_module.keys() {
            let rows = output.rows.get(module_id).copied().unwrap_or(0);
            *total_rows.entry(module_id.as_str()).or_default() += rows;
        }
    }

    let mut per_module: BTreeMap<ModuleId, LossStats<Tensor>> = BTreeMap::new();
    for output in outputs {
        for (module_id, stats) in &output.loss.per_module {
            let rows = output.rows.get(module_id).copied().unwrap_or(0);
            let module_rows = total_rows.get(module_id.as_str()).copied().unwrap_or(0).max(1);
            let weight = rows as f32 / module_rows as f32;
            let combined = per_module.entry(module_id.clone()).or_default();
            for (name, value) in stats {
                let weighted = backend.scale(value, weight)?;
                let merged = match combined.remove(name) {
                    Some(running) => backend.add_losses(&running, &weighted)?,
                    None => weighted,
                };
                combined.insert(name.clone(), merged);
            }
        }
    }

    let mut total_loss: Option<Tensor> = None;
    for (module_id, stats) in &per_module {
        let module_loss = stats
            .get(crate::trainer::TOTAL_LOSS_KEY)
            .ok_or_else(|| TrainerError::MissingTotalLoss(module_id.clone()))?;
        total_loss = Some(match total_loss {
            Some(running) => backend.add_losses(&running, module_loss)?,
            None => module_loss.clone(),
        });
    }
    Ok(LossResult { per_module, total_loss })
}

/// Concatenates every shard's forward outputs back into batch order.
fn gather(outputs: &[ShardOutput]) -> Result<NestedTensorDict<Tensor>> {
    let mut parts: BTreeMap<ModuleId, BTreeMap<String, Vec<Tensor>>> = BTreeMap::new();
    for output in outputs {
        for (module_id, module_out) in &output.fwd_out {
            let columns = parts.entry(module_id.clone()).or_default();
            for (key, tensor) in module_out {
                columns.entry(key.clone()).or_default().push(tensor.clone());
            }
        }
    }

    let mut gathered = NestedTensorDict::new();
    for (module_id, columns) in parts {
        let mut module_out = TensorDict::new();
        for (key, tensors) in columns {
            let joined = if tensors.len() == 1 {
                tensors[0].clone()
            } else {
                ops::cat(&tensors, 0)?
            };
            module_out.insert(key, joined);
        }
        gathered.insert(module_id, module_out);
    }
    Ok(gathered)
}

impl<H> TrainerHooks<CpuBackend> for DataParallel<H>
where
    H: TrainerHooks<CpuBackend> + Sync,
{
    fn configure_optimizers(
        &mut self,
        backend: &CpuBackend,
        module: &MultiAgentRlModule<CpuBackend>,
    ) -> Result<Vec<ParamOptimizerPair<CpuBackend>>> {
        self.inner.configure_optimizers(backend, module)
    }

    fn compute_loss(
        &self,
        backend: &CpuBackend,
        fwd_out: &NestedTensorDict<Tensor>,
        batch: &NestedTensorDict<Tensor>,
    ) -> Result<LossResult<Tensor>> {
        self.inner.compute_loss(backend, fwd_out, batch)
    }

    fn compute_loss_per_module(
        &self,
        backend: &CpuBackend,
        module_id: &str,
        fwd_out: &TensorDict<Tensor>,
        batch: &TensorDict<Tensor>,
    ) -> Result<LossStats<Tensor>> {
        self.inner.compute_loss_per_module(backend, module_id, fwd_out, batch)
    }

    fn postprocess_gradients(
        &mut self,
        backend: &CpuBackend,
        gradients: GradientMap<CpuBackend>,
    ) -> Result<GradientMap<CpuBackend>> {
        self.inner.postprocess_gradients(backend, gradients)
    }

    fn compile_results(
        &self,
        backend: &CpuBackend,
        batch: &MultiAgentBatch,
        fwd_out: &NestedTensorDict<Tensor>,
        loss: &LossResult<Tensor>,
        gradients: &GradientMap<CpuBackend>,
    ) -> Result<ResultDict> {
        self.inner.compile_results(backend, batch, fwd_out, loss, gradients)
    }

    fn additional_update_per_module(
        &mut self,
        backend: &CpuBackend,
        module_id: &str,
        module: &mut dyn RlModule<CpuBackend>,
        args: &UpdateArgs,
    ) -> Result<ResultDict> {
        self.inner.additional_update_per_module(backend, module_id, module, args)
    }

    fn make_distributed_module(
        &mut self,
        _backend: &CpuBackend,
        module_spec: &ModuleSpec<CpuBackend>,
        config: &TrainerConfig,
    ) -> Result<MultiAgentRlModule<CpuBackend>> {
        info!(
            num_workers = config.scaling_config.num_workers,
            "building data-parallel module"
        );
        module_spec.make_module()
    }

    fn do_distributed_update(
        &mut self,
        ctx: UpdateContext<'_, CpuBackend>,
        batch: &MultiAgentBatch,
    ) -> Result<ResultDict> {
        let shards = batch::shard(batch, ctx.config.scaling_config.num_workers)?;
        debug!(num_shards = shards.len(), "scattered batch");

        let outputs = self.scatter(ctx.backend, ctx.module, &shards)?;
        let loss = combine_losses(ctx.backend, &outputs)?;
        let fwd_out = gather(&outputs)?;

        let mut results = finish_update(ctx.backend, &mut self.inner, ctx.registry, batch, &fwd_out, &loss)?;
        results.insert("num_shards".to_string(), Metric::Scalar(shards.len() as f64));
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn shard_output(module_id: &str, loss: f32, rows: usize) -> ShardOutput {
        let mut stats = LossStats::new();
        stats.insert("total_loss".to_string(), Tensor::scalar(loss));
        let mut per_module = BTreeMap::new();
        per_module.insert(module_id.to_string(), stats);
        let mut row_counts = BTreeMap::new();
        row_counts.insert(module_id.to_string(), rows);
        ShardOutput {
            fwd_out: NestedTensorDict::new(),
            loss: LossResult { per_module, total_loss: Some(Tensor::scalar(loss)) },
            rows: row_counts,
        }
    }

    #[test]
    fn shard_losses_are_weighted_by_rows() {
        // 3 rows at loss 1.0 and 1 row at loss 5.0 average to 2.0.
        let outputs = vec![shard_output("a", 1.0, 3), shard_output("a", 5.0, 1)];
        let combined = combine_losses(&CpuBackend, &outputs).unwrap();
        assert_relative_eq!(combined.per_module["a"]["total_loss"].item().unwrap(), 2.0);
        assert_relative_eq!(combined.total_loss.unwrap().item().unwrap(), 2.0);
    }

    #[test]
    fn module_totals_are_summed_across_modules() {
        let outputs = vec![shard_output("a", 2.0, 1), shard_output("b", 3.0, 1)];
        let combined = combine_losses(&CpuBackend, &outputs).unwrap();
        assert_relative_eq!(combined.total_loss.unwrap().item().unwrap(), 5.0);
    }
}
