//! Multi-process training emulated with one thread per rank over loopback TCP.

use std::net::TcpListener;
use std::path::PathBuf;
use std::thread;

use candle_core::{DType, Result, Tensor};
use candle_nn::VarBuilder;
use llm_pretrain::{
    checkpoint,
    config::{DeviceMode, TrainConfig},
    data::BatchPreparer,
    distributed::{Backend, DistContext, DistEnv, ProcessGroup},
    error::TrainError,
    model::{CausalLm, ModelBuilder, TinyLlamaBuilder},
    state::TrainingState,
    step::StepExecutor,
    train::{RunSummary, Trainer},
};
use rand::SeedableRng;

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn env(rank: usize, world_size: usize, port: u16) -> DistEnv {
    DistEnv {
        rank,
        world_size,
        local_rank: rank,
        master_addr: "127.0.0.1".to_string(),
        master_port: port,
    }
}

/// Run `f` on `world_size` ranks, each with its own established context.
fn spawn_ranks<T, F>(world_size: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(DistContext) -> T + Send + Sync + Clone + 'static,
{
    let port = free_port();
    let handles: Vec<_> = (0..world_size)
        .map(|rank| {
            let f = f.clone();
            thread::spawn(move || {
                let ctx = DistContext::establish(DeviceMode::CpuDistributed, env(rank, world_size, port))
                    .unwrap();
                f(ctx)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn test_collectives_agree_across_ranks() {
    let results = spawn_ranks(3, |ctx| {
        assert_eq!(ctx.group.backend(), Backend::Tcp);
        let rank = ctx.rank() as f32;

        let mut summed = vec![rank, 1.0];
        ctx.group.all_reduce_sum(&mut summed).unwrap();

        let mut mean = vec![rank * 3.0];
        ctx.group.all_reduce_mean(&mut mean).unwrap();

        let mut root = vec![rank + 10.0; 2];
        ctx.group.broadcast(&mut root).unwrap();
        ctx.group.barrier().unwrap();
        (summed, mean, root)
    });

    for (summed, mean, root) in results {
        assert_eq!(summed, vec![3.0, 3.0]);
        assert_eq!(mean, vec![3.0]);
        assert_eq!(root, vec![10.0, 10.0]);
    }
}

#[test]
fn test_data_parallel_ranks_stay_in_lockstep() {
    let tmp = tempfile::tempdir().unwrap();
    let root: PathBuf = tmp.path().to_path_buf();

    let results: Vec<(usize, RunSummary, Vec<Vec<f32>>)> = spawn_ranks(2, move |ctx| {
        let mut cfg = TrainConfig::tiny_cpu();
        cfg.device = DeviceMode::CpuDistributed;
        cfg.total_steps = 4;
        cfg.warmup_steps = 1;
        cfg.log_steps = 2;
        cfg.save_interval = 2;
        cfg.checkpoint_dir = root.join("ckpt");
        cfg.metrics_dir = Some(root.join("runs"));
        let builder = TinyLlamaBuilder::new(cfg.model.clone());

        let rank = ctx.rank();
        let mut trainer = Trainer::new(cfg, ctx, &builder).unwrap();
        let dataset = trainer.open_dataset().unwrap();
        let summary = trainer.run(dataset).unwrap();
        let params = trainer
            .state()
            .params
            .vars()
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect();
        (rank, summary, params)
    });

    let (_, coordinator, params0) = results.iter().find(|r| r.0 == 0).unwrap();
    let (_, worker, params1) = results.iter().find(|r| r.0 == 1).unwrap();

    assert_eq!(coordinator.final_step, 4);
    assert_eq!(worker.final_step, 4);
    // Loss is averaged across ranks inside the step.
    assert_eq!(coordinator.last_loss, worker.last_loss);
    assert!(coordinator.run_id.is_some());
    assert!(coordinator.checkpoint.is_some());
    assert!(worker.run_id.is_none());
    assert!(worker.checkpoint.is_none());
    assert_eq!(params0, params1);

    let meta = checkpoint::read_meta(&tmp.path().join("ckpt")).unwrap();
    assert_eq!(meta.step, 4);
    assert_eq!(meta.run_id, coordinator.run_id);
}

/// Same parameters as the wrapped model, NaN logits.
struct NanLogits(Box<dyn CausalLm>);

impl CausalLm for NanLogits {
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        self.0.forward(input_ids, attention_mask)? * f64::NAN
    }

    fn vocab_size(&self) -> usize {
        self.0.vocab_size()
    }
}

struct NanLogitsBuilder(TinyLlamaBuilder);

impl ModelBuilder for NanLogitsBuilder {
    fn build(&self, vb: VarBuilder, compute_dtype: DType) -> Result<Box<dyn CausalLm>> {
        Ok(Box::new(NanLogits(self.0.build(vb, compute_dtype)?)))
    }
}

#[test]
fn test_divergence_on_one_rank_aborts_every_rank() {
    let results: Vec<(usize, std::result::Result<usize, String>, usize)> = spawn_ranks(2, |ctx| {
        let mut cfg = TrainConfig::tiny_cpu();
        cfg.device = DeviceMode::CpuDistributed;
        cfg.mixed_precision = false;
        let builder = TinyLlamaBuilder::new(cfg.model.clone());
        let rank = ctx.rank();
        let mut state = if rank == 1 {
            TrainingState::new(&cfg, &NanLogitsBuilder(builder), &ctx.device).unwrap()
        } else {
            TrainingState::new(&cfg, &builder, &ctx.device).unwrap()
        };

        let mut rng = rand::rngs::StdRng::seed_from_u64(rank as u64);
        let batch = BatchPreparer::new(0, 16)
            .prepare(&[vec![4, 8, 15, 16, 23, 42]], &mut rng)
            .unwrap();
        let diverged_at = match StepExecutor::new(cfg.grad_clip).execute(&mut state, &batch, ctx.group.as_ref()) {
            Err(TrainError::Divergence { step, .. }) => Ok(step),
            Err(other) => Err(other.to_string()),
            Ok(out) => Err(format!("step {} completed", out.step)),
        };
        (rank, diverged_at, state.step)
    });

    for (rank, diverged_at, step) in results {
        assert_eq!(diverged_at, Ok(0), "rank {rank}");
        assert_eq!(step, 0, "rank {rank}");
    }
}
