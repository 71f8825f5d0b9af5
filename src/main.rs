use std::{env, sync::Arc};

use anyhow::Context;
use log::info;
use ndarray::{Array1, Array2, Axis};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::signal;

use sketched_federation::{
    config::DEFAULT_SKETCH_SEED,
    model::{Batch, DifferentiableModel, Linear, ModelFactory, Mse},
    orchestra::Orchestrator,
    FedConfig,
};

const INPUTS: usize = 6;
const BATCH_SIZE: usize = 16;
const DEFAULT_ROUNDS: usize = 50;
const EVAL_EVERY: usize = 10;

/// Endless stream of noisy `y = x w + b` samples for one client.
struct ClientData {
    rng: StdRng,
    weight: Array2<f32>,
    bias: f32,
}

impl ClientData {
    fn new(client: usize, weight: Array2<f32>, bias: f32) -> Self {
        Self {
            rng: StdRng::seed_from_u64(1000 + client as u64),
            weight,
            bias,
        }
    }
}

impl Iterator for ClientData {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        let rng = &mut self.rng;
        let x = Array2::from_shape_fn((BATCH_SIZE, INPUTS), |_| rng.random_range(-1.0f32..1.0));
        let noise = Array2::from_shape_fn((BATCH_SIZE, 1), |_| rng.random_range(-0.05f32..0.05));
        let y = x.dot(&self.weight) + self.bias + noise;

        Some(Batch {
            inputs: x.into_dyn(),
            targets: y.into_dyn(),
        })
    }
}

fn default_config() -> FedConfig {
    FedConfig {
        num_workers: 8,
        k: 3,
        p2: 2,
        num_rows: 3,
        num_cols: 8,
        num_blocks: 1,
        lr: 0.05,
        momentum: 0.9,
        dampening: 0.0,
        weight_decay: 0.0,
        nesterov: false,
        participation_rate: 0.5,
        sketch_biases: false,
        sketch_params_larger_than: 0,
        seed: Some(7),
        sketch_seed: DEFAULT_SKETCH_SEED,
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let config = match args.next() {
        Some(path) => FedConfig::load(&path).with_context(|| format!("loading config {path}"))?,
        None => default_config(),
    };
    let rounds = match args.next() {
        Some(raw) => raw.parse().context("parsing the amount of rounds")?,
        None => DEFAULT_ROUNDS,
    };

    let weight = Array1::linspace(-1.0f32, 1.0, INPUTS).insert_axis(Axis(1));
    let mut loaders: Vec<_> = (0..config.num_workers)
        .map(|client| ClientData::new(client, weight.clone(), 0.5))
        .collect();

    let factory: ModelFactory = Arc::new(|rng: &mut StdRng| -> Box<dyn DifferentiableModel> {
        Box::new(Linear::new((INPUTS, 1), rng))
    });

    actix::System::new().block_on(async move {
        let orchestrator =
            Orchestrator::new(&config, factory, || Box::new(Mse::new()), None).await?;

        tokio::select! {
            ret = train(orchestrator, &mut loaders, rounds) => {
                ret?;
                info!("training finished");
            }
            _ = signal::ctrl_c() => {
                info!("received SIGINT, stopping");
            }
        }

        Ok::<_, anyhow::Error>(())
    })
}

async fn train(
    mut orchestrator: Orchestrator,
    loaders: &mut [ClientData],
    rounds: usize,
) -> anyhow::Result<()> {
    for r in 0..rounds {
        let report = orchestrator.run_round(loaders).await?;
        info!(
            round = r,
            participants:? = report.round.participants(),
            loss = report.mean_loss;
            "round finished"
        );

        if (r + 1) % EVAL_EVERY == 0 {
            let loss = orchestrator.evaluate(loaders).await?;
            info!(round = r, loss = loss; "head evaluation");
        }
    }

    Ok(())
}
