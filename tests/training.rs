use std::{iter, sync::Arc};

use ndarray::{arr2, Array2};
use rand::{rngs::StdRng, SeedableRng};

use sketched_federation::{
    model::{Batch, Criterion, DifferentiableModel, Linear, ModelFactory, Mse},
    optim::{FlatLayout, ParamGroup, SketchRules},
    orchestra::{
        worker::{Buffer, ReadBuffer, MODEL_INIT_SEED},
        Orchestrator,
    },
    FedConfig,
};

const LR: f32 = 0.1;

fn config(num_workers: usize, k: usize, num_rows: usize) -> FedConfig {
    FedConfig {
        num_workers,
        k,
        p2: 1,
        num_rows,
        num_cols: 4,
        num_blocks: 1,
        lr: LR,
        momentum: 0.0,
        dampening: 0.0,
        weight_decay: 0.0,
        nesterov: false,
        participation_rate: 1.0,
        sketch_biases: false,
        sketch_params_larger_than: 0,
        seed: Some(5),
        sketch_seed: 42,
    }
}

fn factory() -> ModelFactory {
    Arc::new(|rng: &mut StdRng| -> Box<dyn DifferentiableModel> {
        Box::new(Linear::new((3, 2), rng))
    })
}

fn batch(client: usize) -> Batch {
    let c = client as f32;
    Batch {
        inputs: arr2(&[[1.0, c, -0.5], [0.5 * c, 2.0, 1.0], [-1.0, 0.0, c]]).into_dyn(),
        targets: Array2::from_shape_fn((3, 2), |(i, j)| (i + j) as f32 - c).into_dyn(),
    }
}

fn loaders(n: usize) -> Vec<iter::Repeat<Batch>> {
    (0..n).map(|client| iter::repeat(batch(client))).collect()
}

fn rules() -> SketchRules {
    SketchRules {
        sketch_biases: false,
        sketch_params_larger_than: 0,
    }
}

/// Runs one client's forward and backward pass on a fresh replica.
fn local_grad(client: usize) -> (Vec<f32>, Vec<f32>, FlatLayout) {
    let mut rng = StdRng::seed_from_u64(MODEL_INIT_SEED);
    let mut model = Linear::new((3, 2), &mut rng);
    let Batch { inputs, targets } = batch(client);

    let outputs = model.forward(&inputs).unwrap();
    model.backward(&Mse::new().loss_grad(&outputs, &targets).unwrap()).unwrap();

    let params = model.parameters();
    let layout = FlatLayout::new(params, &[ParamGroup::all(params.len(), LR)], rules()).unwrap();
    (layout.grad_vec(params), layout.param_vec(params), layout)
}

fn assert_close(a: &[f32], b: &[f32]) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() < 1e-5, "coordinate {i}: {x} != {y}");
    }
}

#[actix_rt::test]
async fn full_budget_matches_plain_sgd() {
    // 6 sketched weights and 2 dense biases, every weight kept.
    let config = config(3, 6, 3);
    let mut orchestrator = Orchestrator::new(&config, factory(), || Box::new(Mse::new()), None)
        .await
        .unwrap();

    orchestrator.run_round(&mut loaders(3)).await.unwrap();

    let grads: Vec<_> = (0..3).map(|client| local_grad(client).0).collect();
    let (_, start, _) = local_grad(0);
    let expected: Vec<f32> = start
        .iter()
        .enumerate()
        .map(|(i, p)| p - LR * grads.iter().map(|g| g[i]).sum::<f32>())
        .collect();

    let workers = orchestrator.model().workers();
    for worker in workers.iter() {
        let params = worker.send(ReadBuffer(Buffer::Params)).await.unwrap().unwrap();
        assert_close(&params, &expected);
    }
}

#[actix_rt::test]
async fn error_feedback_keeps_what_was_not_applied() {
    // A single row sketch with k = 1 applies one weight per round.
    let config = config(2, 1, 1);
    let mut orchestrator = Orchestrator::new(&config, factory(), || Box::new(Mse::new()), None)
        .await
        .unwrap();

    orchestrator.run_round(&mut loaders(2)).await.unwrap();

    let (g0, start, layout) = local_grad(0);
    let (g1, _, _) = local_grad(1);

    let workers = orchestrator.model().workers();
    let params = workers[0].send(ReadBuffer(Buffer::Params)).await.unwrap().unwrap();
    let v0 = workers[0].send(ReadBuffer(Buffer::Velocity)).await.unwrap().unwrap();
    let v1 = workers[1].send(ReadBuffer(Buffer::Velocity)).await.unwrap().unwrap();

    let update: Vec<f32> = start.iter().zip(&params).map(|(p0, p)| (p0 - p) / LR).collect();

    let applied = layout
        .sketched_coords()
        .iter()
        .filter(|&&i| update[i] != 0.0)
        .count();
    assert!(applied <= 1);

    for i in 0..layout.grad_size() {
        // Whatever was not applied is still waiting in the buffers.
        let conserved = v0[i] + v1[i] + update[i];
        assert!((conserved - (g0[i] + g1[i])).abs() < 1e-4, "coordinate {i}");
    }

    for &i in layout.dense_coords() {
        assert_eq!(v0[i], 0.0);
        assert_eq!(v1[i], 0.0);
    }
}

#[actix_rt::test]
async fn replicas_stay_identical_across_rounds() {
    let mut config = config(4, 2, 3);
    config.momentum = 0.9;
    let mut orchestrator = Orchestrator::new(&config, factory(), || Box::new(Mse::new()), None)
        .await
        .unwrap();
    let mut loaders = loaders(4);

    let mut losses = Vec::new();
    for _ in 0..5 {
        losses.push(orchestrator.run_round(&mut loaders).await.unwrap().mean_loss);
    }
    assert!(losses.iter().all(|l| l.is_finite()));

    let workers = orchestrator.model().workers();
    let head = workers[0].send(ReadBuffer(Buffer::Params)).await.unwrap().unwrap();
    for worker in workers.iter().skip(1) {
        let params = worker.send(ReadBuffer(Buffer::Params)).await.unwrap().unwrap();
        assert_eq!(params, head);
    }
}

#[actix_rt::test]
async fn training_reduces_the_loss() {
    let config = config(2, 6, 3);
    let mut orchestrator = Orchestrator::new(&config, factory(), || Box::new(Mse::new()), None)
        .await
        .unwrap();
    let mut loaders = loaders(2);

    let first = orchestrator.evaluate(&mut loaders).await.unwrap();
    for _ in 0..20 {
        orchestrator.run_round(&mut loaders).await.unwrap();
    }
    let last = orchestrator.evaluate(&mut loaders).await.unwrap();

    assert!(last < first, "loss went from {first} to {last}");
}
