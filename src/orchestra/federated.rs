use std::{fmt, sync::Arc};

use actix::prelude::*;
use futures::future;
use log::{debug, warn};

use super::{
    round::{ParticipantSampler, Round, RoundRecord},
    worker::{
        AllReduceSketched, BindLoss, BindModel, BindOptimizer, ComputeGrad, GetParamGroups,
        LossBackward, LossCall, ModelCall, SetHyperparameter, SetTraining, SketchedWorker,
        ZeroGrad,
    },
};
use crate::{
    config::FedConfig,
    error::{FedError, Result},
    model::{Batch, Criterion, ModelFactory, Tensor},
    optim::{Hyperparameter, ParamGroup, ParamGroupLr},
};

/// Worker that applies every update and serves evaluation, unless changed with `set_head`.
pub const DEFAULT_HEAD: usize = 0;

/// The worker population, shared by the three facades.
pub type Workers = Arc<[Addr<SketchedWorker>]>;

/// Sends one message to each worker in `ids` and waits for every reply.
///
/// All messages are enqueued before the first reply is awaited, and the
/// replies come back in the order of `ids`.
async fn fan_out<M, T, F>(workers: &[Addr<SketchedWorker>], ids: &[usize], mut make: F) -> Result<Vec<T>>
where
    M: Message<Result = Result<T>> + Send + 'static,
    T: Send + 'static,
    F: FnMut(usize) -> M,
    SketchedWorker: Handler<M>,
{
    let futs = ids.iter().map(|&id| {
        let request = workers[id].send(make(id));
        async move { request.await? }
    });

    future::try_join_all(futs).await
}

fn check_head(workers: &[Addr<SketchedWorker>], head: usize) -> Result<()> {
    if head >= workers.len() {
        return Err(FedError::InvalidConfig(format!(
            "head worker {head} out of range, there are {} workers",
            workers.len()
        )));
    }

    Ok(())
}

fn all_ids(workers: &[Addr<SketchedWorker>]) -> Vec<usize> {
    (0..workers.len()).collect()
}

/* -------------------------------------------------------------------------- */
/*                                    Model                                   */
/* -------------------------------------------------------------------------- */

/// The model facade: samples the participants of each round and runs their forward passes.
pub struct FedModel {
    workers: Workers,
    record: RoundRecord,
    sampler: ParticipantSampler,
    head: usize,
    training: bool,
}

impl FedModel {
    /// Builds a model replica on every worker.
    ///
    /// # Arguments
    /// * `workers` - The worker population.
    /// * `config` - The run's configuration.
    /// * `factory` - Builds one replica, called once per worker with the same seed.
    ///
    /// # Returns
    /// The facade, or an error if the population doesn't match the config or a worker is gone.
    pub async fn new(workers: Workers, config: &FedConfig, factory: ModelFactory) -> Result<Self> {
        config.validate()?;

        if workers.len() != config.num_workers {
            return Err(FedError::InvalidConfig(format!(
                "config expects {} workers, got {}",
                config.num_workers,
                workers.len()
            )));
        }

        fan_out(&workers, &all_ids(&workers), |_| BindModel(Arc::clone(&factory))).await?;

        Ok(Self {
            sampler: ParticipantSampler::new(
                workers.len(),
                config.participants_per_round(),
                config.seed,
            ),
            workers,
            record: RoundRecord::new(),
            head: DEFAULT_HEAD,
            training: true,
        })
    }

    /// Switches every replica between training and evaluation.
    pub async fn set_training(&mut self, training: bool) -> Result<()> {
        fan_out(&self.workers, &all_ids(&self.workers), |_| SetTraining(training)).await?;
        self.training = training;
        Ok(())
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Changes the worker that serves evaluation rounds.
    pub fn set_head(&mut self, head: usize) -> Result<()> {
        check_head(&self.workers, head)?;
        self.head = head;
        Ok(())
    }

    pub fn head(&self) -> usize {
        self.head
    }

    /// Runs one forward pass.
    ///
    /// In training mode a new set of participants is sampled and recorded,
    /// each of them pulling one batch from its own loader. Otherwise only the
    /// head runs, on a batch from the head's loader, and nothing is recorded.
    ///
    /// # Arguments
    /// * `loaders` - One batch source per worker, indexed like the population.
    ///
    /// # Returns
    /// The round context to pass on to the loss and the optimizer, and the
    /// outputs of each participant in participant order.
    pub async fn forward<L>(&mut self, loaders: &mut [L]) -> Result<(Round, Vec<Tensor>)>
    where
        L: Iterator<Item = Batch>,
    {
        if loaders.len() != self.workers.len() {
            return Err(FedError::LengthMismatch {
                expected: self.workers.len(),
                got: loaders.len(),
            });
        }

        let participants = if self.training {
            self.sampler.sample()
        } else {
            vec![self.head]
        };

        let batches = participants
            .iter()
            .map(|&id| loaders[id].next().ok_or(FedError::LoaderExhausted { worker_id: id }))
            .collect::<Result<Vec<_>>>()?;

        // Rounds are only recorded once every participant has its batch.
        let round = if self.training {
            let round = self.record.push(participants);
            debug!(round:? = round.index(), participants:? = round.participants(); "sampled round");
            round
        } else {
            Round::evaluation(self.head)
        };

        let calls = round
            .participants()
            .iter()
            .zip(batches)
            .map(|(&id, batch)| {
                let request = self.workers[id].send(ModelCall(batch));
                async move { request.await? }
            });

        let outputs = future::try_join_all(calls).await?;

        Ok((round, outputs))
    }

    /// Every round recorded so far.
    pub fn rounds(&self) -> &RoundRecord {
        &self.record
    }

    pub fn workers(&self) -> &Workers {
        &self.workers
    }
}

/* -------------------------------------------------------------------------- */
/*                                    Loss                                    */
/* -------------------------------------------------------------------------- */

/// Ways of evaluating the loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossArgs {
    /// On the participants of a round.
    Round(Round),
    /// On the head worker only.
    Evaluation,
    /// Keyword arguments, which workers don't support.
    Named(Vec<String>),
}

/// Losses computed by some workers, able to back-propagate on exactly those workers.
#[derive(Clone)]
pub struct LossResult {
    losses: Vec<f32>,
    workers: Vec<Addr<SketchedWorker>>,
}

impl LossResult {
    /// Per worker losses, in participant order.
    pub fn losses(&self) -> &[f32] {
        &self.losses
    }

    pub fn sum(&self) -> f32 {
        self.losses.iter().sum()
    }

    pub fn mean(&self) -> f32 {
        if self.losses.is_empty() {
            return 0.0;
        }

        self.sum() / self.losses.len() as f32
    }

    /// Runs the backward pass on every worker that produced a loss.
    pub async fn backward(&self) -> Result<()> {
        let ids = all_ids(&self.workers);
        fan_out(&self.workers, &ids, |_| LossBackward).await?;
        Ok(())
    }
}

impl fmt::Debug for LossResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LossResult")
            .field("losses", &self.losses)
            .field("workers", &self.workers.len())
            .finish()
    }
}

/// The loss facade.
pub struct FedLoss {
    workers: Workers,
    head: usize,
}

impl FedLoss {
    /// Sets a loss function on every worker.
    ///
    /// # Arguments
    /// * `workers` - The worker population.
    /// * `make` - Builds one criterion per worker.
    pub async fn new<F>(workers: Workers, make: F) -> Result<Self>
    where
        F: Fn() -> Box<dyn Criterion>,
    {
        let sends = workers.iter().map(|worker| worker.send(BindLoss(make())));
        future::try_join_all(sends).await?;

        Ok(Self {
            workers,
            head: DEFAULT_HEAD,
        })
    }

    pub fn set_head(&mut self, head: usize) -> Result<()> {
        check_head(&self.workers, head)?;
        self.head = head;
        Ok(())
    }

    pub fn head(&self) -> usize {
        self.head
    }

    /// Evaluates the loss on the participants of `round`.
    pub async fn call(&self, round: &Round) -> Result<LossResult> {
        self.evaluate_on(round.participants()).await
    }

    /// Evaluates the loss of the head's last forward pass.
    pub async fn evaluate(&self) -> Result<LossResult> {
        self.evaluate_on(&[self.head]).await
    }

    /// Evaluates the loss as described by `args`.
    ///
    /// # Returns
    /// `None` for keyword arguments, which are logged and otherwise ignored.
    pub async fn call_with(&self, args: LossArgs) -> Result<Option<LossResult>> {
        match args {
            LossArgs::Round(round) => self.call(&round).await.map(Some),
            LossArgs::Evaluation => self.evaluate().await.map(Some),
            LossArgs::Named(names) => {
                warn!(names:? = names; "keyword arguments are not supported by the loss, ignoring call");
                Ok(None)
            }
        }
    }

    async fn evaluate_on(&self, ids: &[usize]) -> Result<LossResult> {
        let losses = fan_out(&self.workers, ids, |_| LossCall).await?;
        let workers = ids.iter().map(|&id| self.workers[id].clone()).collect();
        Ok(LossResult { losses, workers })
    }
}

/* -------------------------------------------------------------------------- */
/*                                  Optimizer                                 */
/* -------------------------------------------------------------------------- */

/// The optimizer facade: gathers contributions and drives the redundant aggregation.
pub struct FedOptimizer {
    workers: Workers,
    head: usize,
    grad_size: usize,
}

impl FedOptimizer {
    /// Binds the optimizer on every worker.
    ///
    /// # Arguments
    /// * `workers` - The worker population, with models already bound.
    /// * `groups` - The parameter groups, or `None` for a single group over every parameter.
    ///
    /// # Returns
    /// The facade, or an error if the workers disagree on the flattened gradient size.
    pub async fn new(workers: Workers, groups: Option<Vec<ParamGroup>>) -> Result<Self> {
        let sizes = fan_out(&workers, &all_ids(&workers), |_| BindOptimizer(groups.clone())).await?;

        let grad_size = sizes.first().copied().unwrap_or_default();
        if let Some(&got) = sizes.iter().find(|&&size| size != grad_size) {
            return Err(FedError::LengthMismatch {
                expected: grad_size,
                got,
            });
        }

        Ok(Self {
            workers,
            head: DEFAULT_HEAD,
            grad_size,
        })
    }

    /// Changes the worker that always applies updates and reports param groups.
    pub fn set_head(&mut self, head: usize) -> Result<()> {
        check_head(&self.workers, head)?;
        self.head = head;
        Ok(())
    }

    pub fn head(&self) -> usize {
        self.head
    }

    /// Length of the flattened gradient shared by every worker.
    pub fn grad_size(&self) -> usize {
        self.grad_size
    }

    /// Workers that apply this round's update: the participants and the head, once.
    pub fn update_workers(&self, round: &Round) -> Vec<usize> {
        let mut ids = round.participants().to_vec();
        if !ids.contains(&self.head) {
            ids.push(self.head);
        }

        ids
    }

    /// Runs one optimizer step for `round`.
    ///
    /// Every participant folds its gradient into its momentum buffers and
    /// hands back its contribution. Every update worker then aggregates the
    /// same ordered contributions and applies the result to its own replica.
    pub async fn step(&self, round: &Round) -> Result<()> {
        let grads = fan_out(&self.workers, round.participants(), |_| ComputeGrad).await?;
        let grads = Arc::new(grads);

        let update_workers = self.update_workers(round);
        debug!(
            contributions = grads.len(),
            update_workers:? = update_workers;
            "aggregating round"
        );

        fan_out(&self.workers, &update_workers, |_| {
            AllReduceSketched(Arc::clone(&grads))
        })
        .await?;

        Ok(())
    }

    /// Zeroes the gradients of the participants of `round`.
    pub async fn zero_grad(&self, round: &Round) -> Result<()> {
        fan_out(&self.workers, round.participants(), |_| ZeroGrad).await?;
        Ok(())
    }

    /// Learning rates of every parameter group, as seen by the head.
    pub async fn param_groups(&self) -> Result<Vec<ParamGroupLr>> {
        self.workers[self.head].send(GetParamGroups).await?
    }

    /// Changes a hyperparameter of one parameter group on every worker.
    pub async fn set_hyperparameter(&self, group: usize, hyper: Hyperparameter, value: f32) -> Result<()> {
        fan_out(&self.workers, &all_ids(&self.workers), |_| SetHyperparameter {
            group,
            hyper,
            value,
        })
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{arr2, Array2};
    use rand::rngs::StdRng;

    use super::*;
    use crate::{
        model::{DifferentiableModel, Linear, Mse},
        orchestra::worker::{spawn_workers, Buffer, ReadBuffer},
    };

    fn config(num_workers: usize, participation_rate: f64) -> FedConfig {
        FedConfig {
            num_workers,
            k: 3,
            p2: 1,
            num_rows: 3,
            num_cols: 16,
            num_blocks: 1,
            lr: 0.1,
            momentum: 0.0,
            dampening: 0.0,
            weight_decay: 0.0,
            nesterov: false,
            participation_rate,
            sketch_biases: true,
            sketch_params_larger_than: 0,
            seed: Some(3),
            sketch_seed: 42,
        }
    }

    fn factory() -> ModelFactory {
        Arc::new(|rng: &mut StdRng| -> Box<dyn DifferentiableModel> {
            Box::new(Linear::new((2, 1), rng))
        })
    }

    fn loaders(n: usize) -> Vec<std::iter::Repeat<Batch>> {
        let batch = Batch {
            inputs: arr2(&[[1.0, 2.0], [0.5, -1.0]]).into_dyn(),
            targets: Array2::zeros((2, 1)).into_dyn(),
        };
        (0..n).map(|_| std::iter::repeat(batch.clone())).collect()
    }

    async fn setup(config: &FedConfig) -> (FedModel, FedLoss, FedOptimizer) {
        let workers: Workers = spawn_workers(config).unwrap().into();
        let model = FedModel::new(Arc::clone(&workers), config, factory()).await.unwrap();
        let loss = FedLoss::new(Arc::clone(&workers), || Box::new(Mse::new())).await.unwrap();
        let optimizer = FedOptimizer::new(workers, None).await.unwrap();
        (model, loss, optimizer)
    }

    #[actix_rt::test]
    async fn forward_runs_on_the_sampled_participants() {
        let config = config(4, 0.5);
        let (mut model, _, _) = setup(&config).await;

        let (round, outputs) = model.forward(&mut loaders(4)).await.unwrap();

        assert_eq!(round.participants().len(), 2);
        assert_eq!(outputs.len(), 2);
        assert_eq!(model.rounds().current(), Some(round));
    }

    #[actix_rt::test]
    async fn evaluation_runs_on_the_head_without_recording() {
        let config = config(4, 0.5);
        let (mut model, loss, _) = setup(&config).await;

        model.set_training(false).await.unwrap();
        model.set_head(2).unwrap();
        let (round, outputs) = model.forward(&mut loaders(4)).await.unwrap();

        assert!(round.is_evaluation());
        assert_eq!(round.participants(), [2]);
        assert_eq!(outputs.len(), 1);
        assert!(model.rounds().is_empty());

        let result = loss.call(&round).await.unwrap();
        assert_eq!(result.losses().len(), 1);
    }

    #[actix_rt::test]
    async fn exhausted_loaders_are_reported() {
        let config = config(2, 1.0);
        let (mut model, _, _) = setup(&config).await;
        let mut empty: Vec<std::vec::IntoIter<Batch>> = vec![Vec::new().into_iter(), Vec::new().into_iter()];

        let err = model.forward(&mut empty).await.unwrap_err();
        assert!(matches!(err, FedError::LoaderExhausted { .. }));
    }

    #[actix_rt::test]
    async fn targets_of_the_wrong_shape_fail_the_loss() {
        let config = config(2, 1.0);
        let (mut model, loss, _) = setup(&config).await;
        let batch = Batch {
            inputs: arr2(&[[1.0, 2.0], [0.5, -1.0]]).into_dyn(),
            targets: Array2::zeros((2, 3)).into_dyn(),
        };
        let mut loaders = vec![std::iter::repeat(batch.clone()), std::iter::repeat(batch)];

        let (round, _) = model.forward(&mut loaders).await.unwrap();
        let Err(err) = loss.call(&round).await else {
            panic!("mismatched targets must not produce a loss");
        };
        assert!(matches!(err, FedError::Shape(_)));
    }

    #[actix_rt::test]
    async fn rounds_are_not_recorded_when_a_loader_runs_dry() {
        let config = config(2, 1.0);
        let (mut model, _, _) = setup(&config).await;
        let batch = loaders(1).remove(0).next().unwrap();
        let mut uneven = vec![vec![batch].into_iter(), Vec::new().into_iter()];

        let err = model.forward(&mut uneven).await.unwrap_err();
        assert!(matches!(err, FedError::LoaderExhausted { worker_id: 1 }));
        assert!(model.rounds().is_empty());
        assert_eq!(model.rounds().current(), None);
    }

    #[actix_rt::test]
    async fn named_loss_arguments_are_ignored() {
        let config = config(2, 1.0);
        let (_, loss, _) = setup(&config).await;

        let result = loss
            .call_with(LossArgs::Named(vec!["reduction".into()]))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[actix_rt::test]
    async fn loss_before_forward_is_an_error() {
        let config = config(2, 1.0);
        let (_, loss, _) = setup(&config).await;

        let Err(err) = loss.evaluate().await else {
            panic!("a loss without a forward pass must fail");
        };
        assert!(matches!(err, FedError::MissingForward { worker_id: 0 }));
    }

    #[actix_rt::test]
    async fn head_is_added_to_update_workers_once() {
        let config = config(4, 0.5);
        let (mut model, _, optimizer) = setup(&config).await;
        let (round, _) = model.forward(&mut loaders(4)).await.unwrap();

        let update_workers = optimizer.update_workers(&round);
        let heads = update_workers.iter().filter(|&&id| id == DEFAULT_HEAD).count();
        assert_eq!(heads, 1);
        assert!(round.participants().iter().all(|id| update_workers.contains(id)));
    }

    #[actix_rt::test]
    async fn set_head_rejects_unknown_workers() {
        let config = config(2, 1.0);
        let (mut model, mut loss, mut optimizer) = setup(&config).await;

        assert!(model.set_head(2).is_err());
        assert!(loss.set_head(5).is_err());
        assert!(optimizer.set_head(2).is_err());
        assert!(optimizer.set_head(1).is_ok());
    }

    #[actix_rt::test]
    async fn hyperparameters_reach_every_worker() {
        let config = config(3, 1.0);
        let (_, _, mut optimizer) = setup(&config).await;

        optimizer.set_hyperparameter(0, Hyperparameter::Lr, 0.01).await.unwrap();
        assert_eq!(optimizer.param_groups().await.unwrap()[0].lr(), 0.01);

        optimizer.set_head(2).unwrap();
        assert_eq!(optimizer.param_groups().await.unwrap()[0].lr(), 0.01);
    }

    #[actix_rt::test]
    async fn step_updates_non_participating_head() {
        let mut config = config(4, 0.25);
        config.seed = Some(1);
        let (mut model, loss, optimizer) = setup(&config).await;
        let workers = Arc::clone(model.workers());

        // Sample until the head sits a round out.
        let round = loop {
            let (round, _) = model.forward(&mut loaders(4)).await.unwrap();
            if !round.participants().contains(&DEFAULT_HEAD) {
                break round;
            }
        };

        let before = workers[DEFAULT_HEAD].send(ReadBuffer(Buffer::Params)).await.unwrap().unwrap();

        optimizer.zero_grad(&round).await.unwrap();
        loss.call(&round).await.unwrap().backward().await.unwrap();
        optimizer.step(&round).await.unwrap();

        let trained = round.participants()[0];
        let head = workers[DEFAULT_HEAD].send(ReadBuffer(Buffer::Params)).await.unwrap().unwrap();
        let participant = workers[trained].send(ReadBuffer(Buffer::Params)).await.unwrap().unwrap();

        assert_ne!(head, before);
        assert_eq!(head, participant);
    }
}
