use std::sync::Arc;

use log::{debug, info};

use super::{
    federated::{FedLoss, FedModel, FedOptimizer, Workers},
    round::Round,
    worker::spawn_workers,
};
use crate::{
    config::FedConfig,
    error::Result,
    model::{Batch, Criterion, ModelFactory},
    optim::ParamGroup,
};

/// Outcome of one training round.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundReport {
    pub round: Round,
    pub mean_loss: f32,
}

/// Drives the model, loss and optimizer facades through whole rounds,
/// threading each round's context from the forward pass to the step.
pub struct Orchestrator {
    model: FedModel,
    loss: FedLoss,
    optimizer: FedOptimizer,
}

impl Orchestrator {
    /// Starts the workers and binds the model, loss and optimizer on every one of them.
    ///
    /// # Arguments
    /// * `config` - The run's configuration.
    /// * `factory` - Builds one model replica.
    /// * `criterion` - Builds one loss function.
    /// * `groups` - The parameter groups, or `None` for a single group.
    pub async fn new<F>(
        config: &FedConfig,
        factory: ModelFactory,
        criterion: F,
        groups: Option<Vec<ParamGroup>>,
    ) -> Result<Self>
    where
        F: Fn() -> Box<dyn Criterion>,
    {
        let workers: Workers = spawn_workers(config)?.into();

        let model = FedModel::new(Arc::clone(&workers), config, factory).await?;
        let loss = FedLoss::new(Arc::clone(&workers), criterion).await?;
        let optimizer = FedOptimizer::new(workers, groups).await?;

        info!(
            num_workers = config.num_workers,
            per_round = config.participants_per_round(),
            grad_size = optimizer.grad_size();
            "federation ready"
        );

        Ok(Self {
            model,
            loss,
            optimizer,
        })
    }

    /// Runs one training round: forward, zero grad, loss, backward and step,
    /// all on the same sampled participants.
    ///
    /// # Arguments
    /// * `loaders` - One batch source per worker.
    pub async fn run_round<L>(&mut self, loaders: &mut [L]) -> Result<RoundReport>
    where
        L: Iterator<Item = Batch>,
    {
        if !self.model.is_training() {
            self.model.set_training(true).await?;
        }

        let (round, _) = self.model.forward(loaders).await?;

        self.optimizer.zero_grad(&round).await?;
        let losses = self.loss.call(&round).await?;
        losses.backward().await?;
        self.optimizer.step(&round).await?;

        let mean_loss = losses.mean();
        debug!(round:? = round.index(), mean_loss = mean_loss; "round finished");

        Ok(RoundReport { round, mean_loss })
    }

    /// Evaluates the head's model on its next batch, without training.
    pub async fn evaluate<L>(&mut self, loaders: &mut [L]) -> Result<f32>
    where
        L: Iterator<Item = Batch>,
    {
        self.model.set_training(false).await?;
        let (round, _) = self.model.forward(loaders).await?;
        let loss = self.loss.call(&round).await?;
        self.model.set_training(true).await?;

        Ok(loss.mean())
    }

    /// Moves the head to worker `head` on the model, loss and optimizer alike.
    ///
    /// Nothing changes if `head` is not a worker.
    pub fn set_head(&mut self, head: usize) -> Result<()> {
        self.model.set_head(head)?;
        self.loss.set_head(head)?;
        self.optimizer.set_head(head)?;

        debug!(head = head; "head moved");
        Ok(())
    }

    pub fn head(&self) -> usize {
        self.model.head()
    }

    pub fn model(&self) -> &FedModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut FedModel {
        &mut self.model
    }

    pub fn loss_mut(&mut self) -> &mut FedLoss {
        &mut self.loss
    }

    pub fn optimizer(&self) -> &FedOptimizer {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut FedOptimizer {
        &mut self.optimizer
    }
}
