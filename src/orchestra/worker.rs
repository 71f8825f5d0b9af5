use std::sync::Arc;

use actix::prelude::*;
use log::{debug, info};
use rand::{rngs::StdRng, SeedableRng};

use super::{
    aggregate::{sketched_aggregate, TopKParams},
    state::{MomentumState, SgdSettings},
};
use crate::{
    config::FedConfig,
    error::{FedError, Result},
    model::{Batch, Criterion, DifferentiableModel, ModelFactory, Tensor},
    optim::{FlatLayout, Hyperparameter, ParamGroup, ParamGroupLr, SketchRules},
    sketch::CountSketch,
};

/// Seed every replica is initialised with, so all of them start identical.
pub const MODEL_INIT_SEED: u64 = 42;

/* -------------------------------------------------------------------------- */
/*                               Actix messages                               */
/* -------------------------------------------------------------------------- */

/// Builds the worker's model replica.
#[derive(Message)]
#[rtype(result = "Result<()>")]
pub struct BindModel(pub ModelFactory);

/// Sets the worker's loss function.
#[derive(Message)]
#[rtype(result = "()")]
pub struct BindLoss(pub Box<dyn Criterion>);

/// Binds the optimizer to the model, fixing the flattened layout for the rest of training.
///
/// `None` puts every parameter in a single group with the configured learning rate.
#[derive(Message)]
#[rtype(result = "Result<usize>")]
pub struct BindOptimizer(pub Option<Vec<ParamGroup>>);

/// Runs the forward pass, keeping the outputs and targets for the loss.
#[derive(Message)]
#[rtype(result = "Result<Tensor>")]
pub struct ModelCall(pub Batch);

/// Evaluates the loss of the last forward pass.
#[derive(Message)]
#[rtype(result = "Result<f32>")]
pub struct LossCall;

/// Back-propagates the last evaluated loss.
#[derive(Message)]
#[rtype(result = "Result<()>")]
pub struct LossBackward;

/// Zeroes the parameter gradients.
#[derive(Message)]
#[rtype(result = "Result<()>")]
pub struct ZeroGrad;

/// Folds the current gradient into the momentum buffers and returns the
/// worker's contribution to aggregation.
#[derive(Message)]
#[rtype(result = "Result<Arc<[f32]>>")]
pub struct ComputeGrad;

/// Aggregates the round's contributions and applies the result locally.
#[derive(Message)]
#[rtype(result = "Result<()>")]
pub struct AllReduceSketched(pub Arc<Vec<Arc<[f32]>>>);

/// Switches the replica between training and evaluation.
#[derive(Message)]
#[rtype(result = "Result<()>")]
pub struct SetTraining(pub bool);

/// Reads the learning rates of every parameter group.
#[derive(Message)]
#[rtype(result = "Result<Vec<ParamGroupLr>>")]
pub struct GetParamGroups;

/// Changes a hyperparameter of one parameter group.
#[derive(Message)]
#[rtype(result = "Result<()>")]
pub struct SetHyperparameter {
    pub group: usize,
    pub hyper: Hyperparameter,
    pub value: f32,
}

/// Flattened buffers a worker exposes for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Buffer {
    Params,
    Momentum,
    Velocity,
}

/// Reads a copy of one of the worker's flattened buffers.
#[derive(Message)]
#[rtype(result = "Result<Vec<f32>>")]
pub struct ReadBuffer(pub Buffer);

/* -------------------------------------------------------------------------- */
/*                                Worker actor                                */
/* -------------------------------------------------------------------------- */

/// Everything that exists once the optimizer is bound to the model.
struct Bound {
    groups: Vec<ParamGroup>,
    layout: FlatLayout,
    sketch: CountSketch,
    state: MomentumState,
}

/// Outputs and targets of the last forward pass.
struct Pending {
    outputs: Tensor,
    targets: Tensor,
}

/// One federated worker.
///
/// Owns a model replica, its momentum and error feedback buffers and a
/// persistent sketch reused every round. Nothing here is shared with other
/// workers, contributions travel as immutable `Arc<[f32]>` snapshots.
pub struct SketchedWorker {
    id: usize,
    config: Arc<FedConfig>,
    settings: SgdSettings,
    rules: SketchRules,
    model: Option<Box<dyn DifferentiableModel>>,
    criterion: Option<Box<dyn Criterion>>,
    bound: Option<Bound>,
    pending: Option<Pending>,
}

impl SketchedWorker {
    /// Creates a new worker with nothing bound yet.
    ///
    /// # Arguments
    /// * `id` - Index of this worker in the population.
    /// * `config` - The run's configuration, shared by every worker.
    pub fn new(id: usize, config: Arc<FedConfig>) -> Self {
        Self {
            id,
            settings: SgdSettings::from(config.as_ref()),
            rules: SketchRules {
                sketch_biases: config.sketch_biases,
                sketch_params_larger_than: config.sketch_params_larger_than,
            },
            config,
            model: None,
            criterion: None,
            bound: None,
            pending: None,
        }
    }

    fn model_mut(&mut self) -> Result<&mut Box<dyn DifferentiableModel>> {
        self.model.as_mut().ok_or(FedError::NotBound {
            worker_id: self.id,
            what: "model",
        })
    }

    fn bound(&self) -> Result<&Bound> {
        self.bound.as_ref().ok_or(FedError::NotBound {
            worker_id: self.id,
            what: "optimizer",
        })
    }

    /// Splits `self` into the model and the bound optimizer state, both of which are required.
    fn parts_mut(&mut self) -> Result<(&mut Box<dyn DifferentiableModel>, &mut Bound)> {
        let id = self.id;
        let model = self.model.as_mut().ok_or(FedError::NotBound {
            worker_id: id,
            what: "model",
        })?;
        let bound = self.bound.as_mut().ok_or(FedError::NotBound {
            worker_id: id,
            what: "optimizer",
        })?;
        Ok((model, bound))
    }

    fn apply_update(&mut self, update: &[f32]) -> Result<()> {
        let (model, bound) = self.parts_mut()?;

        bound.state.discharge(update, bound.layout.sketch_mask())?;

        let params = model.parameters_mut();
        let lr = bound.layout.lr_vec(params, &bound.groups);
        bound.layout.apply(params, update, &lr)
    }
}

impl Actor for SketchedWorker {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        debug!(worker_id = self.id; "worker started");
    }
}

impl Handler<BindModel> for SketchedWorker {
    type Result = Result<()>;

    fn handle(&mut self, msg: BindModel, _ctx: &mut Self::Context) -> Self::Result {
        let mut rng = StdRng::seed_from_u64(MODEL_INIT_SEED);
        self.model = Some((msg.0)(&mut rng));
        self.bound = None;
        self.pending = None;
        Ok(())
    }
}

impl Handler<BindLoss> for SketchedWorker {
    type Result = ();

    fn handle(&mut self, msg: BindLoss, _ctx: &mut Self::Context) -> Self::Result {
        self.criterion = Some(msg.0);
    }
}

impl Handler<BindOptimizer> for SketchedWorker {
    type Result = Result<usize>;

    fn handle(&mut self, msg: BindOptimizer, _ctx: &mut Self::Context) -> Self::Result {
        let (id, lr, rules) = (self.id, self.config.lr, self.rules);
        let config = Arc::clone(&self.config);
        let params = self.model_mut()?.parameters();

        let groups = msg.0.unwrap_or_else(|| vec![ParamGroup::all(params.len(), lr)]);
        let layout = FlatLayout::new(params, &groups, rules)?;
        let grad_size = layout.grad_size();
        let sketched = layout.sketched_coords().len();

        let sketch = CountSketch::new(
            sketched,
            config.num_cols,
            config.num_rows,
            config.num_blocks,
            config.sketch_seed,
        )?;

        info!(
            worker_id = id,
            grad_size = grad_size,
            k = config.k,
            p2 = config.p2,
            sketched = sketched;
            "optimizer bound"
        );

        self.bound = Some(Bound {
            groups,
            layout,
            sketch,
            state: MomentumState::new(grad_size),
        });

        Ok(grad_size)
    }
}

impl Handler<ModelCall> for SketchedWorker {
    type Result = Result<Tensor>;

    fn handle(&mut self, msg: ModelCall, _ctx: &mut Self::Context) -> Self::Result {
        let Batch { inputs, targets } = msg.0;
        let outputs = self.model_mut()?.forward(&inputs)?;

        self.pending = Some(Pending {
            outputs: outputs.clone(),
            targets,
        });

        Ok(outputs)
    }
}

impl Handler<LossCall> for SketchedWorker {
    type Result = Result<f32>;

    fn handle(&mut self, _msg: LossCall, _ctx: &mut Self::Context) -> Self::Result {
        let criterion = self.criterion.as_ref().ok_or(FedError::NotBound {
            worker_id: self.id,
            what: "loss",
        })?;
        let pending = self
            .pending
            .as_ref()
            .ok_or(FedError::MissingForward { worker_id: self.id })?;

        criterion.loss(&pending.outputs, &pending.targets)
    }
}

impl Handler<LossBackward> for SketchedWorker {
    type Result = Result<()>;

    fn handle(&mut self, _msg: LossBackward, _ctx: &mut Self::Context) -> Self::Result {
        let id = self.id;
        let criterion = self.criterion.as_ref().ok_or(FedError::NotBound {
            worker_id: id,
            what: "loss",
        })?;
        let pending = self
            .pending
            .take()
            .ok_or(FedError::MissingForward { worker_id: id })?;

        let grad_outputs = criterion.loss_grad(&pending.outputs, &pending.targets)?;
        self.model_mut()?.backward(&grad_outputs)
    }
}

impl Handler<ZeroGrad> for SketchedWorker {
    type Result = Result<()>;

    fn handle(&mut self, _msg: ZeroGrad, _ctx: &mut Self::Context) -> Self::Result {
        let (model, bound) = self.parts_mut()?;
        bound.layout.zero_grads(model.parameters_mut());
        Ok(())
    }
}

impl Handler<ComputeGrad> for SketchedWorker {
    type Result = Result<Arc<[f32]>>;

    fn handle(&mut self, _msg: ComputeGrad, _ctx: &mut Self::Context) -> Self::Result {
        let settings = self.settings;
        let (model, bound) = self.parts_mut()?;

        let params = model.parameters();
        let mut grad = bound.layout.grad_vec(params);
        let param_vec = bound.layout.param_vec(params);

        let v = bound.state.step(&mut grad, &param_vec, &settings)?;
        Ok(Arc::from(v))
    }
}

impl Handler<AllReduceSketched> for SketchedWorker {
    type Result = Result<()>;

    fn handle(&mut self, msg: AllReduceSketched, _ctx: &mut Self::Context) -> Self::Result {
        let params = TopKParams {
            k: self.config.k,
            p2: self.config.p2,
        };

        let Some(bound) = self.bound.as_mut() else {
            return Err(FedError::NotBound {
                worker_id: self.id,
                what: "optimizer",
            });
        };

        let update = sketched_aggregate(&mut bound.sketch, &bound.layout, msg.0.as_slice(), params)?;

        debug!(
            worker_id = self.id,
            contributions = msg.0.len(),
            nonzero = update.iter().filter(|&&x| x != 0.0).count();
            "applying aggregated update"
        );

        self.apply_update(&update)
    }
}

impl Handler<SetTraining> for SketchedWorker {
    type Result = Result<()>;

    fn handle(&mut self, msg: SetTraining, _ctx: &mut Self::Context) -> Self::Result {
        self.model_mut()?.set_training(msg.0);
        Ok(())
    }
}

impl Handler<GetParamGroups> for SketchedWorker {
    type Result = Result<Vec<ParamGroupLr>>;

    fn handle(&mut self, _msg: GetParamGroups, _ctx: &mut Self::Context) -> Self::Result {
        let bound = self.bound()?;
        Ok(bound.groups.iter().map(ParamGroup::lr_report).collect())
    }
}

impl Handler<SetHyperparameter> for SketchedWorker {
    type Result = Result<()>;

    fn handle(&mut self, msg: SetHyperparameter, _ctx: &mut Self::Context) -> Self::Result {
        let id = self.id;
        let Some(bound) = self.bound.as_mut() else {
            return Err(FedError::NotBound {
                worker_id: id,
                what: "optimizer",
            });
        };

        let ngroups = bound.groups.len();
        let group = bound.groups.get_mut(msg.group).ok_or_else(|| {
            FedError::InvalidConfig(format!("group {} out of range, there are {ngroups}", msg.group))
        })?;

        group.set(msg.hyper, msg.value)
    }
}

impl Handler<ReadBuffer> for SketchedWorker {
    type Result = Result<Vec<f32>>;

    fn handle(&mut self, msg: ReadBuffer, _ctx: &mut Self::Context) -> Self::Result {
        let bound = self.bound()?;

        match msg.0 {
            Buffer::Momentum => Ok(bound.state.u().to_vec()),
            Buffer::Velocity => Ok(bound.state.v().to_vec()),
            Buffer::Params => {
                let model = self.model.as_ref().ok_or(FedError::NotBound {
                    worker_id: self.id,
                    what: "model",
                })?;
                Ok(bound.layout.param_vec(model.parameters()))
            }
        }
    }
}

/// Starts one worker actor per configured worker on the current arbiter.
///
/// # Returns
/// The workers' addresses, or an error if the configuration is invalid.
pub fn spawn_workers(config: &FedConfig) -> Result<Vec<Addr<SketchedWorker>>> {
    config.validate()?;
    let config = Arc::new(config.clone());

    let workers = (0..config.num_workers)
        .map(|id| SketchedWorker::new(id, Arc::clone(&config)).start())
        .collect();

    Ok(workers)
}
