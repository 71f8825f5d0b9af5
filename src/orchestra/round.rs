use rand::{rngs::StdRng, seq::index, SeedableRng};

/// The participants of one training round.
///
/// Returned by the forward call and handed explicitly to the loss and the
/// optimizer step, so all three always agree on who trained this round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Round {
    index: Option<usize>,
    participants: Vec<usize>,
}

impl Round {
    /// An unrecorded round that only runs on the head worker.
    pub fn evaluation(head: usize) -> Self {
        Self {
            index: None,
            participants: vec![head],
        }
    }

    /// Position of this round in the record, `None` for evaluation rounds.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn is_evaluation(&self) -> bool {
        self.index.is_none()
    }

    /// Indices of the sampled workers, in sampling order.
    pub fn participants(&self) -> &[usize] {
        &self.participants
    }
}

/// Append only log of every round's participants.
#[derive(Debug, Default, Clone)]
pub struct RoundRecord {
    rounds: Vec<Vec<usize>>,
}

impl RoundRecord {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new round.
    ///
    /// # Returns
    /// The context of the round just recorded.
    pub fn push(&mut self, participants: Vec<usize>) -> Round {
        self.rounds.push(participants.clone());
        Round {
            index: Some(self.rounds.len() - 1),
            participants,
        }
    }

    /// The most recent round, if any.
    pub fn current(&self) -> Option<Round> {
        let index = self.rounds.len().checked_sub(1)?;
        Some(Round {
            index: Some(index),
            participants: self.rounds[index].clone(),
        })
    }

    /// Amount of rounds recorded so far.
    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    /// Participants of every round, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &[usize]> {
        self.rounds.iter().map(Vec::as_slice)
    }
}

/// Samples a subset of the worker population, uniformly and without replacement.
#[derive(Debug, Clone)]
pub struct ParticipantSampler {
    rng: StdRng,
    num_workers: usize,
    per_round: usize,
}

impl ParticipantSampler {
    /// Creates a new `ParticipantSampler`.
    ///
    /// # Arguments
    /// * `num_workers` - Size of the population.
    /// * `per_round` - Workers sampled per round, at most `num_workers`.
    /// * `seed` - An optional seed for the rng, OS entropy when absent.
    pub fn new(num_workers: usize, per_round: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self {
            rng,
            num_workers,
            per_round: per_round.min(num_workers),
        }
    }

    /// Workers sampled per round.
    pub fn per_round(&self) -> usize {
        self.per_round
    }

    /// Draws the next round's participants.
    pub fn sample(&mut self) -> Vec<usize> {
        index::sample(&mut self.rng, self.num_workers, self.per_round).into_vec()
    }
}
