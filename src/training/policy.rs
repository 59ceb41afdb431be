//! Epoch-level control policies. Each observes the validation loss once per epoch and
//! answers with a value; the trainer decides what to do with it.

use std::path::PathBuf;

/// Result of feeding one validation loss to [`EarlyStopping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub improved: bool,
    pub stop: bool,
}

/// Stop after `patience` consecutive epochs without a strictly lower validation loss.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: f32,
    best_epoch: usize,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: f32::INFINITY,
            best_epoch: 0,
            wait: 0,
        }
    }

    pub fn observe(&mut self, epoch: usize, val_loss: f32) -> Observation {
        if val_loss < self.best {
            self.best = val_loss;
            self.best_epoch = epoch;
            self.wait = 0;
            return Observation {
                improved: true,
                stop: false,
            };
        }
        self.wait += 1;
        Observation {
            improved: false,
            stop: self.wait >= self.patience,
        }
    }

    pub fn best(&self) -> f32 {
        self.best
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }
}

/// Multiply the learning rate by `factor` once the loss has not improved by more than
/// `min_delta` for `patience` epochs; the counter restarts after each reduction.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    patience: usize,
    factor: f32,
    min_delta: f32,
    min_lr: f32,
    best: f32,
    wait: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(patience: usize, factor: f32) -> Self {
        Self {
            patience,
            factor,
            min_delta: 1e-4,
            min_lr: 0.0,
            best: f32::INFINITY,
            wait: 0,
        }
    }

    pub fn min_lr(mut self, min_lr: f32) -> Self {
        self.min_lr = min_lr;
        self
    }

    /// Returns the new learning rate when a reduction fires.
    pub fn observe(&mut self, val_loss: f32, current_lr: f32) -> Option<f32> {
        if val_loss < self.best - self.min_delta {
            self.best = val_loss;
            self.wait = 0;
            return None;
        }
        self.wait += 1;
        if self.wait < self.patience {
            return None;
        }
        self.wait = 0;
        let next = (current_lr * self.factor).max(self.min_lr);
        (next < current_lr).then_some(next)
    }
}

/// Patience windows and checkpointing for one training run.
#[derive(Debug, Clone)]
pub struct TrainingSchedule {
    pub early_stopping_patience: usize,
    pub lr_patience: usize,
    pub lr_factor: f32,
    /// Roll back to the best-validation weights when training ends.
    pub restore_best: bool,
    /// Persist the best weights here every time validation loss improves.
    pub checkpoint: Option<PathBuf>,
}

impl TrainingSchedule {
    pub fn branch() -> Self {
        Self {
            early_stopping_patience: 10,
            lr_patience: 5,
            lr_factor: 0.5,
            restore_best: true,
            checkpoint: None,
        }
    }

    pub fn ensemble(checkpoint: PathBuf) -> Self {
        Self {
            early_stopping_patience: 15,
            lr_patience: 7,
            lr_factor: 0.5,
            restore_best: true,
            checkpoint: Some(checkpoint),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn early_stopping_waits_for_patience() {
        let mut es = EarlyStopping::new(3);
        assert!(es.observe(1, 1.0).improved);
        assert!(es.observe(2, 0.8).improved);
        assert!(!es.observe(3, 0.8).stop);
        assert!(!es.observe(4, 0.9).stop);
        let o = es.observe(5, 0.85);
        assert!(o.stop && !o.improved);
        assert_eq!(es.best_epoch(), 2);
        assert_eq!(es.best(), 0.8);
    }

    #[test]
    fn improvement_resets_early_stopping() {
        let mut es = EarlyStopping::new(2);
        es.observe(1, 1.0);
        es.observe(2, 1.1);
        assert!(es.observe(3, 0.5).improved);
        assert!(!es.observe(4, 0.6).stop);
        assert!(es.observe(5, 0.6).stop);
    }

    #[test]
    fn plateau_halves_learning_rate() {
        let mut p = ReduceLrOnPlateau::new(2, 0.5);
        assert_eq!(p.observe(1.0, 0.1), None);
        assert_eq!(p.observe(0.99995, 0.1), None); // below min_delta
        assert_eq!(p.observe(1.0, 0.1), Some(0.05));
        assert_eq!(p.observe(1.0, 0.05), None);
        assert_eq!(p.observe(1.0, 0.05), Some(0.025));
    }

    #[test]
    fn plateau_respects_floor() {
        let mut p = ReduceLrOnPlateau::new(1, 0.5).min_lr(0.04);
        p.observe(1.0, 0.05);
        assert_eq!(p.observe(1.0, 0.05), Some(0.04));
        assert_eq!(p.observe(1.0, 0.04), None);
    }

    #[test]
    fn schedules_match_model_kind() {
        let b = TrainingSchedule::branch();
        assert_eq!((b.early_stopping_patience, b.lr_patience), (10, 5));
        assert!(b.checkpoint.is_none());
        let e = TrainingSchedule::ensemble("models/ensemble_best.json".into());
        assert_eq!((e.early_stopping_patience, e.lr_patience), (15, 7));
        assert!(e.checkpoint.is_some());
    }
}
