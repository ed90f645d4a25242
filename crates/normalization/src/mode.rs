//! Training/inference selection passed explicitly to every forward call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag read when the phase is only known at execution time.
///
/// Clones observe the same flag, so a training loop can flip it between
/// steps without rebuilding the call sites that hold it.
#[derive(Debug, Clone, Default)]
pub struct LearningPhase(Arc<AtomicBool>);

impl LearningPhase {
    pub fn new(training: bool) -> Self {
        Self(Arc::new(AtomicBool::new(training)))
    }

    pub fn set_training(&self, training: bool) {
        self.0.store(training, Ordering::SeqCst);
    }

    pub fn is_training(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a forward call should treat batch statistics.
#[derive(Debug, Clone)]
pub enum TrainingMode {
    /// Normalise with batch statistics and update the moving averages.
    Train,
    /// Normalise with the moving averages; no updates.
    Infer,
    /// Compute both paths' inputs and pick one from the flag at call time.
    RuntimeDecided(LearningPhase),
}

impl TrainingMode {
    /// Phase known without consulting a runtime flag.
    pub fn constant_value(&self) -> Option<bool> {
        match self {
            TrainingMode::Train => Some(true),
            TrainingMode::Infer => Some(false),
            TrainingMode::RuntimeDecided(_) => None,
        }
    }

    /// Phase at the moment of the call.
    pub fn is_training(&self) -> bool {
        match self {
            TrainingMode::Train => true,
            TrainingMode::Infer => false,
            TrainingMode::RuntimeDecided(phase) => phase.is_training(),
        }
    }
}

impl From<bool> for TrainingMode {
    fn from(training: bool) -> Self {
        if training {
            TrainingMode::Train
        } else {
            TrainingMode::Infer
        }
    }
}
