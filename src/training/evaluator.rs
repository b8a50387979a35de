/// Held-out evaluation: accuracy and confusion matrix
use candle_core::{DType, Device};

use crate::data::BatchDataLoader;
use crate::metrics::{accuracy_score, ConfusionMatrix};
use crate::models::Classifier;
use crate::TrainerError;

/// Result of one pass over an evaluation split
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub accuracy: f64,
    pub confusion: ConfusionMatrix,
}

/// Run `model` over every batch of `loader` without touching its parameters
///
/// The model is switched to evaluation mode for the pass and put back into
/// whatever mode it was in afterwards. The loader is rewound first.
pub fn evaluate<M: Classifier + ?Sized>(
    model: &mut M,
    loader: &mut dyn BatchDataLoader,
    n_classes: usize,
    device: &Device,
) -> crate::Result<Evaluation> {
    let was_training = model.is_training();
    model.set_training(false);
    let outcome = collect_predictions(model, loader, device);
    model.set_training(was_training);

    let (y_true, y_pred) = outcome?;
    if y_true.is_empty() {
        return Err(TrainerError::Training("evaluation split is empty".to_string()));
    }

    Ok(Evaluation {
        accuracy: accuracy_score(&y_true, &y_pred)?,
        confusion: ConfusionMatrix::from_labels(&y_true, &y_pred, n_classes)?,
    })
}

fn collect_predictions<M: Classifier + ?Sized>(
    model: &M,
    loader: &mut dyn BatchDataLoader,
    device: &Device,
) -> crate::Result<(Vec<u32>, Vec<u32>)> {
    loader.reset();
    let mut y_true = Vec::new();
    let mut y_pred = Vec::new();

    while let Some((inputs, labels)) = loader.next_batch(device)? {
        // Detached: no graph is kept for evaluation batches
        let logits = model.forward(&inputs)?.detach();
        let predicted = logits
            .to_dtype(DType::F32)?
            .argmax(1)?
            .to_dtype(DType::U32)?
            .to_vec1::<u32>()?;
        y_pred.extend(predicted);
        y_true.extend(labels.to_dtype(DType::U32)?.to_vec1::<u32>()?);
    }

    Ok((y_true, y_pred))
}
