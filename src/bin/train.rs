/// Train the bundled MLP classifier under a chosen precision mode
///
/// Usage: precision-train <config.json> <data_dir>
///
/// `data_dir` holds `train_inputs.npy`, `train_labels.npy`, `test_inputs.npy`
/// and `test_labels.npy`.
use anyhow::{bail, Context};
use precision_train::config::select_device;
use precision_train::data::{ArrayDataLoader, ArrayDataset, BatchDataLoader};
use precision_train::tracking::JsonlSink;
use precision_train::{MlpClassifier, RunConfig, Trainer};

fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        bail!("usage: {} <config.json> <data_dir>", args[0]);
    }

    let mut config = RunConfig::from_json_file(&args[1])
        .with_context(|| format!("failed to read run configuration {}", args[1]))?;

    log::info!("Loading dataset from: {}", args[2]);
    let train_set = ArrayDataset::from_npy_dir(&args[2], "train")?;
    let test_set = ArrayDataset::from_npy_dir(&args[2], "test")?;
    if train_set.n_features() != test_set.n_features() {
        bail!(
            "train and test splits disagree on feature count ({} vs {})",
            train_set.n_features(),
            test_set.n_features()
        );
    }

    // The input layer follows the data
    config.model.input_size = train_set.n_features();

    let device = select_device(config.compute_device);
    log::info!("Using device: {:?}", device);

    let mut train_loader = match config.seed {
        Some(seed) => ArrayDataLoader::seeded(train_set, config.batch_size, true, seed),
        None => ArrayDataLoader::new(train_set, config.batch_size, true),
    };
    let mut test_loader = ArrayDataLoader::new(test_set, config.batch_size, false);

    log::info!("Data loaders created:");
    log::info!("  - Train examples: {}", train_loader.dataset().len());
    log::info!("  - Test examples: {}", test_loader.dataset().len());
    log::info!("  - Num batches: {}", train_loader.num_batches());

    let mut sink = JsonlSink::new(config.model_path.join("metrics.jsonl"));
    let model = MlpClassifier::new(config.model.clone(), &device)?;
    log::info!("Model configuration: {:#?}", model.config());

    let trainer = Trainer::new(model, config, device)?;
    let outcome = trainer.train(&mut train_loader, &mut test_loader, &mut sink)?;

    log::info!("Best test accuracy: {:.2}%", outcome.result.best_accuracy * 100.0);
    if let Some(acc) = outcome.result.last_test_accuracy {
        log::info!("Final test accuracy: {:.2}%", acc * 100.0);
    }
    if let Some(acc) = outcome.result.last_train_accuracy {
        log::info!("Last train accuracy: {:.2}%", acc * 100.0);
    }

    Ok(())
}
