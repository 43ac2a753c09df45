use anyhow::Result;
use tempfile::TempDir;

use detkit::metrics::keys;
use detkit::train::launch;
use detkit::{load_train_stats, BackendRegistry, DatasetSplit, StubBackend, TrainConfig};

fn config_in(dir: &TempDir) -> TrainConfig {
    TrainConfig {
        project: dir.path().join("runs/detect"),
        name: "smoke".to_string(),
        epochs: 1,
        device: "cpu".to_string(),
        ..TrainConfig::default()
    }
}

#[test]
fn launch_trains_then_records_train_split_metrics() -> Result<()> {
    let dir = TempDir::new()?;
    let stub = StubBackend::new();
    let calls = stub.calls();
    let mut registry = BackendRegistry::new();
    registry.register(stub);

    let config = config_in(&dir);
    let outcome = launch(&registry, &config)?;

    assert_eq!(outcome.run_dir, dir.path().join("runs/detect/smoke"));
    assert!(config.best_weights().is_file());
    let stats_path = outcome.train_stats.expect("train stats written");
    assert_eq!(stats_path, config.train_stats_path());

    let stats = load_train_stats(&stats_path)?;
    assert_eq!(stats.get(keys::PRECISION), Some(0.8));
    assert_eq!(stats.get(keys::MAP50_95), Some(0.5));

    let calls = calls.lock().unwrap();
    assert_eq!(calls.trainings, vec![config.clone()]);
    assert_eq!(calls.validations.len(), 1);
    assert_eq!(calls.validations[0].split, DatasetSplit::Train);
    assert_eq!(calls.validations[0].weights, config.best_weights());
    Ok(())
}

#[test]
fn invalid_bundle_never_reaches_backend() -> Result<()> {
    let dir = TempDir::new()?;
    let stub = StubBackend::new();
    let calls = stub.calls();
    let mut registry = BackendRegistry::new();
    registry.register(stub);

    let config = TrainConfig {
        fliplr: 1.5,
        ..config_in(&dir)
    };
    assert!(launch(&registry, &config).is_err());
    assert!(calls.lock().unwrap().trainings.is_empty());
    assert!(!config.run_dir().exists());
    Ok(())
}
