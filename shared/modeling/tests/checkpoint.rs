mod common;

use common::{dummy, linear, sequential, snapshot};
use ember_modeling::{
    evaluate, CheckpointError, CheckpointManager, DataParallel, SingleWorker, Trainer,
    TrainingConfig,
};
use ember_telemetry::NullSink;
use pretty_assertions::assert_eq;
use test_log::test;

#[test]
fn round_trip_restores_parameters_and_accuracy() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CheckpointManager::in_dir(dir.path(), "model.safetensors");
    let train_set = dummy(24, 1);
    let test_set = dummy(9, 2);
    let test = sequential(&test_set, 4);

    // train a little so the saved weights differ from any fresh initialization
    let mut trainer = Trainer::new(
        DataParallel::new(linear(4), Box::new(SingleWorker)),
        TrainingConfig {
            num_epochs: 2,
            eval_every: 0,
            ..Default::default()
        },
        None,
    )
    .unwrap();
    trainer
        .run(&mut sequential(&train_set, 8), &test, &mut NullSink)
        .unwrap();
    let mut trained = trainer.into_model();
    manager.save(trained.module().var_store()).unwrap();
    let expected = evaluate(&mut trained, &test, None, 0).unwrap();

    let mut restored = DataParallel::new(linear(99), Box::new(SingleWorker));
    assert_ne!(snapshot(&restored), snapshot(&trained));
    manager.load(restored.module().var_store()).unwrap();

    assert_eq!(snapshot(&restored), snapshot(&trained));
    assert_eq!(evaluate(&mut restored, &test, None, 0).unwrap(), expected);
}

#[test]
fn resume_from_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CheckpointManager::in_dir(dir.path(), "never_written.safetensors");
    assert!(!manager.exists());
    let model = linear(0);
    assert!(matches!(
        manager.load(model.var_store()),
        Err(CheckpointError::NotFound(_))
    ));
}

#[test]
fn rank_zero_checkpoints_at_eval_epochs() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CheckpointManager::in_dir(dir.path().join("saved_models"), "model.safetensors");
    let train_set = dummy(8, 1);
    let test_set = dummy(4, 2);

    let mut trainer = Trainer::new(
        DataParallel::new(linear(4), Box::new(SingleWorker)),
        TrainingConfig {
            num_epochs: 5,
            eval_every: 2,
            ..Default::default()
        },
        Some(manager.clone()),
    )
    .unwrap();
    let summary = trainer
        .run(
            &mut sequential(&train_set, 4),
            &sequential(&test_set, 4),
            &mut NullSink,
        )
        .unwrap();

    assert_eq!(summary.checkpoints_written, 3);
    assert!(manager.exists());
}
