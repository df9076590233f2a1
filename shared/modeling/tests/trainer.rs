mod common;

use common::{dummy, linear, run_local_group, sequential, set_parameter, sharded, CLASSES, FEATURES};
use ember_core::Regularization;
use ember_modeling::{
    DataParallel, EpochPhase, SingleWorker, TrainError, Trainer, TrainingConfig,
};
use ember_telemetry::{MemorySink, NullSink};
use rstest::rstest;
use tch::{kind::FLOAT_CPU, Tensor};

fn single_worker_trainer(config: TrainingConfig) -> Trainer<ember_modeling::LinearClassifier> {
    Trainer::new(DataParallel::new(linear(8), Box::new(SingleWorker)), config, None).unwrap()
}

#[test_log::test]
fn training_reduces_loss_and_closes_sink() {
    let train_set = dummy(60, 3);
    let test_set = dummy(30, 4);
    let mut trainer = single_worker_trainer(TrainingConfig {
        num_epochs: 6,
        eval_every: 5,
        ..Default::default()
    });
    assert_eq!(trainer.phase(), EpochPhase::Init);

    let sink = MemorySink::new();
    let summary = trainer
        .run(
            &mut sharded(&train_set, 1, 0, 10),
            &sequential(&test_set, 16),
            &mut sink.clone(),
        )
        .unwrap();

    assert_eq!(trainer.phase(), EpochPhase::Closed);
    assert!(sink.is_closed());
    let losses = sink.values("Loss/train");
    assert_eq!(losses.iter().map(|(step, _)| *step).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4, 5]);
    assert!(losses.last().unwrap().1 < losses[0].1);

    let accuracies: Vec<f64> = summary.evaluations.iter().map(|(_, r)| r.accuracy).collect();
    assert_eq!(accuracies.len(), 2);
    assert!(accuracies[1] >= accuracies[0]);
    assert!(accuracies[1] > 0.8, "separable data should be learned: {accuracies:?}");
    assert_eq!(summary.last_evaluation().map(|r| r.total), Some(30));
}

#[test_log::test]
fn train_loss_is_normalized_by_shard_examples() {
    // zero weights: every batch loss is ln(C) regardless of the data
    let model = linear(8);
    set_parameter(&model, "fc.weight", &Tensor::zeros([CLASSES, FEATURES], FLOAT_CPU));
    set_parameter(&model, "fc.bias", &Tensor::zeros([CLASSES], FLOAT_CPU));
    let mut trainer = Trainer::new(
        DataParallel::new(model, Box::new(SingleWorker)),
        TrainingConfig {
            num_epochs: 1,
            eval_every: 0,
            optimizer: ember_modeling::SgdConfig {
                learning_rate: 0.0,
                ..Default::default()
            },
            ..Default::default()
        },
        None,
    )
    .unwrap();

    let train_set = dummy(10, 3);
    let summary = trainer
        .run(
            &mut sequential(&train_set, 4),
            &sequential(&train_set, 4),
            &mut NullSink,
        )
        .unwrap();

    // three batches of mean loss ln 3, divided by ten examples
    let expected = 3.0 * (CLASSES as f64).ln() / 10.0;
    approx::assert_relative_eq!(summary.train_losses[0], expected, max_relative = 1e-5);
}

#[rstest]
#[case(Regularization::energy())]
#[case(Regularization::outlier_exposure())]
#[test_log::test]
fn regularized_runs_stay_finite(#[case] regularization: Regularization) {
    let train_set = dummy(24, 5);
    let mut trainer = single_worker_trainer(TrainingConfig {
        num_epochs: 2,
        eval_every: 0,
        regularization,
        ood_split: Some(4),
        optimizer: ember_modeling::SgdConfig {
            learning_rate: 1e-4,
            ..Default::default()
        },
    });
    let summary = trainer
        .run(
            &mut sequential(&train_set, 8),
            &sequential(&train_set, 8),
            &mut NullSink,
        )
        .unwrap();
    assert!(summary.train_losses.iter().all(|loss| loss.is_finite()));
    assert_eq!(summary.optimizer_steps, 6);
}

#[test_log::test]
fn non_finite_loss_aborts_with_position() {
    let model = linear(8);
    set_parameter(&model, "fc.bias", &Tensor::full([CLASSES], f64::NAN, FLOAT_CPU));
    let mut trainer = Trainer::new(
        DataParallel::new(model, Box::new(SingleWorker)),
        TrainingConfig {
            num_epochs: 3,
            eval_every: 0,
            ..Default::default()
        },
        None,
    )
    .unwrap();

    let train_set = dummy(8, 1);
    let sink = MemorySink::new();
    let err = trainer
        .run(
            &mut sequential(&train_set, 4),
            &sequential(&train_set, 4),
            &mut sink.clone(),
        )
        .unwrap_err();

    assert!(matches!(
        err,
        TrainError::NumericDivergence { epoch: 0, batch: 0, loss } if loss.is_nan()
    ));
    assert!(sink.records().is_empty());
    assert!(!sink.is_closed());
}

#[test_log::test]
fn divergence_on_one_rank_stops_every_rank() {
    let results = run_local_group(2, |rank, collective| {
        let train_set = dummy(16, 2);
        let model = linear(8);
        if rank == 1 {
            set_parameter(&model, "fc.bias", &Tensor::full([CLASSES], f64::NAN, FLOAT_CPU));
        }
        let mut trainer = Trainer::new(
            DataParallel::new(model, Box::new(collective)),
            TrainingConfig {
                num_epochs: 2,
                eval_every: 0,
                ..Default::default()
            },
            None,
        )
        .unwrap();
        let result = trainer.run(
            &mut sharded(&train_set, 2, rank, 4),
            &sequential(&train_set, 4),
            &mut NullSink,
        );
        (result, trainer.model().collective().rank())
    });

    for (result, rank) in &results {
        match result {
            Err(TrainError::NumericDivergence {
                epoch: 0,
                batch: 0,
                loss,
            }) => assert_eq!(loss.is_nan(), *rank == 1),
            other => panic!("rank {rank} should report the divergence, got {other:?}"),
        }
    }
}
