use nalgebra::{Vector2, Vector3};
use sba_core::{project, Intrinsic, Pose};
use sba_optimize::{CgSolver, LinearSolverType};
use sba_sfm::synthetic::{generate, SceneConfig};
use sba_sfm::{
    bundle_adjust, BaProblem, BundleAdjustmentConfig, ClusteredSchur, FailureReason,
    FixedPoseSchur, SfmError, TerminationReason,
};

fn config() -> BundleAdjustmentConfig {
    BundleAdjustmentConfig::default().with_threads(2)
}

/// Two cameras one unit apart, three points seen by both.
fn two_view_problem(extra_single_view: bool) -> BaProblem {
    let k = Intrinsic::pinhole(500.0, 320.0, 240.0);
    let poses = [
        Pose::default(),
        Pose::new(Vector3::zeros(), Vector3::new(-1.0, 0.0, 0.0)),
    ];
    let mut points = vec![
        Vector3::new(0.0, 0.0, 5.0),
        Vector3::new(1.0, 0.5, 6.0),
        Vector3::new(-0.5, -0.5, 4.0),
    ];
    if extra_single_view {
        points.push(Vector3::new(0.3, -0.2, 7.0));
    }
    let projection_num = 6 + usize::from(extra_single_view);

    let mut problem =
        BaProblem::with_size(config(), 2, 1, points.len(), projection_num).unwrap();
    problem.set_pose_intrinsic(0, 0, &k).unwrap();
    problem.set_pose_intrinsic(0, 1, &k).unwrap();

    let mut proj = 0;
    for (point, position) in points.iter().enumerate() {
        problem.set_point(point, position).unwrap();
        for (pose, camera) in poses.iter().enumerate() {
            if point == 3 && pose == 1 {
                continue;
            }
            let uv = project(&k, camera, position).unwrap();
            problem.set_projection(proj, pose, point, &uv).unwrap();
            proj += 1;
        }
    }

    problem.set_pose(0, &poses[0]).unwrap();
    // Perturbed second camera.
    problem
        .set_pose(
            1,
            &Pose::new(Vector3::new(0.01, -0.005, 0.0), Vector3::new(-0.95, 0.02, 0.03)),
        )
        .unwrap();
    problem
}

#[test]
fn test_two_view_problem_converges() {
    let mut problem = two_view_problem(false);
    let before = problem.reprojection_error(true).unwrap();
    assert!(before.mean > 1.0);

    let summary = problem.solve().unwrap();
    println!("{summary:?}");
    assert!(summary.converged());
    assert!(summary.final_cost < summary.initial_cost);

    let after = problem.reprojection_error(true).unwrap();
    assert_eq!(after.count, 6);
    assert!(after.max < 1e-4, "max reprojection error {}", after.max);
}

#[test]
fn test_single_view_point_does_not_corrupt_solve() {
    let mut problem = two_view_problem(true);
    assert!(problem.associations().is_none());
    problem.build_associations().unwrap();
    let associations = problem.associations().unwrap();
    assert_eq!(associations.point_projections[3].len(), 1);
    assert_eq!(associations.common_points(0, 1), &[0, 1, 2]);

    let summary = problem.solve().unwrap();
    assert!(summary.final_cost.is_finite());
    assert!(summary.final_cost < summary.initial_cost);
    for pose in 0..problem.pose_num() {
        assert!(problem.get_pose(pose).unwrap().is_finite());
    }
    for point in 0..problem.point_num() {
        assert!(problem.get_point(point).unwrap().iter().all(|v| v.is_finite()));
    }
    let stats = problem.reprojection_error(true).unwrap();
    assert_eq!(stats.count, 7);
    assert!(stats.max < 1e-3, "max reprojection error {}", stats.max);
}

#[test]
fn test_zero_projections_is_reported() {
    let mut problem = BaProblem::with_size(config(), 1, 1, 1, 0).unwrap();
    problem.set_pose_group(0, 0).unwrap();
    let pose = problem.get_pose(0).unwrap();

    assert!(matches!(problem.solve(), Err(SfmError::EmptyProblem)));
    assert_eq!(problem.get_pose(0).unwrap(), pose);
    assert!(problem.last_summary().is_none());
}

#[test]
fn test_thread_count_does_not_change_result() {
    let scene = generate(&SceneConfig::new(6, 120, 21));
    let mut results = Vec::new();
    for threads in [1, 4] {
        let mut problem = BaProblem::new(BundleAdjustmentConfig::default().with_threads(threads)).unwrap();
        problem.initialize(&scene.perturbed).unwrap();
        assert_eq!(problem.thread_num(), threads);
        let summary = problem.solve().unwrap();
        results.push((summary, problem.export()));
    }

    let (serial, parallel) = (&results[0], &results[1]);
    assert_eq!(serial.0.iterations, parallel.0.iterations);
    assert!((serial.0.final_cost - parallel.0.final_cost).abs() <= 1e-12 * (1.0 + serial.0.final_cost));
    for (a, b) in serial.1.cameras.iter().zip(&parallel.1.cameras) {
        assert!((a.pose.to_vector() - b.pose.to_vector()).norm() < 1e-9);
    }
    for (a, b) in serial.1.tracks.iter().zip(&parallel.1.tracks) {
        assert!((a.position - b.position).norm() < 1e-9);
    }
}

#[test]
fn test_accepted_steps_never_increase_cost() {
    let scene = generate(&SceneConfig {
        pixel_noise: 0.5,
        ..SceneConfig::new(8, 150, 4)
    });
    let mut problem = BaProblem::new(config()).unwrap();
    problem.initialize(&scene.perturbed).unwrap();
    let summary = problem.solve().unwrap();

    let mut cost = summary.initial_cost;
    for record in summary.records.iter().filter(|r| r.accepted) {
        assert!(record.cost <= cost);
        cost = record.cost;
    }
    assert_eq!(cost, summary.final_cost);
    assert_eq!(
        summary.records.iter().filter(|r| r.accepted).count(),
        summary.iterations
    );
    // Noisy observations keep a residual floor.
    assert!(summary.final_cost > 0.0);
}

#[test]
fn test_residuals_are_idempotent() {
    let scene = generate(&SceneConfig::new(4, 60, 9));
    let mut problem = BaProblem::new(config()).unwrap();
    problem.initialize(&scene.perturbed).unwrap();

    let first = problem.residuals(true).unwrap().clone();
    let second = problem.residuals(true).unwrap().clone();
    assert_eq!(first, second);

    // Residual is observed minus predicted.
    let pose = problem.get_pose(0).unwrap();
    let k = problem.get_pose_intrinsic(0).unwrap();
    let associations = problem.associations().unwrap();
    let (point, proj) = associations.pose_projections[0][0];
    let predicted = project(&k, &pose, &problem.get_point(point).unwrap()).unwrap();
    let expected = problem.get_observation(proj).unwrap() - predicted;
    assert_eq!(first.values[proj], expected);
}

#[test]
fn test_fixed_poses_stay_put() {
    let scene = generate(&SceneConfig::new(5, 100, 13));
    let mut problem = BaProblem::new(config()).unwrap();
    problem.initialize(&scene.perturbed).unwrap();
    let fixed = problem.get_pose(0).unwrap();

    let summary = problem.solve_with(&FixedPoseSchur::new([0])).unwrap();
    assert_eq!(summary.strategy, "fixed_pose");
    assert_eq!(problem.get_pose(0).unwrap(), fixed);
    assert!(summary.final_cost < 1e-3 * summary.initial_cost);
}

#[test]
fn test_clustered_strategy_reduces_cost() {
    let scene = generate(&SceneConfig::new(6, 150, 17));
    let mut problem = BaProblem::new(config().with_max_iterations(50)).unwrap();
    problem.initialize(&scene.perturbed).unwrap();

    let summary = problem.solve_with(&ClusteredSchur::new(2)).unwrap();
    assert_eq!(summary.strategy, "clustered");
    assert!(summary.final_cost < summary.initial_cost);
}

#[test]
fn test_report_is_written() {
    let dir = std::env::temp_dir().join(format!("sba_report_{}", std::process::id()));
    let scene = generate(&SceneConfig::new(3, 40, 2));
    let mut problem = BaProblem::new(config()).unwrap();
    problem.initialize(&scene.perturbed).unwrap();
    problem.set_debug_folder(dir.join("snapshots"));
    let summary = problem.solve().unwrap();

    let path = dir.join("report.txt");
    problem.save_report(&path).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("Bundle adjustment report"));
    assert!(text.contains("3 poses"));

    let snapshot = dir.join("snapshots").join("iteration_0001.json");
    assert!(summary.iterations == 0 || snapshot.exists());
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_update_round_trip() {
    let scene = generate(&SceneConfig::new(4, 80, 31));
    let mut block = scene.perturbed.clone();
    let summary = bundle_adjust(&mut block, &config()).unwrap();
    assert!(summary.converged());
    assert_ne!(block, scene.perturbed);
    assert_eq!(block.tracks.len(), scene.perturbed.tracks.len());

    let mut problem = BaProblem::new(config()).unwrap();
    problem.initialize(&block).unwrap();
    let stats = problem.reprojection_error(true).unwrap();
    assert!(stats.max < 1e-3, "max reprojection error {}", stats.max);
    assert_eq!(problem.export().cameras, block.cameras);
}

#[test]
fn test_structural_errors() {
    let mut problem = BaProblem::with_size(config(), 2, 2, 1, 2).unwrap();
    problem.set_pose_group(0, 0).unwrap();
    problem.set_pose_group(1, 0).unwrap();
    problem.set_projection(0, 0, 0, &Vector2::zeros()).unwrap();
    problem.set_projection(1, 1, 0, &Vector2::zeros()).unwrap();
    // Group 1 has no poses.
    assert!(matches!(
        problem.build_associations(),
        Err(SfmError::InvalidStructure(_))
    ));

    problem.set_pose_group(1, 1).unwrap();
    problem.build_associations().unwrap();

    problem.set_projection(1, 0, 0, &Vector2::zeros()).unwrap();
    assert!(matches!(
        problem.build_associations(),
        Err(SfmError::InvalidStructure(_))
    ));
    assert!(matches!(problem.solve(), Err(SfmError::InvalidStructure(_))));

    assert!(matches!(
        problem.set_projection(0, 2, 0, &Vector2::zeros()),
        Err(SfmError::IndexOutOfRange { kind: "pose", index: 2, size: 2 })
    ));
    assert!(problem.set_pose_group(0, 2).is_err());
}

#[test]
fn test_every_linear_solver_converges() {
    let scene = generate(&SceneConfig::new(5, 100, 8));
    let mut finals = Vec::new();
    for kind in [
        LinearSolverType::Dense,
        LinearSolverType::Sparse,
        LinearSolverType::Iterative,
        LinearSolverType::Adaptive,
    ] {
        let mut problem = BaProblem::new(config().with_linear_solver(kind)).unwrap();
        problem.initialize(&scene.perturbed).unwrap();
        let summary = problem.solve().unwrap();
        println!("{kind}: {:?} after {} iterations", summary.termination, summary.iterations);
        assert!(summary.converged());
        let stats = problem.reprojection_error(false).unwrap();
        assert!(stats.max < 1e-3, "{kind}: max reprojection error {}", stats.max);
        finals.push(summary);
    }
    let used: Vec<_> = finals[0].records.iter().filter_map(|r| r.solver).collect();
    assert!(used.iter().all(|s| *s == LinearSolverType::Dense));
}

#[test]
fn test_iteration_limit_is_a_termination() {
    let scene = generate(&SceneConfig::new(4, 60, 3));
    let mut problem = BaProblem::new(config().with_max_iterations(1)).unwrap();
    problem.initialize(&scene.perturbed).unwrap();
    let summary = problem.solve().unwrap();
    assert_eq!(summary.iterations, 1);
    assert_eq!(summary.termination, Some(TerminationReason::IterationLimit));
}

#[test]
fn test_repeated_solver_failure_keeps_last_parameters() {
    let scene = generate(&SceneConfig::new(5, 100, 8));
    // One CG iteration cannot reach the tolerance on a coupled camera system.
    let mut failing = config().with_linear_solver(LinearSolverType::Iterative);
    failing.iterative = CgSolver::new(1, 1e-15);
    let mut problem = BaProblem::new(failing).unwrap();
    problem.initialize(&scene.perturbed).unwrap();
    let before = problem.export();

    let err = problem.solve().unwrap_err();
    let summary = match err {
        SfmError::SolveFailed {
            reason: FailureReason::ConsecutiveFailures,
            summary,
        } => summary,
        other => panic!("unexpected result: {other}"),
    };
    assert_eq!(summary.iterations, 0);
    assert_eq!(
        summary.rejected_steps,
        problem.config().max_consecutive_failures + 1
    );
    assert!(summary.records.iter().all(|r| !r.accepted && r.solver.is_none()));
    assert_eq!(summary.final_cost, summary.initial_cost);

    assert_eq!(problem.export(), before);
    let kept = problem.last_summary().unwrap();
    assert_eq!(kept.failure, Some(FailureReason::ConsecutiveFailures));
    assert!(!kept.converged());
}

#[test]
fn test_non_finite_cost_fails_without_touching_parameters() {
    let scene = generate(&SceneConfig::new(4, 60, 6));
    let mut problem = BaProblem::new(config()).unwrap();
    problem.initialize(&scene.perturbed).unwrap();
    let (point, proj) = problem.associations().unwrap().pose_projections[0][0];
    problem
        .set_projection(proj, 0, point, &Vector2::new(f64::INFINITY, 0.0))
        .unwrap();
    let before = problem.export();

    assert!(matches!(
        problem.solve(),
        Err(SfmError::SolveFailed {
            reason: FailureReason::NonFiniteCost,
            ..
        })
    ));
    assert_eq!(problem.export(), before);
    let kept = problem.last_summary().unwrap();
    assert_eq!(kept.iterations, 0);
    assert!(kept.records.is_empty());
}

#[test]
fn test_failed_solve_still_writes_back_the_model() {
    let scene = generate(&SceneConfig::new(4, 60, 10));
    let mut failing = config().with_linear_solver(LinearSolverType::Iterative);
    failing.iterative = CgSolver::new(1, 1e-15);
    let mut block = scene.perturbed.clone();

    let result = bundle_adjust(&mut block, &failing);
    assert!(matches!(result, Err(SfmError::SolveFailed { .. })));
    assert_eq!(block, scene.perturbed);
}
