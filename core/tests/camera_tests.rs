use nalgebra::{Vector2, Vector3};
use sba_core::{project, project_with_jacobian, Intrinsic, Pose, RobustLoss};

#[test]
fn test_projection_through_rotated_pose() {
    let k = Intrinsic::pinhole(500.0, 320.0, 240.0);
    // 90 degrees about Y maps world +X onto camera -Z, world -X onto camera +Z.
    let pose = Pose::new(
        Vector3::new(0.0, std::f64::consts::FRAC_PI_2, 0.0),
        Vector3::zeros(),
    );

    let behind = Vector3::new(2.0, 0.0, 0.0);
    assert!(project(&k, &pose, &behind).is_none());

    let front = Vector3::new(-2.0, 0.5, 0.0);
    let p = project(&k, &pose, &front).unwrap();
    assert!((p - Vector2::new(320.0, 240.0 + 500.0 * 0.25)).norm() < 1e-9);
}

#[test]
fn test_jacobian_and_plain_projection_agree() {
    let k = Intrinsic::new(800.0, 400.0, 300.0, -0.05, 0.002, 0.0);
    let pose = Pose::new(Vector3::new(0.1, 0.2, -0.05), Vector3::new(0.3, 0.1, 1.0));
    let x = Vector3::new(-0.5, 0.4, 6.0);

    let plain = project(&k, &pose, &x).unwrap();
    let (with_jac, _) = project_with_jacobian(&k, &pose, &x).unwrap();
    assert_eq!(plain, with_jac);
}

#[test]
fn test_robust_loss_down_weights_outliers() {
    let loss = RobustLoss::Cauchy { mu: 2.0 };
    let inlier = loss.weight(0.5);
    let outlier = loss.weight(50.0);
    assert!(inlier > 0.9);
    assert!(outlier < 0.01);
}
