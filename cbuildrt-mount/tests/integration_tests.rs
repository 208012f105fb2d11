use cbuildrt_mount::*;
use std::fs;
use std::path::PathBuf;

fn plan_with(specs: Vec<MountSpec>) -> MountPlan {
    MountPlanBuilder::new()
        .essentials(Essentials::none())
        .mounts(specs)
        .build()
        .unwrap()
}

/// Mount targets in the order the backend saw them
fn mount_order(backend: &MockBackend) -> Vec<PathBuf> {
    backend
        .ops()
        .into_iter()
        .filter_map(|op| match op {
            MountOp::Bind { target, .. } | MountOp::Mount { target, .. } => Some(target),
            _ => None,
        })
        .collect()
}

fn unmount_order(backend: &MockBackend) -> Vec<PathBuf> {
    backend
        .ops()
        .into_iter()
        .filter_map(|op| match op {
            MountOp::Unmount { target } => Some(target),
            _ => None,
        })
        .collect()
}

#[test]
fn test_teardown_is_exact_reverse_of_execution() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let root = ContainerRoot::acquire(dir.path(), true).unwrap();

    let plan = plan_with(vec![
        MountSpec::bind(src.path(), "/input").read_only(),
        MountSpec::bind(out.path(), "/output"),
        MountSpec::tmpfs("/tmp"),
        MountSpec::tmpfs("/var/cache"),
    ]);

    let backend = MockBackend::new();
    let handle = MountExecutor::new(&backend).execute(&plan, &root).unwrap();
    let entries = handle.entries().to_vec();

    let report = Teardown::new(&backend).finish(handle, root);

    let mut expected = entries;
    expected.reverse();
    assert_eq!(report.reversed, expected);

    let mut mounted = mount_order(&backend);
    mounted.reverse();
    assert_eq!(unmount_order(&backend), mounted);

    assert!(report.is_clean());
    assert!(backend.mounted().is_empty());
}

#[test]
fn test_partial_failure_unwinds_in_reverse() {
    let src = tempfile::tempdir().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let root = ContainerRoot::acquire(dir.path(), false).unwrap();

    let plan = plan_with(vec![
        MountSpec::tmpfs("/a"),
        MountSpec::bind(src.path(), "/b"),
        MountSpec::tmpfs("/c"),
        MountSpec::tmpfs("/d"),
    ]);

    // k = 3 successes (root, /a, /b), then /c fails
    let backend = MockBackend::new();
    backend.fail_mount_at(dir.path().join("c"));

    let err = MountExecutor::new(&backend)
        .execute(&plan, &root)
        .unwrap_err();
    assert!(matches!(err, Error::MountFailed { .. }));

    assert_eq!(
        unmount_order(&backend),
        vec![
            dir.path().join("b"),
            dir.path().join("a"),
            dir.path().to_path_buf(),
        ]
    );
    assert!(backend.mounted().is_empty());

    // /d was never attempted, created mount points were removed
    assert!(!mount_order(&backend).contains(&dir.path().join("d")));
    for name in ["a", "b", "c", "d"] {
        assert!(!dir.path().join(name).exists(), "{name} left behind");
    }
}

#[test]
fn test_teardown_continues_past_stuck_unmount() {
    let dir = tempfile::tempdir().unwrap();
    let root = ContainerRoot::acquire(dir.path(), false).unwrap();
    let plan = plan_with(vec![MountSpec::tmpfs("/a"), MountSpec::tmpfs("/b")]);

    let backend = MockBackend::new();
    let handle = MountExecutor::new(&backend).execute(&plan, &root).unwrap();
    backend.fail_unmount_at(dir.path().join("b"));

    let report = Teardown::new(&backend).finish(handle, root);

    assert_eq!(report.failed_unmounts, 1);
    assert!(report.warnings.iter().any(|w| w.target == dir.path().join("b")));
    // Everything else was still released
    assert_eq!(backend.mounted(), vec![dir.path().join("b")]);
    assert!(!dir.path().join("a").exists());
}

#[test]
fn test_rejected_plan_has_no_side_effects() {
    let src = tempfile::tempdir().unwrap();
    let parent = tempfile::tempdir().unwrap();
    let root_path = parent.path().join("root");

    let result = MountPlanBuilder::new()
        .essentials(Essentials::none())
        .mount(MountSpec::bind(src.path(), "/input"))
        .mount(MountSpec::bind(src.path(), "/input"))
        .build();

    assert!(matches!(result, Err(Error::InvalidMountSpec { .. })));
    // Validation runs before the root is ever acquired
    assert!(!root_path.exists());
}

#[test]
fn test_existing_mount_points_not_recorded() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("tmp")).unwrap();
    let root = ContainerRoot::acquire(dir.path(), false).unwrap();
    let plan = plan_with(vec![MountSpec::tmpfs("/tmp")]);

    let backend = MockBackend::new();
    let handle = MountExecutor::new(&backend).execute(&plan, &root).unwrap();
    assert!(
        !handle
            .entries()
            .iter()
            .any(|e| matches!(e, HandleEntry::Created { .. }))
    );

    Teardown::new(&backend).finish(handle, root);
    // Pre-existing directories in a supplied root survive teardown
    assert!(dir.path().join("tmp").is_dir());
}

#[test]
fn test_file_bind_gets_file_mount_point() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let root = ContainerRoot::acquire(dir.path(), false).unwrap();
    let plan = plan_with(vec![
        MountSpec::bind(file.path(), "/etc/build.conf").read_only(),
    ]);

    let backend = MockBackend::new();
    let handle = MountExecutor::new(&backend).execute(&plan, &root).unwrap();

    let target = dir.path().join("etc/build.conf");
    assert!(target.is_file());
    assert!(backend.is_mounted(&target));

    let report = Teardown::new(&backend).finish(handle, root);
    assert!(report.is_clean());
    assert!(!dir.path().join("etc").exists());
}

#[test]
fn test_essentials_expand_to_device_tree() {
    let dir = tempfile::tempdir().unwrap();
    let root = ContainerRoot::acquire(dir.path(), false).unwrap();
    let plan = MountPlanBuilder::new()
        .essentials(Essentials {
            resolv_conf: false,
            ..Essentials::default()
        })
        .build()
        .unwrap();

    let backend = MockBackend::new();
    let handle = MountExecutor::new(&backend).execute(&plan, &root).unwrap();

    assert!(backend.is_mounted(&dir.path().join("dev/pts")));
    assert!(backend.is_mounted(&dir.path().join("dev/shm")));
    assert!(backend.is_mounted(&dir.path().join("tmp")));
    assert!(!backend.is_mounted(&dir.path().join("proc")));

    let report = Teardown::new(&backend).finish(handle, root);
    assert!(backend.mounted().is_empty());
    // Without a real tmpfs the device entries land in the directory itself,
    // so only its removal can complain
    assert!(
        report
            .warnings
            .iter()
            .all(|w| w.target == dir.path().join("dev"))
    );
}
