//! Live-cluster checks; run with `cargo test -- --ignored` against a
//! disposable cluster with `kubectl` on PATH.

use kube_testrun::TestRun;

#[kube_testrun::test]
#[ignore = "requires a Kubernetes cluster"]
async fn test_fixture_lands_in_run_namespace(run: &TestRun) {
    let applied = run.apply_manifest(0u64).await.unwrap();

    assert_eq!(applied.len(), 1);
    let cm = &applied[0];
    assert_eq!(cm.metadata.name.as_deref(), Some("cm-alpha"));
    assert_eq!(cm.metadata.namespace.as_deref(), Some(run.namespace()));

    let labels = cm.metadata.labels.clone().unwrap_or_default();
    assert_eq!(
        labels.get(run.identity().label_key()).map(String::as_str),
        Some(run.identity().unique())
    );
}

#[kube_testrun::test]
#[ignore = "requires a Kubernetes cluster"]
async fn test_objects_exist_only_after_apply(run: &TestRun) -> Result<(), Box<dyn std::error::Error>> {
    assert!(run.manifest(42u64).is_err());

    let rendered = kube_testrun::manifest::read_manifest(run.manifest(0u64)?).await?;
    assert!(run.is_gone(&rendered[0]).await?);

    let applied = run.apply_manifest(0u64).await?;
    assert!(!run.is_gone(&applied[0]).await?);
    Ok(())
}
