//! Integration tests for fetch and freeze grants

mod common;

use std::collections::BTreeSet;

use engine::access::ViewClaim;
use engine::model::FROZEN_TAG;
use engine::prelude::*;

#[tokio::test]
async fn test_fetch_capability_is_used_up() {
    let mut fixture = common::setup().await;
    let resource = fixture.create(fixture.new_resource("File", b"once")).await;
    let fetch_key = fixture
        .issue(Claim::View(ViewClaim {
            fetch: true,
            ..Default::default()
        }))
        .await;
    let subject_links = BTreeSet::new();

    // an aborted request gives the capability back
    let mut ctx = fixture.holder(&[&fetch_key]);
    let access = fixture
        .engine
        .evaluate(&mut ctx, Scope::View, TargetKind::Resource, None)
        .await
        .unwrap();
    assert!(access.permits(&Subject::resource(&resource, &subject_links)));
    fixture
        .engine
        .exercise(&mut ctx, &access, &[resource.id])
        .await
        .unwrap();
    assert_eq!(ctx.compensations().len(), 1);
    let access = fixture
        .engine
        .evaluate(&mut ctx, Scope::View, TargetKind::Resource, None)
        .await
        .unwrap();
    assert!(!access.permits(&Subject::resource(&resource, &subject_links)));
    fixture.engine.abort(ctx).await;

    // a finished one keeps it used
    let mut ctx = fixture.holder(&[&fetch_key]);
    let access = fixture
        .engine
        .evaluate(&mut ctx, Scope::View, TargetKind::Resource, None)
        .await
        .unwrap();
    assert!(access.permits(&Subject::resource(&resource, &subject_links)));
    fixture
        .engine
        .exercise(&mut ctx, &access, &[resource.id])
        .await
        .unwrap();
    fixture.engine.finish(ctx).await;

    let mut ctx = fixture.holder(&[&fetch_key]);
    let access = fixture
        .engine
        .evaluate(&mut ctx, Scope::View, TargetKind::Resource, None)
        .await
        .unwrap();
    assert!(!access.permits(&Subject::resource(&resource, &subject_links)));
    assert!(access.capabilities().is_empty());
}

#[tokio::test]
async fn test_exercise_without_markers_changes_nothing() {
    let fixture = common::setup().await;
    let resource = fixture.create(fixture.new_resource("File", b"plain")).await;

    let mut ctx = fixture.owner(&[]);
    let access = fixture
        .engine
        .evaluate(&mut ctx, Scope::View, TargetKind::Resource, None)
        .await
        .unwrap();
    fixture
        .engine
        .exercise(&mut ctx, &access, &[resource.id])
        .await
        .unwrap();
    assert!(ctx.compensations().is_empty());
    fixture.engine.finish(ctx).await;
    assert_eq!(fixture.resource(resource.id).await.unwrap(), resource);
}

#[tokio::test]
async fn test_freeze_locks_until_aborted() {
    let mut fixture = common::setup().await;
    let resource = fixture.create(fixture.new_resource("File", b"evidence")).await;
    let usage = fixture.pool_usage(fixture.pool.id).await;
    let freeze_key = fixture
        .issue(Claim::View(ViewClaim {
            freeze: true,
            ..Default::default()
        }))
        .await;

    let mut ctx = fixture.holder(&[&freeze_key]);
    let access = fixture
        .engine
        .evaluate(&mut ctx, Scope::View, TargetKind::Resource, None)
        .await
        .unwrap();
    fixture
        .engine
        .exercise(&mut ctx, &access, &[resource.id])
        .await
        .unwrap();

    let frozen = fixture.resource(resource.id).await.unwrap();
    assert!(frozen.is_locked());
    assert_ne!(frozen.version, resource.version);
    assert_eq!(
        fixture.pool_usage(fixture.pool.id).await,
        usage + FROZEN_TAG.len() as u64
    );

    let mut owner = fixture.owner(&[]);
    let result = fixture
        .engine
        .update_resource(
            &mut owner,
            resource.id,
            ResourceUpdate::new(frozen.version).with_payload(b"tampered".to_vec(), "tampered"),
        )
        .await;
    assert!(matches!(result, Err(EngineError::Locked(_))));
    fixture.engine.finish(owner).await;

    fixture.engine.abort(ctx).await;
    let thawed = fixture.resource(resource.id).await.unwrap();
    assert!(!thawed.is_locked());
    assert_eq!(thawed.payload, resource.payload);
    assert_eq!(fixture.pool_usage(fixture.pool.id).await, usage);
}
