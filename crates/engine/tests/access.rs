//! Integration tests for capability evaluation

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use engine::access::{
    tenant_global_id, ManageClaim, ManageExclusions, ResourceFilter, UpdateClaim, ViewClaim,
};
use engine::prelude::*;
use uuid::Uuid;

fn view_types(types: &[&str]) -> Claim {
    Claim::View(ViewClaim {
        filter: ResourceFilter {
            include_types: types.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        },
        ..Default::default()
    })
}

#[tokio::test]
async fn test_public_key_scenario() {
    let mut fixture = common::setup().await;
    let key = fixture
        .create(fixture.new_resource("PublicKey", b"public key bytes"))
        .await;
    let file = fixture.create(fixture.new_resource("File", b"file bytes")).await;
    let view_key = fixture.issue(view_types(&["PublicKey"])).await;

    let mut ctx = fixture.holder(&[&view_key]);
    let access = fixture
        .engine
        .evaluate(&mut ctx, Scope::View, TargetKind::Resource, None)
        .await
        .unwrap();
    let links = BTreeSet::new();

    assert_eq!(
        access.level_for(&Subject::resource(&key, &links)),
        Some(AccessLevel::Normal)
    );
    assert!(access.permits(&Subject::resource(&key, &links)));
    assert_eq!(access.level_for(&Subject::resource(&file, &links)), None);
    assert!(!access.permits(&Subject::resource(&file, &links)));

    let mut owner = fixture.owner(&[]);
    let access = fixture
        .engine
        .evaluate(&mut owner, Scope::View, TargetKind::Resource, None)
        .await
        .unwrap();
    assert_eq!(
        access.level_for(&Subject::resource(&file, &links)),
        Some(AccessLevel::Owner)
    );
}

#[tokio::test]
async fn test_anonymous_requests_see_public_resources_only() {
    let fixture = common::setup().await;
    let public = fixture
        .create(fixture.new_resource("File", b"a").with_state("public"))
        .await;
    let private = fixture.create(fixture.new_resource("File", b"b")).await;

    let mut ctx = fixture.engine.context(Vec::<String>::new());
    let access = fixture
        .engine
        .evaluate(&mut ctx, Scope::View, TargetKind::Resource, None)
        .await
        .unwrap();
    let links = BTreeSet::new();
    assert_eq!(
        access.level_for(&Subject::resource(&public, &links)),
        Some(AccessLevel::Peek)
    );
    assert!(!access.permits(&Subject::resource(&private, &links)));

    let update = fixture
        .engine
        .evaluate(&mut ctx, Scope::Update, TargetKind::Resource, None)
        .await
        .unwrap();
    assert!(!update.permits(&Subject::resource(&public, &links)));
}

#[tokio::test]
async fn test_evaluation_is_memoized_and_deterministic() {
    let mut fixture = common::setup().await;
    let view_key = fixture.issue(view_types(&["File"])).await;

    let mut ctx = fixture.owner(&[&view_key]);
    let first = fixture
        .engine
        .evaluate(&mut ctx, Scope::View, TargetKind::Resource, None)
        .await
        .unwrap();
    let second = fixture
        .engine
        .evaluate(&mut ctx, Scope::View, TargetKind::Resource, None)
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let mut fresh = fixture.owner(&[&view_key]);
    let third = fixture
        .engine
        .evaluate(&mut fresh, Scope::View, TargetKind::Resource, None)
        .await
        .unwrap();
    assert_eq!(first.predicate, third.predicate);
    assert_eq!(
        first.tenant(fixture.tenant.id).map(|grant| grant.level),
        third.tenant(fixture.tenant.id).map(|grant| grant.level)
    );

    // a write drops memoized results
    fixture
        .engine
        .create_resource(&mut ctx, fixture.new_resource("File", b"x"))
        .await
        .unwrap();
    let after = fixture
        .engine
        .evaluate(&mut ctx, Scope::View, TargetKind::Resource, None)
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&first, &after));
}

#[tokio::test]
async fn test_reject_hides_everything() {
    let mut fixture = common::setup().await;
    let excluded = fixture.create(fixture.new_resource("File", b"secret")).await;
    let other = fixture.create(fixture.new_resource("File", b"other")).await;
    let restricted_manage = fixture
        .issue(Claim::Manage(ManageClaim {
            exclude: ManageExclusions {
                resources: [excluded.id].into(),
                ..Default::default()
            },
        }))
        .await;
    let view_key = fixture.issue(view_types(&["File"])).await;
    let links = BTreeSet::new();

    let mut ctx = fixture.holder(&[&restricted_manage, &view_key]);
    let queried: BTreeSet<Uuid> = [excluded.id.as_uuid()].into();
    let access = fixture
        .engine
        .evaluate(&mut ctx, Scope::View, TargetKind::Resource, Some(&queried))
        .await
        .unwrap();
    assert!(access.is_rejected());
    assert!(!access.permits(&Subject::resource(&excluded, &links)));
    assert!(!access.permits(&Subject::resource(&other, &links)));

    // without naming the excluded resource, only it stays out of reach
    let access = fixture
        .engine
        .evaluate(&mut ctx, Scope::View, TargetKind::Resource, None)
        .await
        .unwrap();
    assert!(!access.is_rejected());
    assert_eq!(
        access.level_for(&Subject::resource(&other, &links)),
        Some(AccessLevel::Owner)
    );
    assert!(!access.permits(&Subject::resource(&excluded, &links)));
}

#[tokio::test]
async fn test_combination_is_order_independent() {
    let mut fixture = common::setup().await;
    let a = fixture.issue(view_types(&["File", "Text"])).await;
    let b = fixture
        .issue(Claim::View(ViewClaim {
            filter: ResourceFilter {
                exclude_types: vec!["Text".to_string()],
                ..Default::default()
            },
            ..Default::default()
        }))
        .await;
    let c = fixture
        .issue(Claim::Update(UpdateClaim {
            allowed_tags: Some(vec!["name=".to_string()]),
            ..Default::default()
        }))
        .await;

    let orders: [[&CapabilityKey; 3]; 3] = [[&a, &b, &c], [&c, &b, &a], [&b, &c, &a]];
    let mut results = Vec::new();
    for order in orders {
        let mut ctx = fixture.holder(&order);
        for scope in [Scope::View, Scope::Update] {
            let access = fixture
                .engine
                .evaluate(&mut ctx, scope, TargetKind::Resource, None)
                .await
                .unwrap();
            results.push((scope, access));
        }
    }
    for pair in results.chunks(2).skip(1) {
        assert_eq!(*pair[0].1, *results[0].1);
        assert_eq!(*pair[1].1, *results[1].1);
    }

    let text = fixture.create(fixture.new_resource("Text", b"t")).await;
    let file = fixture.create(fixture.new_resource("File", b"f")).await;
    let links = BTreeSet::new();
    let view = &results[0].1;
    assert!(view.permits(&Subject::resource(&file, &links)));
    assert!(!view.permits(&Subject::resource(&text, &links)));
}

#[tokio::test]
async fn test_global_tenant_ids_and_garbage_entries() {
    let mut fixture = common::setup().await;
    let view_key = fixture.issue(view_types(&["File"])).await;
    let entries = vec![
        "garbage".to_string(),
        format!("{}:{}", tenant_global_id(fixture.tenant.id), view_key.to_base64()),
        format!("{}:AAAA", fixture.tenant.id),
    ];
    let mut ctx = fixture.engine.context(entries);
    let access = fixture
        .engine
        .evaluate(&mut ctx, Scope::View, TargetKind::Resource, None)
        .await
        .unwrap();
    assert_eq!(
        access.tenant(fixture.tenant.id).map(|grant| grant.level),
        Some(AccessLevel::Normal)
    );
}

#[tokio::test]
async fn test_capabilities_outside_their_window_do_not_apply() {
    let fixture = common::setup().await;
    let key = CapabilityKey::generate();
    let later = chrono::Utc::now() + chrono::Duration::hours(1);
    let pending = NewCapability::new(key.clone(), view_types(&["File"])).valid_between(later, None);

    let mut owner = fixture.owner(&[]);
    let resource = fixture
        .engine
        .create_resource(
            &mut owner,
            fixture.new_resource("File", b"x").with_capability(pending),
        )
        .await
        .unwrap();
    fixture.engine.finish(owner).await;

    let queried: BTreeSet<Uuid> = [resource.id.as_uuid()].into();
    let mut ctx = fixture.holder(&[&key]);
    let access = fixture
        .engine
        .evaluate(&mut ctx, Scope::View, TargetKind::Resource, Some(&queried))
        .await
        .unwrap();
    assert!(access.tenant(fixture.tenant.id).is_none());

    let mut ctx = fixture.holder(&[&key]).at(later + chrono::Duration::minutes(1));
    let access = fixture
        .engine
        .evaluate(&mut ctx, Scope::View, TargetKind::Resource, Some(&queried))
        .await
        .unwrap();
    let links: BTreeSet<_> = access.capabilities().clone();
    assert!(access.permits(&Subject::resource(&resource, &links)));
}

#[tokio::test]
async fn test_bound_capability_speaks_for_its_resource_only() {
    let fixture = common::setup().await;
    let key = CapabilityKey::generate();
    let mut owner = fixture.owner(&[]);
    let bound = fixture
        .engine
        .create_resource(
            &mut owner,
            fixture
                .new_resource("File", b"bound")
                .with_capability(NewCapability::new(key.clone(), view_types(&[]))),
        )
        .await
        .unwrap();
    let sibling = fixture
        .engine
        .create_resource(&mut owner, fixture.new_resource("File", b"sibling"))
        .await
        .unwrap();
    fixture.engine.finish(owner).await;

    let mut reader = fixture.engine.store().reader().await.unwrap();
    let bound_links = reader.capability_links(bound.id).await.unwrap();
    drop(reader);
    let no_links = BTreeSet::new();

    let mut ctx = fixture.holder(&[&key]);
    let access = fixture
        .engine
        .evaluate(&mut ctx, Scope::View, TargetKind::Resource, None)
        .await
        .unwrap();
    assert!(access.permits(&Subject::resource(&bound, &bound_links)));
    assert!(!access.permits(&Subject::resource(&sibling, &no_links)));

    // linked resources stay hidden from requests that lack the linked key
    let mut owner = fixture.owner(&[]);
    let access = fixture
        .engine
        .evaluate(&mut owner, Scope::View, TargetKind::Resource, None)
        .await
        .unwrap();
    assert!(!access.permits(&Subject::resource(&bound, &bound_links)));
    assert!(access.permits(&Subject::resource(&sibling, &no_links)));
}

#[tokio::test]
async fn test_rotated_digests_are_rewritten() {
    let old_config = EngineConfig {
        digest_algorithms: vec![DigestAlgorithm::Sha256],
        ..Default::default()
    };
    let fixture = common::setup_with(Pool::new(None), old_config).await;
    let capability_id = {
        let mut reader = fixture.engine.store().reader().await.unwrap();
        let capabilities = reader.capabilities_of_tenant(fixture.tenant.id).await.unwrap();
        assert!(capabilities[0].key_digest.starts_with("sha256:"));
        capabilities[0].id
    };

    let rotated = Engine::new(fixture.engine.store().clone(), EngineConfig::default());
    let mut ctx = rotated.context([authorization_entry(fixture.tenant.id, &fixture.manage_key)]);
    let access = rotated
        .evaluate(&mut ctx, Scope::View, TargetKind::Resource, None)
        .await
        .unwrap();
    assert_eq!(
        access.tenant(fixture.tenant.id).map(|grant| grant.level),
        Some(AccessLevel::Owner)
    );
    rotated.finish(ctx).await;

    let mut reader = rotated.store().reader().await.unwrap();
    let capability = reader.capability(capability_id).await.unwrap().unwrap();
    assert_eq!(
        capability.key_digest,
        DigestAlgorithm::Sha512.digest(fixture.manage_key.bytes())
    );
}
