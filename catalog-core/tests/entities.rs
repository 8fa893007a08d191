use std::sync::Arc;

use catalog_core::{
    EntityMatch, EntityResolver, IngestConfig, IngestError, MemoryRepository, OrganizationInput,
    PlaceInput,
};
use common::{complete_listing, days_from_now, harness};

mod common;

fn resolver(repo: &MemoryRepository) -> EntityResolver {
    EntityResolver::new(Arc::new(repo.clone()), IngestConfig::default())
}

fn toronto(name: &str) -> PlaceInput {
    PlaceInput {
        name: name.to_owned(),
        address_locality: Some("Toronto".to_owned()),
        address_region: Some("ON".to_owned()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_place_resolution_order() {
    let repo = MemoryRepository::new();
    let resolver = resolver(&repo);

    let created = resolver
        .resolve_place(&toronto("The Rex Hotel Jazz & Blues Bar"))
        .await
        .unwrap();
    assert!(created.created());

    let exact = resolver
        .resolve_place(&toronto("the rex hotel jazz and blues bar!"))
        .await
        .unwrap();
    assert_eq!(exact.matched, EntityMatch::Exact);
    assert_eq!(exact.record.id, created.record.id);

    let similar = resolver
        .resolve_place(&toronto("Rex Hotel Jazz and Blues Bar"))
        .await
        .unwrap();
    assert!(matches!(similar.matched, EntityMatch::Similar(score) if score > 0.8));
    assert_eq!(similar.record.id, created.record.id);

    let referenced = resolver
        .resolve_place(&PlaceInput {
            id: Some(created.record.uid.to_string()),
            name: "Somewhere else entirely".to_owned(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(referenced.matched, EntityMatch::Reference);
    assert_eq!(referenced.record.id, created.record.id);

    assert_eq!(repo.places().await.len(), 1);
}

#[tokio::test]
async fn test_same_name_in_another_city_is_a_new_place() {
    let repo = MemoryRepository::new();
    let resolver = resolver(&repo);

    let toronto = resolver.resolve_place(&toronto("Massey Hall")).await.unwrap();
    let montreal = resolver
        .resolve_place(&PlaceInput {
            name: "Massey Hall".to_owned(),
            address_locality: Some("Montreal".to_owned()),
            address_region: Some("QC".to_owned()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(toronto.created());
    assert!(montreal.created());
    assert_ne!(toronto.record.id, montreal.record.id);
}

#[tokio::test]
async fn test_blank_names_are_rejected() {
    let repo = MemoryRepository::new();
    let resolver = resolver(&repo);

    let err = resolver.resolve_place(&toronto(" ?! ")).await.unwrap_err();
    assert!(matches!(err, IngestError::Validation { ref field, .. } if field == "location.name"));

    let err = resolver
        .resolve_organization(&OrganizationInput {
            name: "   ".to_owned(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Validation { ref field, .. } if field == "organizer.name"));
}

#[tokio::test]
async fn test_merge_places_repoints_events() {
    let h = harness();
    let listing = h
        .service
        .ingest(complete_listing("Glass Tiger", "Roy Thomson Hall", days_from_now(20)), None)
        .await
        .unwrap();
    let resolver = resolver(&h.repo);
    let duplicate = resolver.resolve_place(&toronto("Roy Thomson Hall")).await.unwrap();
    let primary = resolver.resolve_place(&toronto("Massey Hall")).await.unwrap();
    assert_eq!(listing.event.primary_venue_id, Some(duplicate.record.id));

    let canonical = resolver
        .merge_places(duplicate.record.uid, primary.record.uid)
        .await
        .unwrap();
    assert_eq!(canonical, primary.record.uid);

    let event = &h.repo.events().await[0];
    assert_eq!(event.primary_venue_id, Some(primary.record.id));
    assert!(h
        .repo
        .occurrences()
        .await
        .iter()
        .all(|o| o.venue_id == Some(primary.record.id)));

    // The old id keeps working as a redirect
    let redirected = resolver
        .resolve_place(&PlaceInput {
            id: Some(duplicate.record.uid.to_string()),
            name: "Roy Thomson Hall".to_owned(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(redirected.record.id, primary.record.id);

    let err = resolver
        .merge_places(duplicate.record.uid, primary.record.uid)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Validation { .. }));
}

#[tokio::test]
async fn test_merge_follows_primary_redirects() {
    let repo = MemoryRepository::new();
    let resolver = resolver(&repo);
    let first = resolver.resolve_place(&toronto("Massey Hall")).await.unwrap();
    let second = resolver.resolve_place(&toronto("Roy Thomson Hall")).await.unwrap();
    let third = resolver.resolve_place(&toronto("Danforth Music Hall")).await.unwrap();

    resolver
        .merge_places(second.record.uid, third.record.uid)
        .await
        .unwrap();
    let canonical = resolver
        .merge_places(first.record.uid, second.record.uid)
        .await
        .unwrap();
    assert_eq!(canonical, third.record.uid);

    let err = resolver
        .merge_places(third.record.uid, second.record.uid)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Validation { .. }));
}

#[tokio::test]
async fn test_organizations_resolve_and_merge() {
    let repo = MemoryRepository::new();
    let resolver = resolver(&repo);
    let organizer = |name: &str| OrganizationInput {
        name: name.to_owned(),
        url: Some("https://example.com".to_owned()),
        address_locality: Some("Toronto".to_owned()),
        address_region: Some("ON".to_owned()),
        ..Default::default()
    };

    let created = resolver
        .resolve_organization(&organizer("Toronto Jazz Festival"))
        .await
        .unwrap();
    assert!(created.created());
    assert_eq!(created.record.url.as_deref(), Some("https://example.com"));

    let exact = resolver
        .resolve_organization(&organizer("TORONTO JAZZ FESTIVAL"))
        .await
        .unwrap();
    assert_eq!(exact.matched, EntityMatch::Exact);

    let other = resolver
        .resolve_organization(&organizer("Soulpepper"))
        .await
        .unwrap();
    assert!(other.created());

    let canonical = resolver
        .merge_organizations(other.record.uid, created.record.uid)
        .await
        .unwrap();
    assert_eq!(canonical, created.record.uid);

    let organizations = repo.organizations().await;
    let merged = organizations
        .iter()
        .find(|o| o.id == other.record.id)
        .unwrap();
    assert_eq!(merged.merged_into_id, Some(created.record.id));
}
