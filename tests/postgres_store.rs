//! PostgreSQL-backed store round trips.
//!
//! Ignored by default. Run with `cargo test -- --ignored` against a scratch database
//! named by `DATABASE_URL`.

use factfeed::config::{Config, DatabaseConfig, EngagementConfig};
use factfeed::database::Database;
use factfeed::engagement::MetricsUpdater;
use factfeed::facts::{FactRepository, FactUpdate, NewFact};
use factfeed::ledger::{InteractionLedger, TimeWindow};
use factfeed::models::InteractionType;
use factfeed::store::schema::USERS;
use factfeed::store::Item;
use factfeed::{DataAccess, Error};
use serde_json::json;
use std::sync::Arc;

async fn connect() -> Option<(Database, DataAccess)> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    };
    let config = DatabaseConfig {
        url,
        max_connections: 5,
        ..Config::default().store.database
    };
    let db = Database::connect(&config).await.expect("connect");
    let access = DataAccess::new(Arc::new(db.store()), Config::default().retry);
    Some((db, access))
}

fn new_fact(id: &str) -> NewFact {
    serde_json::from_value(json!({
        "id": id,
        "title": "Octopuses have three hearts",
        "content": "Two pump blood through the gills, one through the body.",
        "category": "nature",
        "difficulty": "beginner",
        "readingTime": 1,
    }))
    .unwrap()
}

#[tokio::test]
#[ignore]
async fn facts_round_trip_through_postgres() {
    let Some((db, access)) = connect().await else {
        return;
    };
    let facts = FactRepository::new(access.clone());
    let id = format!("pg-{}", uuid::Uuid::new_v4());

    facts.import(vec![new_fact(&id)]).await.unwrap();
    assert_eq!(facts.get(&id).await.unwrap().category, "nature");

    let update = FactUpdate {
        title: Some("Octopuses have 3 hearts".into()),
        ..Default::default()
    };
    let updated = facts.update(&id, update).await.unwrap();
    assert_eq!(updated.title, "Octopuses have 3 hearts");

    let missing = facts
        .update(
            "pg-missing-fact",
            FactUpdate {
                title: Some("x".into()),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(missing, Err(Error::NotFound { .. })));

    facts.delete(&id).await.unwrap();
    assert!(matches!(facts.get(&id).await, Err(Error::NotFound { .. })));
    db.close().await;
}

#[tokio::test]
#[ignore]
async fn put_if_absent_conflicts_on_second_insert() {
    let Some((db, access)) = connect().await else {
        return;
    };
    let id = format!("pg-user-{}", uuid::Uuid::new_v4());
    let mut item = Item::new();
    item.insert("id".into(), json!(id));

    access.put_if_absent(&USERS, item.clone()).await.unwrap();
    let again = access.put_if_absent(&USERS, item).await;
    assert!(matches!(again, Err(Error::Conflict { .. })));
    db.close().await;
}

#[tokio::test]
#[ignore]
async fn history_pages_through_every_interaction() {
    let Some((db, access)) = connect().await else {
        return;
    };
    let facts = FactRepository::new(access.clone());
    let metrics = MetricsUpdater::new(access.clone(), &EngagementConfig::default());
    let ledger = InteractionLedger::new(access.clone(), metrics, 5, 100);

    let run = uuid::Uuid::new_v4();
    let ids: Vec<String> = (0..12).map(|i| format!("pg-{}-{}", run, i)).collect();
    facts
        .import(ids.iter().map(|id| new_fact(id)).collect())
        .await
        .unwrap();

    let user = format!("pg-reader-{}", run);
    for id in &ids {
        ledger
            .record(&user, id, InteractionType::View, None)
            .await
            .unwrap();
    }

    let history = ledger
        .by_user(&user, TimeWindow::default(), 100)
        .await
        .unwrap();
    assert_eq!(history.len(), 12);
    assert_eq!(facts.get(&ids[0]).await.unwrap().counters.views, 1);

    for id in &ids {
        facts.delete(id).await.unwrap();
    }
    db.close().await;
}
