//! Store lifecycle scenarios: priority ordering, dependency blocking, and
//! atomic claiming, against a real migrated sqlite database. Mirrors the
//! "Dependency order" scenario and the P1/P3 invariants from
//! SPEC_FULL.md §8.

use autocoder::store::models::FeatureStatus;
use autocoder::store::Store;
use sqlx::sqlite::SqlitePoolOptions;

async fn fresh_store() -> Store {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");
    Store::open(pool).await.expect("open store")
}

#[tokio::test]
async fn claim_respects_priority_over_insertion_order() {
    let store = fresh_store().await;

    let low = store
        .create_feature("low", "low priority", "core", &[], 1, &[])
        .await
        .unwrap();
    let high = store
        .create_feature("high", "high priority", "core", &[], 10, &[])
        .await
        .unwrap();

    let claimed = store
        .claim_next_pending_feature("agent-1", "feature", 3, false)
        .await
        .unwrap()
        .expect("a claimable feature exists");

    assert_eq!(claimed.id, high, "higher priority feature must be claimed first");
    assert_ne!(claimed.id, low);
    assert_eq!(claimed.status, FeatureStatus::InProgress.as_str());
    assert_eq!(claimed.assigned_agent_id.as_deref(), Some("agent-1"));
}

#[tokio::test]
async fn feature_with_unclaimed_dependency_is_not_claimable() {
    let store = fresh_store().await;

    let dependency = store
        .create_feature("base", "must land first", "core", &[], 5, &[])
        .await
        .unwrap();
    let _dependent = store
        .create_feature("dependent", "needs base", "core", &[], 5, &[dependency])
        .await
        .unwrap();

    let claimed = store
        .claim_next_pending_feature("agent-1", "feature", 3, false)
        .await
        .unwrap()
        .expect("only the dependency-free feature is claimable");

    assert_eq!(claimed.id, dependency);

    let none_left = store
        .claim_next_pending_feature("agent-2", "feature", 3, false)
        .await
        .unwrap();
    assert!(
        none_left.is_none(),
        "the dependent feature must stay blocked until its dependency completes"
    );
}

#[tokio::test]
async fn two_agents_racing_for_the_same_feature_only_one_wins() {
    let store = std::sync::Arc::new(fresh_store().await);
    store
        .create_feature("only-one", "single feature", "core", &[], 5, &[])
        .await
        .unwrap();

    let a = {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .claim_next_pending_feature("agent-a", "feature", 3, false)
                .await
                .unwrap()
        })
    };
    let b = {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .claim_next_pending_feature("agent-b", "feature", 3, false)
                .await
                .unwrap()
        })
    };

    let (a, b) = tokio::join!(a, b);
    let winners = [a.unwrap(), b.unwrap()]
        .into_iter()
        .flatten()
        .count();
    assert_eq!(winners, 1, "exactly one agent must win the claim race");
}

#[tokio::test]
async fn mark_feature_passing_updates_stats() {
    let store = fresh_store().await;
    let id = store
        .create_feature("done-soon", "will pass", "core", &[], 1, &[])
        .await
        .unwrap();
    store
        .claim_next_pending_feature("agent-1", "feature", 3, false)
        .await
        .unwrap();
    store.mark_feature_passing(id).await.unwrap();

    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.done, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.in_progress, 0);

    let feature = store.get_feature(id).await.unwrap().unwrap();
    assert_eq!(feature.status, FeatureStatus::Done.as_str());
}
