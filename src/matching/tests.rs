use std::collections::BTreeSet;

use crate::config::MatchConfig;
use crate::db::{Database, FoundationRow, GrantRow};
use crate::matching::{RegistryEntry, RunOptions, TierOrchestrator, TierSummary};

fn config() -> MatchConfig {
    MatchConfig {
        worker_count: 3,
        batch_size: 2,
        ..MatchConfig::default()
    }
}

fn grant(id: i64, foundation: Option<&str>, name: Option<&str>, ein: Option<&str>) -> GrantRow {
    GrantRow {
        id,
        foundation_ein: foundation.map(str::to_string),
        recipient_name: name.map(str::to_string),
        recipient_ein: ein.map(str::to_string),
    }
}

async fn seeded_database() -> Database {
    let db = Database::in_memory().await.expect("db");

    for (ein, state) in [("900", "CA"), ("901", "WA"), ("902", "NY")] {
        db.upsert_foundation(&FoundationRow {
            ein: ein.to_string(),
            name: Some(format!("Foundation {}", ein)),
            city: None,
            state: Some(state.to_string()),
        })
        .await
        .expect("foundation");
    }

    let registry = [
        RegistryEntry::new("001", "Example Foundation Inc").with_region("CA"),
        RegistryEntry::new("010", "Helping Hands Inc"),
        RegistryEntry::new("011", "Helping Hand Inc"),
        // Same normalized name in two regions
        RegistryEntry::new("020", "Riverside Food Bank Inc").with_region("WA"),
        RegistryEntry::new("021", "Riverside Food Bank").with_region("OR"),
        RegistryEntry::new("030", "Metropolitan Opera Association").with_region("NY"),
    ];
    for entry in &registry {
        db.upsert_registry_entry(entry).await.expect("registry");
    }

    let grants = [
        // Region tier, exact normalized hit
        grant(1, Some("900"), Some("EXAMPLE FOUNDATION"), None),
        // No name at all
        grant(2, Some("900"), None, None),
        // Asserted id, unrelated name
        grant(3, Some("902"), Some("Something Else Entirely"), Some("001")),
        // Only the prefix tier can see this one (no foundation region)
        grant(4, None, Some("Helping Hnd"), None),
        // Region tier must win over the prefix tier's collision winner
        grant(5, Some("901"), Some("Riverside Food Bank"), None),
        // Nothing close anywhere
        grant(6, Some("902"), Some("Zebra Rescue League"), None),
        // Region tier fuzzy hit
        grant(7, Some("902"), Some("Metropolitan Opera Assn"), None),
    ];
    for row in &grants {
        db.insert_grant(row).await.expect("grant");
    }

    db
}

#[tokio::test]
async fn test_full_pipeline_resolves_by_earliest_tier() {
    let db = seeded_database().await;
    let summary = TierOrchestrator::new(&db, &config())
        .expect("orchestrator")
        .run()
        .await
        .expect("run");

    assert_eq!(summary.tiers.len(), 3);
    assert!(!summary.dry_run);

    // Scenario D: exact id, regardless of name
    assert_eq!(db.resolved_id(3).await.unwrap().as_deref(), Some("001"));
    assert_eq!(db.match_tier(3).await.unwrap(), Some(1));

    // Scenario A: region tier at cutoff 95
    assert_eq!(db.resolved_id(1).await.unwrap().as_deref(), Some("001"));
    assert_eq!(db.match_tier(1).await.unwrap(), Some(2));

    // Region tier claims the record before the prefix tier could pick "021"
    assert_eq!(db.resolved_id(5).await.unwrap().as_deref(), Some("020"));
    assert_eq!(db.match_tier(5).await.unwrap(), Some(2));

    // Scenario C: closest of two near-identical names, via the prefix tier
    assert_eq!(db.resolved_id(4).await.unwrap().as_deref(), Some("011"));
    assert_eq!(db.match_tier(4).await.unwrap(), Some(3));

    // Scenario B and a genuine miss stay unresolved
    assert_eq!(db.resolved_id(2).await.unwrap(), None);
    assert_eq!(db.resolved_id(6).await.unwrap(), None);
    assert_eq!(summary.remaining_unresolved, 2);

    let tier1 = &summary.tiers[0];
    assert_eq!(tier1.records_in, 7);
    assert_eq!(tier1.committed, 1);

    let tier2 = &summary.tiers[1];
    assert_eq!(tier2.records_in, 6);
    assert_eq!(tier2.faults, 0);
    assert!(summary.failed_record_ids().is_empty());

    let tier3 = &summary.tiers[2];
    assert_eq!(tier3.records_in, 6 - tier2.committed as usize);
    assert_eq!(tier3.index.collisions, 1);
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let db = seeded_database().await;
    let orchestrator = TierOrchestrator::new(&db, &config()).expect("orchestrator");

    let first = orchestrator.run().await.expect("first run");
    let after_first = db.resolved_assignments().await.expect("assignments");

    let second = orchestrator.run().await.expect("second run");
    let after_second = db.resolved_assignments().await.expect("assignments");

    assert!(first.total_committed() > 0);
    assert_eq!(second.total_committed(), 0);
    assert_eq!(after_first, after_second);
    assert_eq!(first.remaining_unresolved, second.remaining_unresolved);
}

#[tokio::test]
async fn test_independent_runs_agree() {
    let mut outcomes = Vec::new();
    for workers in [1, 4] {
        let db = seeded_database().await;
        let config = MatchConfig {
            worker_count: workers,
            ..config()
        };
        TierOrchestrator::new(&db, &config)
            .expect("orchestrator")
            .run()
            .await
            .expect("run");
        outcomes.push(db.resolved_assignments().await.expect("assignments"));
    }
    assert_eq!(outcomes[0], outcomes[1]);
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let db = seeded_database().await;
    let summary = TierOrchestrator::new(&db, &config())
        .expect("orchestrator")
        .with_options(RunOptions {
            dry_run: true,
            limit: None,
        })
        .run()
        .await
        .expect("run");

    assert!(summary.dry_run);
    assert_eq!(summary.total_committed(), 0);
    assert_eq!(summary.remaining_unresolved, 7);
    assert!(db.resolved_assignments().await.expect("assignments").is_empty());

    // Later tiers still skip what earlier tiers would have claimed
    let proposed: usize = summary.tiers.iter().map(|tier| tier.candidates).sum();
    assert_eq!(proposed, 5);
    assert_eq!(summary.tiers[1].records_in, 6);
}

#[tokio::test]
async fn test_failed_batch_is_reported_not_retried_downstream() {
    let db = seeded_database().await;
    sqlx::query(
        r#"
        CREATE TRIGGER reject_grant_five BEFORE UPDATE ON grants
        WHEN NEW.id = 5
        BEGIN
            SELECT RAISE(ABORT, 'grant 5 is locked');
        END;
        "#,
    )
    .execute(db.pool())
    .await
    .expect("trigger");

    let config = MatchConfig {
        batch_size: 1,
        ..config()
    };
    let summary = TierOrchestrator::new(&db, &config)
        .expect("orchestrator")
        .run()
        .await
        .expect("run");

    assert_eq!(summary.failed_record_ids(), vec![5]);
    assert_eq!(summary.tiers[1].failed_batches.len(), 1);
    assert_eq!(db.resolved_id(5).await.unwrap(), None);
    // Other batches in the same tier still committed
    assert_eq!(db.resolved_id(1).await.unwrap().as_deref(), Some("001"));
    // The prefix tier did not get a second shot at grant 5
    assert_eq!(summary.tiers[2].records_in, summary.tiers[1].records_in - 3);
}

/// Grant 3 asserts registry id "001" but its name is a near-verbatim hit for
/// "011" in the prefix tier.
async fn seeded_with_misleading_name() -> Database {
    let db = seeded_database().await;
    db.insert_grant(&grant(3, None, Some("Helping Hand"), Some("001")))
        .await
        .expect("grant");
    db
}

fn ids(summary: &TierSummary) -> BTreeSet<i64> {
    summary.record_ids.iter().copied().collect()
}

#[tokio::test]
async fn test_limit_fixes_sample_at_first_tier() {
    let db = seeded_with_misleading_name().await;
    let summary = TierOrchestrator::new(&db, &config())
        .expect("orchestrator")
        .with_options(RunOptions {
            dry_run: false,
            limit: Some(2),
        })
        .run()
        .await
        .expect("run");

    assert_eq!(summary.tiers[0].record_ids, vec![1, 2]);
    assert_eq!(summary.tiers[1].record_ids, vec![1, 2]);
    assert_eq!(summary.tiers[2].record_ids, vec![2]);
    assert_eq!(db.resolved_id(1).await.unwrap().as_deref(), Some("001"));

    // Outside the sample, so no tier may touch it in this run
    assert_eq!(db.resolved_id(3).await.unwrap(), None);

    // A full run later still resolves it through its asserted id
    TierOrchestrator::new(&db, &config())
        .expect("orchestrator")
        .run()
        .await
        .expect("run");
    assert_eq!(db.resolved_id(3).await.unwrap().as_deref(), Some("001"));
    assert_eq!(db.match_tier(3).await.unwrap(), Some(1));
}

#[tokio::test]
async fn test_dry_run_limit_stays_inside_sample() {
    let db = seeded_with_misleading_name().await;
    let summary = TierOrchestrator::new(&db, &config())
        .expect("orchestrator")
        .with_options(RunOptions {
            dry_run: true,
            limit: Some(2),
        })
        .run()
        .await
        .expect("run");

    let sample = ids(&summary.tiers[0]);
    assert_eq!(sample, BTreeSet::from([1, 2]));
    for tier in &summary.tiers {
        assert!(ids(tier).is_subset(&sample), "tier {} left the sample", tier.tier);
    }
    assert_eq!(summary.tiers[2].record_ids, vec![2]);
    assert!(db.resolved_assignments().await.expect("assignments").is_empty());
}

#[tokio::test]
async fn test_each_tier_sees_only_what_earlier_tiers_left() {
    for (dry_run, limit) in [(false, None), (false, Some(4)), (true, None), (true, Some(4))] {
        let db = seeded_with_misleading_name().await;
        let summary = TierOrchestrator::new(&db, &config())
            .expect("orchestrator")
            .with_options(RunOptions { dry_run, limit })
            .run()
            .await
            .expect("run");

        for pair in summary.tiers.windows(2) {
            let (previous, next) = (&pair[0], &pair[1]);
            let (before, after) = (ids(previous), ids(next));
            assert!(
                after.is_subset(&before),
                "dry_run={} limit={:?}: tier {} saw records tier {} never did",
                dry_run,
                limit,
                next.tier,
                previous.tier
            );

            if dry_run {
                assert_eq!(after.len(), before.len() - previous.candidates);
            } else {
                let mut left = BTreeSet::new();
                for id in &before {
                    if db.match_tier(*id).await.unwrap() != Some(previous.tier as i64) {
                        left.insert(*id);
                    }
                }
                assert_eq!(after, left, "dry_run={} limit={:?}", dry_run, limit);
            }
        }

        // Grant 3 always goes to its asserted id, never to the fuzzy hit
        if !dry_run {
            assert_eq!(db.resolved_id(3).await.unwrap().as_deref(), Some("001"));
        }
    }
}
