//! Unit status gates matching: paused and disabled units never produce runs,
//! and re-activating a unit resumes matching for *subsequent* events only —
//! there is no backfill of events that arrived while it was off.

use cortex_schemas::{Action, Event, UnitStatus};
use cortex_store::Store;
use cortex_testkit::{make_unit, TestRig};
use serde_json::json;

fn archive_action() -> Vec<Action> {
    vec![Action::Tool {
        tool: "gmail.archive".to_string(),
        args: json!({}),
        store_as: None,
    }]
}

fn email(n: u32) -> Event {
    Event::new(
        format!("gmail_m{n}_1"),
        "u1",
        "gmail",
        "email_received",
        json!({ "from": "someone@example.com" }),
        Some(format!("gmail:m{n}")),
    )
}

#[tokio::test]
async fn paused_and_disabled_units_produce_zero_runs() {
    for status in [UnitStatus::Paused, UnitStatus::Disabled] {
        let rig = TestRig::new();
        let mut unit = make_unit("u1", "gmail", "email_received", vec![], archive_action());
        unit.status = status;
        rig.store.save_unit(&unit).await.unwrap();

        let runs = rig.ingest(email(1)).await.unwrap();
        assert!(runs.is_empty(), "{status:?} unit must not match");
        assert_eq!(rig.store.run_count(), 0);
    }
}

#[tokio::test]
async fn reactivation_resumes_matching_without_backfill() {
    let rig = TestRig::new();
    let mut unit = make_unit("u1", "gmail", "email_received", vec![], archive_action());
    unit.status = UnitStatus::Paused;
    rig.store.save_unit(&unit).await.unwrap();

    // Arrived while paused: accepted into the event store, but no run.
    let while_paused = rig.ingest(email(1)).await.unwrap();
    assert!(while_paused.is_empty());

    rig.store
        .set_unit_status(unit.id, UnitStatus::Active)
        .await
        .unwrap();

    // Redelivering the old event is still a duplicate: no backfill.
    let replayed = rig.ingest(email(1)).await.unwrap();
    assert!(replayed.is_empty());

    // A genuinely new event matches.
    let fresh = rig.ingest(email(2)).await.unwrap();
    assert_eq!(fresh.len(), 1);
    assert_eq!(rig.store.run_count(), 1);
}

#[tokio::test]
async fn only_units_listening_on_the_exact_trigger_match() {
    let rig = TestRig::new();
    rig.store
        .save_unit(&make_unit("u1", "gmail", "email_sent", vec![], archive_action()))
        .await
        .unwrap();
    rig.store
        .save_unit(&make_unit(
            "u1",
            "salesforce",
            "email_received",
            vec![],
            archive_action(),
        ))
        .await
        .unwrap();

    let runs = rig.ingest(email(3)).await.unwrap();
    assert!(
        runs.is_empty(),
        "neither (gmail, email_sent) nor (salesforce, email_received) listens on (gmail, email_received)"
    );
}
