//! Online catchup: buffering externalized ledgers, triggering on a fresh
//! checkpoint, and knitting the buffer up afterwards.

mod common;

use common::{validate_ledger, CatchupSimulation};

use chronicle::ledger::LedgerState;

#[tokio::test]
async fn online_catchup_knits_up_to_the_closing_ledger() {
    let mut sim = CatchupSimulation::new(42).await;
    sim.generate_and_publish(47).await;

    let init_ledger = 33u32;
    let buffer = 2u32;
    let trigger = sim.trigger_ledger(init_ledger);
    assert_eq!(trigger, 40);

    let mut node = sim.new_catchup_node().await;
    let final_lcl = sim
        .run_online_catchup(&mut node, init_ledger, buffer, None)
        .await;

    // lastClosed == trigger + buffer + 1, i.e. 33 + (F − 33 % F) + 2 + 1.
    assert_eq!(final_lcl, trigger + buffer + 1);
    assert_eq!(final_lcl, 43);
    assert_eq!(node.ledger_state().await, LedgerState::Synced);
    validate_ledger(&node, sim.expected(43)).await;
}

#[tokio::test]
async fn online_catchup_survives_a_gap_at_the_trigger_ledger() {
    let mut sim = CatchupSimulation::new(42).await;
    sim.generate_and_publish(47).await;

    let init_ledger = 33u32;
    let buffer = 2u32;
    let trigger = sim.trigger_ledger(init_ledger);

    let mut node = sim.new_catchup_node().await;
    // The trigger ledger itself never arrives during the window; it is
    // supplied later, like any other closing ledger.
    let final_lcl = sim
        .run_online_catchup(&mut node, init_ledger, buffer, Some(trigger))
        .await;

    assert_eq!(final_lcl, trigger + buffer + 1);
    assert_eq!(node.ledger_state().await, LedgerState::Synced);
    validate_ledger(&node, sim.expected(final_lcl)).await;
}

#[tokio::test]
async fn stale_externalized_values_are_ignored() {
    let mut sim = CatchupSimulation::new(3).await;
    sim.generate_and_publish(15).await;

    let mut node = sim.new_catchup_node().await;
    assert!(node
        .catchup_offline(15, None, common::TEST_TIMEOUT)
        .await
        .unwrap());
    // Values at or below the LCL do nothing.
    node.value_externalized(sim.close_data(10)).await.unwrap();
    assert_eq!(node.last_closed().await.ledger_seq, 15);
    assert_eq!(node.ledger_state().await, LedgerState::Synced);
}
