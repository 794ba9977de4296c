use super::Convergent;

#[test]
fn no_request_while_converged() {
    let mut volume = Convergent::new(50u32);
    assert_eq!(volume.take_request(), None);
    volume.set_desired(50);
    assert_eq!(volume.take_request(), None);
}

#[test]
fn single_request_per_divergence() {
    let mut volume = Convergent::new(50u32);
    volume.set_desired(75);
    assert_eq!(volume.take_request(), Some(75));
    // Guard holds until the response lands, even across repeated passes.
    assert_eq!(volume.take_request(), None);
    assert!(volume.is_in_flight());
    assert_eq!(volume.complete(true, &75), None);
    assert_eq!(*volume.current(), 75);
    assert_eq!(volume.take_request(), None);
}

#[test]
fn failure_reverts_desired_and_reports_rejected_value() {
    let mut volume = Convergent::new(50u32);
    volume.set_desired(80);
    assert_eq!(volume.take_request(), Some(80));
    assert_eq!(volume.complete(false, &80), Some(80));
    assert_eq!(*volume.current(), 50);
    assert_eq!(*volume.desired(), 50);
    assert_eq!(volume.take_request(), None);
}

#[test]
fn newer_desired_value_survives_failed_response() {
    let mut volume = Convergent::new(50u32);
    volume.set_desired(80);
    assert_eq!(volume.take_request(), Some(80));
    // Intent changed while the first request was outstanding.
    volume.set_desired(90);
    assert_eq!(volume.complete(false, &80), Some(80));
    assert_eq!(*volume.desired(), 90);
    assert_eq!(volume.take_request(), Some(90));
}

#[test]
fn last_write_wins_after_inflight_clears() {
    let mut volume = Convergent::new(50u32);
    volume.set_desired(60);
    assert_eq!(volume.take_request(), Some(60));
    volume.set_desired(70);
    assert_eq!(volume.take_request(), None);
    assert_eq!(volume.complete(true, &60), None);
    assert_eq!(volume.take_request(), Some(70));
}

#[test]
fn observed_value_follows_desired_when_idle() {
    let mut muted = Convergent::new(false);
    muted.observe(true);
    assert!(*muted.current());
    assert!(*muted.desired());
    assert_eq!(muted.take_request(), None);
}

#[test]
fn observed_value_keeps_pending_local_intent() {
    let mut muted = Convergent::new(false);
    muted.set_desired(true);
    muted.observe(false);
    assert!(!*muted.current());
    assert!(*muted.desired());
    assert_eq!(muted.take_request(), Some(true));
}
