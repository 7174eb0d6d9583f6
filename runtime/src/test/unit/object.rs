use conduit_device::{Device, Event, HostArray};
use strum::IntoEnumIterator;
use test_case::test_case;

use crate::test::support::cpu_device;
use crate::{ObjectState, Residency};

fn marker(device: &Device) -> Event {
    device.compute_queue().enqueue_marker(&[]).unwrap()
}

#[test]
fn test_single_device_lifecycle() {
    let device = cpu_device("d0");
    let mut state = ObjectState::new(HostArray::zeroed::<f32>(4));
    assert_eq!(state.residency(), Residency::HostOnly);
    assert!(state.needs_transfer_in(&device));

    state.mark_transferred_in(&device, marker(&device));
    assert_eq!(state.residency(), Residency::DeviceOnly);
    assert!(state.is_current_on(&device));
    assert!(state.authority().is_none());

    let kernel = marker(&device);
    state.mark_written(&device, kernel.clone());
    assert_eq!(state.residency(), Residency::SharedDirtyDevice);
    assert_eq!(state.authority().unwrap().device, device);
    assert!(state.pull_source(&device).is_none());
    assert!(state.last_event_on(&device).unwrap().ptr_eq(&kernel));

    state.mark_synced(&device, marker(&device));
    assert_eq!(state.residency(), Residency::SharedClean);
    assert!(state.is_current_on(&device));

    state.invalidate();
    assert_eq!(state.residency(), Residency::SharedDirtyHost);
    assert!(state.needs_transfer_in(&device));

    state.mark_transferred_in(&device, marker(&device));
    assert_eq!(state.residency(), Residency::SharedClean);
    device.finish().unwrap();
}

#[test]
fn test_write_on_one_device_outdates_the_others() {
    let d0 = cpu_device("d0");
    let d1 = cpu_device("d1");
    let mut state = ObjectState::new(HostArray::zeroed::<f32>(4));

    state.mark_transferred_in(&d0, marker(&d0));
    state.mark_transferred_in(&d1, marker(&d1));
    assert!(state.is_current_on(&d0) && state.is_current_on(&d1));

    state.mark_written(&d1, marker(&d1));
    assert!(!state.is_current_on(&d0));
    assert!(state.is_current_on(&d1));
    assert_eq!(state.pull_source(&d0).unwrap().device, d1);
    assert_eq!(state.copies().len(), 2);

    state.mark_accessed(&d0, marker(&d0));
    assert_eq!(state.residency(), Residency::SharedDirtyDevice);
    assert!(!state.is_current_on(&d0));
}

#[test]
fn test_pending_host_reads_track_transfers_in() {
    let d0 = cpu_device("d0");
    let d1 = cpu_device("d1");
    let mut state = ObjectState::new(HostArray::zeroed::<f32>(4));
    let transfer = marker(&d0);

    state.mark_transferred_in(&d0, transfer.clone());
    state.mark_accessed(&d0, marker(&d0));
    state.mark_written(&d1, marker(&d1));
    let pending: Vec<_> = state.pending_host_reads().collect();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].ptr_eq(&transfer));

    d0.finish().unwrap();
    assert_eq!(state.pending_host_reads().count(), 0);

    state.mark_transferred_in(&d0, marker(&d0));
    d0.finish().unwrap();
    d0.reset();
    state.reconcile_generations();
    assert!(state.copy_on(&d0).is_some_and(|copy| copy.last_transfer_in.is_none()));
}

#[test]
fn test_reset_loses_the_only_current_copy() {
    let device = cpu_device("d0");
    let mut state = ObjectState::new(HostArray::zeroed::<f32>(4));
    state.mark_transferred_in(&device, marker(&device));
    state.mark_written(&device, marker(&device));
    device.finish().unwrap();

    assert!(!state.reconcile_generations());
    device.reset();

    assert!(state.authority().is_none());
    assert!(state.last_event_on(&device).is_none());
    assert!(state.reconcile_generations());
    assert_eq!(state.residency(), Residency::SharedDirtyHost);
    assert!(!state.reconcile_generations());
    assert!(state.copy_on(&device).is_some_and(|copy| copy.generation == device.generation()));
}

#[test]
fn test_reset_keeps_clean_state() {
    let device = cpu_device("d0");
    let mut state = ObjectState::new(HostArray::zeroed::<f32>(4));
    state.mark_transferred_in(&device, marker(&device));
    device.finish().unwrap();
    device.reset();

    assert!(!state.reconcile_generations());
    assert_eq!(state.residency(), Residency::DeviceOnly);
    assert!(state.needs_transfer_in(&device));
}

#[test]
fn test_failure_falls_back_to_host() {
    let device = cpu_device("d0");
    let mut state = ObjectState::new(HostArray::zeroed::<f32>(4));
    state.mark_written(&device, marker(&device));
    state.mark_failed();

    assert_eq!(state.residency(), Residency::SharedDirtyHost);
    assert!(state.authority().is_none());
    assert!(state.last_event_on(&device).is_some());
    device.finish().unwrap();
}

#[test_case(Residency::HostOnly, true)]
#[test_case(Residency::DeviceOnly, true)]
#[test_case(Residency::SharedClean, true)]
#[test_case(Residency::SharedDirtyHost, true)]
#[test_case(Residency::SharedDirtyDevice, false)]
#[test_case(Residency::Untracked, false)]
fn test_host_is_current(residency: Residency, expected: bool) {
    assert_eq!(residency.host_is_current(), expected);
}

#[test]
fn test_residency_names() {
    let names: Vec<String> = Residency::iter().map(|residency| residency.to_string()).collect();
    assert_eq!(
        names,
        ["UNTRACKED", "HOST_ONLY", "DEVICE_ONLY", "SHARED_CLEAN", "SHARED_DIRTY_HOST", "SHARED_DIRTY_DEVICE"]
    );
}
