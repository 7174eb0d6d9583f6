use std::sync::Arc;
use std::time::Duration;

use conduit_device::{CpuDeviceConfig, EventStatus, HostArray};

use crate::test::support::{CopyInto, Delay, Fail, Fill, Increment, cpu_device, cpu_device_with, registry_with};
use crate::{EngineConfig, Error, ExecutionContext, Residency, Task};

#[test]
fn test_results_stay_on_device_until_sync() {
    let device = cpu_device("d0");
    let mut context = ExecutionContext::new("s0", registry_with([device.clone()]));
    let a = HostArray::from_slice(&[1.0f32, 2.0, 3.0, 4.0]);
    context.add_task(&Task::builder("t0", Arc::new(Increment)).read_write(&a).build());

    context.execute().unwrap();
    context.wait().unwrap();
    assert_eq!(context.object_state(&a), Residency::SharedDirtyDevice);
    assert_eq!(a.to_vec::<f32>().unwrap(), [1.0, 2.0, 3.0, 4.0]);

    assert_eq!(context.sync().unwrap(), 1);
    assert_eq!(a.to_vec::<f32>().unwrap(), [2.0, 3.0, 4.0, 5.0]);
    assert_eq!(context.object_state(&a), Residency::SharedClean);

    assert_eq!(context.sync().unwrap(), 0);
    assert_eq!(context.last_devices(), &[device]);
}

#[test]
fn test_read_only_objects_are_not_transferred_out() {
    let mut context = ExecutionContext::new("s0", registry_with([cpu_device("d0")]));
    let source = HostArray::from_slice(&[5.0f32; 8]);
    let target = HostArray::zeroed::<f32>(8);
    context.add_task(&Task::builder("t0", Arc::new(CopyInto)).read(&source).write(&target).build());

    context.execute().unwrap();
    assert_eq!(context.sync().unwrap(), 1);
    assert_eq!(context.object_state(&source), Residency::DeviceOnly);
    assert_eq!(context.object_state(&target), Residency::SharedClean);
    assert_eq!(target.to_vec::<f32>().unwrap(), [5.0; 8]);
}

#[test]
fn test_write_then_read_on_one_device() {
    let mut context = ExecutionContext::new("s0", registry_with([cpu_device("d0")]));
    let a = HostArray::zeroed::<f32>(16);
    let b = HostArray::zeroed::<f32>(16);
    context.add_task(&Task::builder("t0", Arc::new(Fill)).write(&a).scalar(7.0f32).build());
    context.add_task(&Task::builder("t1", Arc::new(CopyInto)).read(&a).write(&b).build());
    context.add_task(&Task::builder("t2", Arc::new(Increment)).read_write(&b).build());

    context.execute().unwrap();
    assert_eq!(context.sync().unwrap(), 2);
    assert_eq!(a.to_vec::<f32>().unwrap(), [7.0; 16]);
    assert_eq!(b.to_vec::<f32>().unwrap(), [8.0; 16]);
}

#[test]
fn test_repeated_execution_reuses_device_copies() {
    let device = cpu_device("d0");
    let mut context = ExecutionContext::new("s0", registry_with([device.clone()]));
    let a = HostArray::from_slice(&[0.0f32; 4]);
    context.add_task(&Task::builder("t0", Arc::new(Increment)).read_write(&a).build());

    for _ in 0..3 {
        context.execute().unwrap();
    }
    assert_eq!(context.outstanding(), 1);
    assert_eq!(context.sync().unwrap(), 1);
    assert_eq!(context.outstanding(), 0);
    assert_eq!(a.to_vec::<f32>().unwrap(), [3.0; 4]);
    assert_eq!(device.buffer_count(), 1);
}

#[test]
fn test_cross_device_read_after_write() {
    let d0 = cpu_device("d0");
    let d1 = cpu_device("d1");
    let mut context = ExecutionContext::new("s0", registry_with([d0.clone(), d1.clone()]));
    let a = HostArray::from_slice(&[1.0f32; 4]);
    let b = HostArray::zeroed::<f32>(4);
    context.add_task(&Task::builder("t0", Arc::new(Increment)).read_write(&a).device(d0.clone()).build());
    context.add_task(&Task::builder("t1", Arc::new(Increment)).read_write(&a).device(d1.clone()).build());
    context.add_task(&Task::builder("t2", Arc::new(CopyInto)).read(&a).write(&b).device(d0.clone()).build());

    context.execute().unwrap();
    // `a` already went through the host on its way back to d0.
    assert_eq!(context.sync().unwrap(), 1);
    assert_eq!(a.to_vec::<f32>().unwrap(), [3.0; 4]);
    assert_eq!(b.to_vec::<f32>().unwrap(), [3.0; 4]);
    assert_eq!(context.last_devices(), &[d0.clone(), d1.clone()]);

    let state = context.state(context.object_index(&a).unwrap()).unwrap();
    assert!(state.is_current_on(&d0));
    assert!(state.is_current_on(&d1));
}

#[test]
fn test_pull_waits_for_earlier_transfer_in() {
    let d0 = cpu_device("d0");
    let d1 = cpu_device("d1");
    let mut context = ExecutionContext::new("s0", registry_with([d0.clone(), d1.clone()]));
    let busy = HostArray::zeroed::<f32>(4);
    let a = HostArray::from_slice(&[1.0f32; 4]);
    let x = HostArray::zeroed::<f32>(4);
    let y = HostArray::zeroed::<f32>(4);

    // d0 is still sleeping when d1 overwrites `a` and t3 pulls it back through the host.
    let delay = Arc::new(Delay(Duration::from_millis(300)));
    context.add_task(&Task::builder("t0", delay).read_write(&busy).device(d0.clone()).build());
    context.add_task(&Task::builder("t1", Arc::new(CopyInto)).read(&a).write(&x).device(d0.clone()).build());
    context.add_task(&Task::builder("t2", Arc::new(Fill)).write(&a).scalar(7.0f32).device(d1.clone()).build());
    context.add_task(&Task::builder("t3", Arc::new(CopyInto)).read(&a).write(&y).device(d0.clone()).build());

    context.execute().unwrap();
    context.sync().unwrap();
    assert_eq!(x.to_vec::<f32>().unwrap(), [1.0; 4]);
    assert_eq!(y.to_vec::<f32>().unwrap(), [7.0; 4]);
    assert_eq!(a.to_vec::<f32>().unwrap(), [7.0; 4]);
}

#[test]
fn test_out_of_device_memory() {
    let device = cpu_device_with(CpuDeviceConfig::builder().name("tiny").compute_units(1).memory_capacity(16).build());
    let mut context = ExecutionContext::new("s0", registry_with([device.clone()]));
    let a = HostArray::zeroed::<f32>(8);
    context.add_task(&Task::builder("t0", Arc::new(Increment)).read_write(&a).build());

    let err = context.execute().unwrap_err();
    assert!(matches!(err, Error::OutOfDeviceMemory { requested: 32, available: 16, .. }), "{err}");
    assert_eq!(device.buffer_count(), 0);
    assert_eq!(context.object_state(&a), Residency::HostOnly);
}

#[test]
fn test_failed_task_falls_back_to_host_data() {
    let mut context = ExecutionContext::new("s0", registry_with([cpu_device("d0")]));
    let a = HostArray::from_slice(&[1.0f32, 2.0]);
    let b = HostArray::zeroed::<f32>(2);
    context.add_task(&Task::builder("t0", Arc::new(Fail)).read_write(&a).build());
    context.add_task(&Task::builder("t1", Arc::new(CopyInto)).read(&a).write(&b).build());

    context.execute().unwrap();
    let err = context.sync().unwrap_err();
    assert!(matches!(err, Error::DeviceExecution { status: EventStatus::Error, .. }), "{err}");
    assert_eq!(context.object_state(&a), Residency::SharedDirtyHost);
    assert_eq!(context.object_state(&b), Residency::SharedDirtyHost);
    assert_eq!(context.completion(1).unwrap().status(), EventStatus::Error);

    assert_eq!(context.sync().unwrap(), 0);
    assert_eq!(a.to_vec::<f32>().unwrap(), [1.0, 2.0]);
    assert_eq!(b.to_vec::<f32>().unwrap(), [0.0, 0.0]);
}

#[test]
fn test_reset_reallocates_and_transfers_again() {
    let device = cpu_device("d0");
    let mut context = ExecutionContext::new("s0", registry_with([device.clone()]));
    let a = HostArray::from_slice(&[1.0f32; 4]);
    context.add_task(&Task::builder("t0", Arc::new(Increment)).read_write(&a).build());

    context.execute().unwrap();
    assert_eq!(context.sync().unwrap(), 1);
    let before = context.completion(0).unwrap().clone();

    device.reset();
    assert_eq!(device.buffer_count(), 0);
    assert!(before.is_stale());

    context.execute().unwrap();
    assert_eq!(context.sync().unwrap(), 1);
    assert_eq!(a.to_vec::<f32>().unwrap(), [3.0; 4]);
    assert_eq!(device.buffer_count(), 1);
    assert!(!context.completion(0).unwrap().is_stale());
}

#[test]
fn test_reset_discards_unsynced_results() {
    let device = cpu_device("d0");
    let mut context = ExecutionContext::new("s0", registry_with([device.clone()]));
    let a = HostArray::from_slice(&[1.0f32; 4]);
    context.add_task(&Task::builder("t0", Arc::new(Increment)).read_write(&a).build());

    context.execute().unwrap();
    context.wait().unwrap();
    device.reset();

    assert_eq!(context.sync().unwrap(), 0);
    assert_eq!(context.object_state(&a), Residency::SharedDirtyHost);
    assert_eq!(a.to_vec::<f32>().unwrap(), [1.0; 4]);
}

#[test]
fn test_invalidate_forces_transfer_in() {
    let mut context = ExecutionContext::new("s0", registry_with([cpu_device("d0")]));
    let a = HostArray::from_slice(&[1.0f32; 4]);
    context.add_task(&Task::builder("t0", Arc::new(Increment)).read_write(&a).build());

    context.execute().unwrap();
    context.sync().unwrap();
    assert_eq!(a.to_vec::<f32>().unwrap(), [2.0; 4]);

    a.copy_from_slice(&[10.0f32; 4]).unwrap();
    assert!(context.invalidate(&a));
    assert_eq!(context.object_state(&a), Residency::SharedDirtyHost);

    context.execute().unwrap();
    context.sync().unwrap();
    assert_eq!(a.to_vec::<f32>().unwrap(), [11.0; 4]);
}

#[test]
fn test_sync_single_object() {
    let mut context = ExecutionContext::new("s0", registry_with([cpu_device("d0")]));
    let a = HostArray::from_slice(&[1.0f32; 4]);
    let b = HostArray::from_slice(&[1.0f32; 4]);
    context.add_task(&Task::builder("t0", Arc::new(Increment)).read_write(&a).build());
    context.add_task(&Task::builder("t1", Arc::new(Increment)).read_write(&b).build());

    context.execute().unwrap();
    assert!(context.sync_object(&a).unwrap());
    assert!(!context.sync_object(&a).unwrap());
    assert_eq!(a.to_vec::<f32>().unwrap(), [2.0; 4]);
    assert_eq!(context.object_state(&b), Residency::SharedDirtyDevice);

    assert_eq!(context.sync().unwrap(), 1);
    assert_eq!(b.to_vec::<f32>().unwrap(), [2.0; 4]);
}

#[test]
fn test_transfer_queue_routing() {
    let device = cpu_device_with(CpuDeviceConfig::builder().name("dual").compute_units(2).transfer_queue(true).build());
    assert!(device.transfer_queue().is_some());

    for use_transfer_queue in [true, false] {
        let config = EngineConfig::builder().use_transfer_queue(use_transfer_queue).build();
        let mut context = ExecutionContext::with_config("s0", registry_with([device.clone()]), config);
        let a = HostArray::from_slice(&[1.0f32; 64]);
        context.add_task(&Task::builder("t0", Arc::new(Increment)).read_write(&a).build());
        context.add_task(&Task::builder("t1", Arc::new(Increment)).read_write(&a).build());

        context.execute().unwrap();
        assert_eq!(context.sync().unwrap(), 1);
        assert_eq!(a.to_vec::<f32>().unwrap(), [3.0; 64]);
    }
}

#[test]
fn test_redeploy_on_another_device() {
    let d0 = cpu_device("d0");
    let d1 = cpu_device("d1");
    let mut context = ExecutionContext::new("s0", registry_with([d0.clone(), d1.clone()]));
    let a = HostArray::from_slice(&[0.0f32; 4]);
    context.add_task(&Task::builder("t0", Arc::new(Increment)).read_write(&a).build());

    context.execute().unwrap();
    assert_eq!(context.last_devices(), &[d0.clone()]);

    context.map_all_tasks_to(&d1).unwrap();
    assert!(context.redeploy_on_device());
    context.execute().unwrap();
    assert!(!context.redeploy_on_device());
    assert_eq!(context.last_devices(), &[d1.clone()]);

    assert_eq!(context.sync().unwrap(), 1);
    assert_eq!(a.to_vec::<f32>().unwrap(), [2.0; 4]);
}

#[test]
fn test_profile_reports_launches() {
    let mut context = ExecutionContext::new("s0", registry_with([cpu_device("d0")]));
    let a = HostArray::from_slice(&[1.0f32; 4]);
    context.add_task(&Task::builder("t0", Arc::new(Increment)).read_write(&a).build());

    let profile = context.profile();
    assert_eq!(profile[0].status, None);
    assert_eq!(profile[0].device, None);

    context.execute().unwrap();
    context.sync().unwrap();

    let profile = context.profile();
    assert_eq!(profile.len(), 1);
    assert_eq!(profile[0].task, "s0.t0");
    assert_eq!(profile[0].device.as_deref(), Some("d0"));
    assert_eq!(profile[0].status, Some(EventStatus::Complete));
    assert!(profile[0].execution_time().is_some());
    assert!(profile[0].to_string().starts_with("s0.t0 on d0 [COMPLETE]"));
}
