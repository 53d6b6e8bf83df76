//! Integration tests for the connection lifecycle
//!
//! Drives `ConnectionManager` against the scripted host:
//! - Enumeration and permission requests
//! - Open, write, close and their failure modes
//! - Transport errors and hot-plug teardown

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockHost, MockPort, PermissionPolicy, RecordingSink, mock_ch340,
    mock_raw_device,
};
use common::{DeviceSelector, DriverKind, DriverOverrides, LineParameters, SerialEvent, TransportError};
use serial::{
    ConnectionManager, ManagerConfig, OpenOutcome, PortState, SerialError, WorkerSettings,
    WorkerState,
};
use std::sync::Arc;
use std::time::Duration;

const DEVICE_PATH: &str = "/dev/bus/usb/001/004";

struct Fixture {
    host: Arc<MockHost>,
    sink: Arc<RecordingSink>,
    manager: ConnectionManager,
}

impl Fixture {
    fn new(permission: bool) -> Self {
        Self::with_config(permission, ManagerConfig::default())
    }

    fn with_config(permission: bool, config: ManagerConfig) -> Self {
        let host = Arc::new(MockHost::new());
        host.add_device(mock_ch340(4), Some(DriverKind::Ch34x), permission);
        let sink = Arc::new(RecordingSink::new());
        let manager =
            ConnectionManager::with_config(host.clone(), DriverOverrides::new(), sink.clone(), config);
        Self {
            host,
            sink,
            manager,
        }
    }

    /// Worker settings that drain writes without waiting for inbound data
    fn polling() -> ManagerConfig {
        ManagerConfig {
            worker: WorkerSettings {
                read_timeout: Some(Duration::from_millis(5)),
                ..WorkerSettings::default()
            },
            ..ManagerConfig::default()
        }
    }

    fn open(&self, name: &str) -> Result<OpenOutcome, SerialError> {
        self.manager
            .open(name, &DeviceSelector::Any, LineParameters::default())
    }

    fn port(&self) -> Arc<MockPort> {
        self.host.port(DEVICE_PATH).unwrap()
    }
}

mod enumeration {
    use super::*;

    #[test]
    fn test_no_devices_is_empty_list() {
        let host = Arc::new(MockHost::new());
        let manager = ConnectionManager::new(
            host.clone(),
            DriverOverrides::new(),
            Arc::new(RecordingSink::new()),
        );
        assert!(manager.enumerate().is_empty());
        assert_eq!(host.permission_request_count(), 0);
    }

    #[test]
    fn test_unpermitted_device_requests_once_on_open() {
        let f = Fixture::new(false);

        let devices = f.manager.enumerate();
        assert_eq!(devices.len(), 1);
        assert!(!devices[0].permission_granted);
        assert_eq!(f.host.permission_request_count(), 0);

        assert_eq!(f.open("COM-A").unwrap(), OpenOutcome::AwaitingPermission);
        assert_eq!(f.host.permission_requests(), vec![DEVICE_PATH.to_string()]);

        // A second port on the same device joins the outstanding request
        assert_eq!(f.open("COM-B").unwrap(), OpenOutcome::AwaitingPermission);
        assert_eq!(f.host.permission_request_count(), 1);
    }

    #[test]
    fn test_overrides_classify_unknown_devices() {
        let host = Arc::new(MockHost::new());
        host.add_device(mock_raw_device(DEVICE_PATH, 0x1234, 0x5678), None, true);
        let overrides: DriverOverrides = [((0x1234, 0x5678), DriverKind::CommonUsb)]
            .into_iter()
            .collect();
        let manager = ConnectionManager::new(host, overrides, Arc::new(RecordingSink::new()));

        assert_eq!(manager.enumerate()[0].driver, DriverKind::CommonUsb);
    }
}

mod open {
    use super::*;

    #[test]
    fn test_open_with_permission_connects_once() {
        let f = Fixture::new(true);

        assert_eq!(f.open("COM-A").unwrap(), OpenOutcome::Connected);
        assert_eq!(f.sink.connection_changes("COM-A"), vec![true]);
        assert_eq!(
            f.manager.port_state("COM-A"),
            Some(PortState::Open(WorkerState::Running))
        );
        assert_eq!(f.port().parameters(), Some(LineParameters::default()));
        assert_eq!(f.host.permission_request_count(), 0);

        f.manager.shutdown();
    }

    #[test]
    fn test_open_twice_keeps_existing_worker() {
        let f = Fixture::new(true);
        f.open("COM-A").unwrap();

        assert_eq!(
            f.open("COM-A"),
            Err(SerialError::AlreadyOpen("COM-A".into()))
        );
        assert_eq!(
            f.manager.port_state("COM-A"),
            Some(PortState::Open(WorkerState::Running))
        );
        assert_eq!(f.host.open_count(), 1);
        assert!(!f.port().is_closed());
        assert_eq!(f.sink.connection_changes("COM-A"), vec![true]);
        assert!(f.sink.errors().is_empty());

        f.manager.shutdown();
    }

    #[test]
    fn test_permission_granted_later_connects() {
        let f = Fixture::new(false);
        f.open("COM-A").unwrap();
        assert!(f.sink.events().is_empty());

        assert!(f.host.resolve_permission(DEVICE_PATH, true));
        assert!(f.sink.wait_for(DEFAULT_TEST_TIMEOUT, |events| {
            events.iter().any(|e| {
                matches!(e, SerialEvent::ConnectedStateChanged { connected: true, .. })
            })
        }));
        assert!(f.manager.is_open("COM-A"));

        f.manager.shutdown();
    }

    #[test]
    fn test_auto_granted_permission_connects_from_host_thread() {
        let f = Fixture::new(false);
        f.host.set_permission_policy(PermissionPolicy::AutoGrant);

        assert_eq!(f.open("COM-A").unwrap(), OpenOutcome::AwaitingPermission);
        assert!(f.sink.wait_for(DEFAULT_TEST_TIMEOUT, |events| !events.is_empty()));
        assert_eq!(f.sink.connection_changes("COM-A"), vec![true]);

        f.manager.shutdown();
    }

    #[test]
    fn test_denied_permission_reports_one_error() {
        let f = Fixture::new(false);
        f.open("COM-A").unwrap();

        assert!(f.host.resolve_permission(DEVICE_PATH, false));

        let errors = f.sink.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("permission denied"));
        assert!(f.sink.connection_changes("COM-A").is_empty());
        assert_eq!(f.manager.port_state("COM-A"), None);
        assert_eq!(f.host.open_count(), 0);

        // The caller may try again; the host is asked anew
        f.open("COM-A").unwrap();
        assert_eq!(f.host.permission_request_count(), 2);
    }

    #[test]
    fn test_missing_device_reports_not_found() {
        let f = Fixture::new(true);
        let selector = DeviceSelector::Path("/dev/bus/usb/002/009".into());

        let err = f
            .manager
            .open("COM-A", &selector, LineParameters::default())
            .unwrap_err();
        assert!(matches!(err, SerialError::DeviceNotFound(_)));
        assert_eq!(f.sink.errors().len(), 1);
        assert_eq!(f.manager.port_state("COM-A"), None);
    }

    #[test]
    fn test_handle_acquisition_failure_leaves_port_closed() {
        let f = Fixture::new(true);
        f.host.fail_open(DEVICE_PATH);

        assert!(matches!(
            f.open("COM-A"),
            Err(SerialError::Transport(TransportError::Io(_)))
        ));
        assert_eq!(f.manager.port_state("COM-A"), None);
        assert_eq!(f.sink.errors().len(), 1);
        assert!(f.sink.connection_changes("COM-A").is_empty());
    }

    #[test]
    fn test_rejected_parameters_release_the_port() {
        let f = Fixture::new(true);
        f.host.reject_baud_rate(12345);

        let err = f
            .manager
            .open(
                "COM-A",
                &DeviceSelector::Any,
                LineParameters::default().with_baud_rate(12345),
            )
            .unwrap_err();

        assert!(matches!(err, SerialError::ParameterRejected(_)));
        assert!(f.port().is_closed());
        assert_eq!(f.manager.port_state("COM-A"), None);
        assert_eq!(f.sink.errors().len(), 1);
    }

    #[test]
    fn test_invalid_parameters_on_taken_name_leave_it_undisturbed() {
        let f = Fixture::new(true);
        f.open("COM-A").unwrap();

        let err = f
            .manager
            .open(
                "COM-A",
                &DeviceSelector::Any,
                LineParameters::default().with_baud_rate(0),
            )
            .unwrap_err();

        assert_eq!(err, SerialError::AlreadyOpen("COM-A".into()));
        assert!(f.sink.errors().is_empty());
        assert_eq!(f.sink.connection_changes("COM-A"), vec![true]);
        assert!(f.manager.is_open("COM-A"));

        f.manager.shutdown();
    }
}

mod io {
    use super::*;

    #[test]
    fn test_writes_reach_transport_in_order() {
        let f = Fixture::with_config(true, Fixture::polling());
        f.open("COM-A").unwrap();

        let chunks: Vec<Vec<u8>> = (0u8..20).map(|i| vec![i; (i as usize % 7) + 1]).collect();
        for chunk in &chunks {
            f.manager.write("COM-A", chunk, None).unwrap();
        }

        let expected = chunks.concat();
        assert!(f.port().wait_for_written(expected.len(), DEFAULT_TEST_TIMEOUT));
        f.manager.close("COM-A").unwrap();

        assert_eq!(f.port().written_bytes(), expected);
    }

    #[test]
    fn test_writes_in_one_drain_are_coalesced() {
        let f = Fixture::new(true);
        f.open("COM-A").unwrap();

        // The worker is parked in a blocking read until data arrives
        f.manager.write("COM-A", b"hello", None).unwrap();
        f.manager.write("COM-A", b"abc", None).unwrap();
        f.port().push_read(b"\r\n");

        assert!(f.port().wait_for_written(8, DEFAULT_TEST_TIMEOUT));
        assert_eq!(f.port().writes(), vec![b"helloabc".to_vec()]);

        f.manager.close("COM-A").unwrap();
    }

    #[test]
    fn test_received_data_is_delivered() {
        let f = Fixture::new(true);
        f.open("COM-A").unwrap();

        f.port().push_read(b"OK\r\n");
        assert!(f.sink.wait_for(DEFAULT_TEST_TIMEOUT, |events| {
            events
                .iter()
                .any(|e| matches!(e, SerialEvent::DataReceived { .. }))
        }));
        assert_eq!(f.sink.received("COM-A"), b"OK\r\n".to_vec());

        f.manager.close("COM-A").unwrap();
    }

    #[test]
    fn test_write_to_absent_port_fails() {
        let f = Fixture::new(true);
        assert_eq!(
            f.manager.write("COM-A", b"x", None),
            Err(SerialError::PortNotFound("COM-A".into()))
        );
    }

    #[test]
    fn test_oversized_write_is_refused() {
        let config = ManagerConfig {
            worker: WorkerSettings {
                write_buffer_size: 4,
                ..WorkerSettings::default()
            },
            ..ManagerConfig::default()
        };
        let f = Fixture::with_config(true, config);
        f.open("COM-A").unwrap();

        assert!(matches!(
            f.manager.write("COM-A", b"too long", Some(Duration::from_millis(10))),
            Err(SerialError::WriteBufferFull { capacity: 4, .. })
        ));

        f.manager.close("COM-A").unwrap();
    }
}

mod parameters {
    use super::*;

    #[test]
    fn test_set_parameters_on_open_port() {
        let f = Fixture::new(true);
        f.open("COM-A").unwrap();
        let params = LineParameters::default().with_baud_rate(9600);

        f.manager.set_parameters("COM-A", params).unwrap();
        assert_eq!(f.port().parameters(), Some(params));
        assert_eq!(f.manager.port_info("COM-A").unwrap().parameters, params);
        assert_eq!(f.host.open_count(), 1);

        f.manager.close("COM-A").unwrap();
    }

    #[test]
    fn test_rejected_parameters_keep_port_open() {
        let f = Fixture::new(true);
        f.host.reject_baud_rate(12345);
        f.open("COM-A").unwrap();
        let before = f.manager.port_info("COM-A").unwrap().parameters;

        assert!(matches!(
            f.manager
                .set_parameters("COM-A", LineParameters::default().with_baud_rate(12345)),
            Err(SerialError::ParameterRejected(_))
        ));
        assert!(matches!(
            f.manager
                .set_parameters("COM-A", LineParameters::default().with_baud_rate(0)),
            Err(SerialError::ParameterRejected(_))
        ));
        assert!(f.manager.is_open("COM-A"));
        assert_eq!(f.manager.port_info("COM-A").unwrap().parameters, before);

        f.manager.close("COM-A").unwrap();
    }

    #[test]
    fn test_set_parameters_on_absent_port() {
        let f = Fixture::new(true);
        assert_eq!(
            f.manager.set_parameters("COM-A", LineParameters::default()),
            Err(SerialError::PortNotFound("COM-A".into()))
        );
    }
}

mod close {
    use super::*;

    #[test]
    fn test_close_absent_port_is_silent() {
        let f = Fixture::new(true);
        assert_eq!(
            f.manager.close("COM-A"),
            Err(SerialError::PortNotFound("COM-A".into()))
        );
        assert!(f.sink.events().is_empty());
    }

    #[test]
    fn test_close_releases_port_and_reports() {
        let f = Fixture::new(true);
        f.open("COM-A").unwrap();

        f.manager.close("COM-A").unwrap();
        assert!(f.port().is_closed());
        assert_eq!(f.sink.connection_changes("COM-A"), vec![true, false]);
        assert!(f.sink.errors().is_empty());
        assert!(!f.manager.is_open("COM-A"));

        // The name is free for reuse
        f.open("COM-A").unwrap();
        assert_eq!(f.host.open_count(), 2);
        f.manager.close("COM-A").unwrap();
    }

    #[test]
    fn test_read_error_tears_down_once() {
        let f = Fixture::new(true);
        f.open("COM-A").unwrap();

        f.port()
            .push_read_error(TransportError::Io("pipe error".into()));
        assert!(f.sink.wait_for(DEFAULT_TEST_TIMEOUT, |events| {
            events.iter().any(|e| {
                matches!(e, SerialEvent::ConnectedStateChanged { connected: false, .. })
            })
        }));

        assert_eq!(f.sink.errors().len(), 1);
        assert_eq!(f.sink.connection_changes("COM-A"), vec![true, false]);
        assert!(f.port().is_closed());
        assert_eq!(
            f.manager.close("COM-A"),
            Err(SerialError::PortNotFound("COM-A".into()))
        );
    }

    #[test]
    fn test_write_error_tears_down() {
        let f = Fixture::with_config(true, Fixture::polling());
        f.open("COM-A").unwrap();
        f.port().fail_writes(TransportError::Timeout);

        f.manager.write("COM-A", b"AT\r", None).unwrap();
        assert!(f.sink.wait_for(DEFAULT_TEST_TIMEOUT, |events| {
            events.iter().any(|e| e.is_error())
        }));
        // The handle is gone before the error is reported
        assert!(!f.manager.is_open("COM-A"));
    }
}

mod hotplug {
    use super::*;

    #[test]
    fn test_detach_tears_down_open_ports() {
        let f = Fixture::new(true);
        f.open("COM-A").unwrap();

        f.manager.device_detached(DEVICE_PATH);

        assert!(!f.manager.is_open("COM-A"));
        assert_eq!(f.sink.connection_changes("COM-A"), vec![true, false]);
        assert_eq!(f.sink.errors().len(), 1);
        assert!(
            f.sink
                .events()
                .contains(&SerialEvent::DeviceAttached(false))
        );
    }

    #[test]
    fn test_detach_drops_pending_open() {
        let f = Fixture::new(false);
        f.open("COM-A").unwrap();

        f.manager.device_detached(DEVICE_PATH);
        assert_eq!(f.manager.port_state("COM-A"), None);

        f.host.resolve_permission(DEVICE_PATH, true);
        assert_eq!(f.host.open_count(), 0);
        assert_eq!(f.sink.events(), vec![SerialEvent::DeviceAttached(false)]);
    }

    #[test]
    fn test_attach_requests_permission_when_enabled() {
        let config = ManagerConfig {
            auto_request_permission: true,
            ..ManagerConfig::default()
        };
        let f = Fixture::with_config(true, config);
        let raw = mock_ch340(9);
        f.host.add_device(raw.clone(), None, false);

        f.manager.device_attached(raw.clone());
        f.manager.device_attached(raw);

        assert_eq!(f.host.permission_request_count(), 1);
        assert_eq!(
            f.sink.events(),
            vec![
                SerialEvent::DeviceAttached(true),
                SerialEvent::DeviceAttached(true)
            ]
        );
    }

    #[test]
    fn test_attach_without_auto_permission() {
        let f = Fixture::new(true);
        let raw = mock_ch340(9);
        f.host.add_device(raw.clone(), None, false);

        f.manager.device_attached(raw);
        assert_eq!(f.host.permission_request_count(), 0);
    }
}

mod reentrancy {
    use super::*;
    use common::EventSink;
    use std::sync::Mutex;
    use std::sync::mpsc;

    /// What the consumer does when told a port connected
    #[derive(Clone, Copy)]
    enum OnConnected {
        Query,
        Close,
    }

    /// Sink that calls back into the manager from inside `emit`
    struct CallbackSink {
        manager: Mutex<Option<ConnectionManager>>,
        action: OnConnected,
        seen_open: Mutex<Vec<bool>>,
        recorder: RecordingSink,
    }

    impl EventSink for CallbackSink {
        fn emit(&self, event: SerialEvent) {
            if let SerialEvent::ConnectedStateChanged {
                port,
                connected: true,
            } = &event
            {
                let manager = self.manager.lock().unwrap().clone();
                if let Some(manager) = manager {
                    match self.action {
                        OnConnected::Query => {
                            self.seen_open.lock().unwrap().push(manager.is_open(port));
                            assert!(manager.port_info(port).is_some());
                            manager.write(port, b"hi", None).unwrap();
                        }
                        OnConnected::Close => manager.close(port).unwrap(),
                    }
                }
            }
            self.recorder.emit(event);
        }
    }

    fn setup(action: OnConnected) -> (Arc<MockHost>, Arc<CallbackSink>, ConnectionManager) {
        let host = Arc::new(MockHost::new());
        host.add_device(mock_ch340(4), Some(DriverKind::Ch34x), true);
        let sink = Arc::new(CallbackSink {
            manager: Mutex::new(None),
            action,
            seen_open: Mutex::new(Vec::new()),
            recorder: RecordingSink::new(),
        });
        let manager = ConnectionManager::with_config(
            host.clone(),
            DriverOverrides::new(),
            sink.clone(),
            Fixture::polling(),
        );
        *sink.manager.lock().unwrap() = Some(manager.clone());
        (host, sink, manager)
    }

    /// Open on a helper thread so a hang fails the test instead of stalling it
    fn open_within_timeout(manager: &ConnectionManager) -> Result<OpenOutcome, SerialError> {
        let (tx, rx) = mpsc::channel();
        let manager = manager.clone();
        std::thread::spawn(move || {
            let _ = tx.send(manager.open("COM-A", &DeviceSelector::Any, LineParameters::default()));
        });
        rx.recv_timeout(DEFAULT_TEST_TIMEOUT)
            .expect("open did not return")
    }

    #[test]
    fn test_consumer_may_query_manager_from_connected_event() {
        let (host, sink, manager) = setup(OnConnected::Query);

        assert_eq!(open_within_timeout(&manager).unwrap(), OpenOutcome::Connected);
        assert_eq!(*sink.seen_open.lock().unwrap(), vec![true]);

        // The write queued from inside the event goes out once the worker runs
        let port = host.port(DEVICE_PATH).unwrap();
        assert!(port.wait_for_written(2, DEFAULT_TEST_TIMEOUT));
        assert_eq!(port.written_bytes(), b"hi".to_vec());

        manager.shutdown();
        assert_eq!(sink.recorder.connection_changes("COM-A"), vec![true, false]);
        *sink.manager.lock().unwrap() = None;
    }

    #[test]
    fn test_consumer_may_close_from_connected_event() {
        let (host, sink, manager) = setup(OnConnected::Close);

        assert_eq!(open_within_timeout(&manager).unwrap(), OpenOutcome::Connected);

        assert_eq!(manager.port_state("COM-A"), None);
        assert!(host.port(DEVICE_PATH).unwrap().is_closed());
        assert_eq!(sink.recorder.connection_changes("COM-A"), vec![true, false]);
        assert!(sink.recorder.errors().is_empty());
        *sink.manager.lock().unwrap() = None;
    }
}
