//! Per-connection I/O worker
//!
//! One dedicated thread per open port. Each iteration performs one read
//! (blocking up to the read timeout) and then drains the pending-write
//! buffer with a single transport write. Reads and writes share the thread
//! so queued writes reach the transport in enqueue order without a second
//! lock-contending thread per port.
//!
//! With the default infinite read timeout a queued write waits until the
//! current read returns. Configure a finite read timeout when writes must
//! go out while the device is silent.
//!
//! `stop()` is cooperative and only takes effect at the next iteration.
//! Closing the port is what interrupts a blocked read; an error raised
//! while the worker is already stopping is treated as a normal shutdown.

use crate::error::{SerialError, WorkerStateError};
use common::sync::{lock, wait_until};
use common::{SerialPort, TransportError, hex_preview};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thread_priority::ThreadPriority as OsPriority;
use tracing::{debug, error, info, trace, warn};

/// Default capacity of the pending-write buffer
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 4096;

/// Bytes shown in trace-level data previews
const PREVIEW_BYTES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Running,
    Stopping,
}

/// Scheduling class requested for the worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadPriority {
    Default,
    /// Above interactive work, to keep up with the device under load
    #[default]
    Elevated,
}

/// Receiver of worker output
pub trait WorkerListener: Send + Sync {
    /// Called with a copy of every positive-length read
    fn on_new_data(&self, data: Vec<u8>);

    /// Called once when the loop ends because of a transport error
    fn on_run_error(&self, error: &TransportError);
}

/// Initial worker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// `None` blocks until data arrives
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// `None` sizes the read buffer to the port's max packet size
    pub read_buffer_size: Option<usize>,
    pub write_buffer_size: usize,
    pub priority: ThreadPriority,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            read_timeout: None,
            write_timeout: None,
            read_buffer_size: None,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            priority: ThreadPriority::default(),
        }
    }
}

/// Values read once into the loop's working state at start
#[derive(Debug, Clone, Copy)]
struct LoopConfig {
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    priority: ThreadPriority,
}

struct WriteBuffer {
    data: Vec<u8>,
    capacity: usize,
}

struct Shared {
    name: String,
    port: Arc<dyn SerialPort>,
    state: Mutex<WorkerState>,
    state_cond: Condvar,
    listener: Mutex<Option<Arc<dyn WorkerListener>>>,
    config: Mutex<LoopConfig>,
    read_buffer: Mutex<Vec<u8>>,
    write_buffer: Mutex<WriteBuffer>,
    write_cond: Condvar,
}

/// Background reader/writer servicing one open port
pub struct IoWorker {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl IoWorker {
    /// Create a stopped worker with default settings
    pub fn new(name: impl Into<String>, port: Arc<dyn SerialPort>) -> Self {
        Self::with_settings(name, port, &WorkerSettings::default())
    }

    pub fn with_settings(
        name: impl Into<String>,
        port: Arc<dyn SerialPort>,
        settings: &WorkerSettings,
    ) -> Self {
        let read_size = settings
            .read_buffer_size
            .unwrap_or_else(|| port.max_packet_size())
            .max(1);

        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                port,
                state: Mutex::new(WorkerState::Stopped),
                state_cond: Condvar::new(),
                listener: Mutex::new(None),
                config: Mutex::new(LoopConfig {
                    read_timeout: settings.read_timeout,
                    write_timeout: settings.write_timeout,
                    priority: settings.priority,
                }),
                read_buffer: Mutex::new(vec![0; read_size]),
                write_buffer: Mutex::new(WriteBuffer {
                    data: Vec::with_capacity(settings.write_buffer_size),
                    capacity: settings.write_buffer_size.max(1),
                }),
                write_cond: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn set_listener(&self, listener: Arc<dyn WorkerListener>) {
        *lock(&self.shared.listener) = Some(listener);
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    fn require_stopped(&self, what: &'static str) -> Result<(), WorkerStateError> {
        if self.state() != WorkerState::Stopped {
            error!("{}: {} changed while worker is running", self.shared.name, what);
            return Err(WorkerStateError::NotStopped(what));
        }
        Ok(())
    }

    pub fn set_thread_priority(&self, priority: ThreadPriority) -> Result<(), WorkerStateError> {
        self.require_stopped("thread priority")?;
        lock(&self.shared.config).priority = priority;
        Ok(())
    }

    pub fn thread_priority(&self) -> ThreadPriority {
        lock(&self.shared.config).priority
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), WorkerStateError> {
        self.require_stopped("read timeout")?;
        lock(&self.shared.config).read_timeout = timeout;
        Ok(())
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        lock(&self.shared.config).read_timeout
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<(), WorkerStateError> {
        self.require_stopped("write timeout")?;
        lock(&self.shared.config).write_timeout = timeout;
        Ok(())
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        lock(&self.shared.config).write_timeout
    }

    pub fn set_read_buffer_size(&self, size: usize) -> Result<(), WorkerStateError> {
        self.require_stopped("read buffer size")?;
        if size == 0 {
            return Err(WorkerStateError::BufferTooSmall {
                requested: 0,
                pending: 0,
            });
        }
        let mut buffer = lock(&self.shared.read_buffer);
        if buffer.len() != size {
            *buffer = vec![0; size];
        }
        Ok(())
    }

    pub fn read_buffer_size(&self) -> usize {
        lock(&self.shared.read_buffer).len()
    }

    /// Resize the pending-write buffer, keeping queued bytes
    pub fn set_write_buffer_size(&self, size: usize) -> Result<(), WorkerStateError> {
        self.require_stopped("write buffer size")?;
        let mut buffer = lock(&self.shared.write_buffer);
        if size == 0 || size < buffer.data.len() {
            return Err(WorkerStateError::BufferTooSmall {
                requested: size,
                pending: buffer.data.len(),
            });
        }
        buffer.capacity = size;
        Ok(())
    }

    pub fn write_buffer_size(&self) -> usize {
        lock(&self.shared.write_buffer).capacity
    }

    /// Bytes queued but not yet handed to the transport
    pub fn pending_write_len(&self) -> usize {
        lock(&self.shared.write_buffer).data.len()
    }

    /// Queue bytes for the next drain; fails at once if they do not fit
    pub fn write_async(&self, data: &[u8]) -> Result<(), SerialError> {
        self.write_async_timeout(data, None)
    }

    /// Queue bytes, waiting up to `timeout` for the worker to free space
    ///
    /// Bytes from concurrent callers are appended atomically, so each call's
    /// bytes stay contiguous and calls reach the transport in queue order.
    pub fn write_async_timeout(
        &self,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<(), SerialError> {
        let shared = &self.shared;
        let buffer = lock(&shared.write_buffer);
        let full = |b: &WriteBuffer| SerialError::WriteBufferFull {
            pending: b.data.len(),
            requested: data.len(),
            capacity: b.capacity,
        };

        if data.len() > buffer.capacity {
            return Err(full(&*buffer));
        }

        let fits = |b: &mut WriteBuffer| b.data.len() + data.len() <= b.capacity;
        let (mut buffer, ok) = match timeout {
            Some(t) => wait_until(&shared.write_cond, buffer, t, fits),
            None => {
                let mut buffer = buffer;
                let ok = fits(&mut *buffer);
                (buffer, ok)
            }
        };
        if !ok {
            return Err(full(&*buffer));
        }

        buffer.data.extend_from_slice(data);
        trace!(
            "{}: queued {} bytes ({} pending)",
            shared.name,
            data.len(),
            buffer.data.len()
        );
        Ok(())
    }

    /// Start the worker thread
    ///
    /// The state is Running when this returns.
    pub fn start(&self) -> Result<(), WorkerStateError> {
        {
            let mut state = lock(&self.shared.state);
            if *state != WorkerState::Stopped {
                error!("{}: start requested in state {:?}", self.shared.name, *state);
                return Err(WorkerStateError::AlreadyStarted);
            }
            *state = WorkerState::Running;
        }

        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name(format!("serial-io-{}", self.shared.name))
            .spawn(move || run(shared));

        match spawned {
            Ok(handle) => {
                *lock(&self.thread) = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!("{}: failed to spawn worker thread: {}", self.shared.name, e);
                self.shared.set_state(WorkerState::Stopped);
                Err(WorkerStateError::SpawnFailed)
            }
        }
    }

    /// Request termination at the next iteration boundary
    pub fn stop(&self) {
        let mut state = lock(&self.shared.state);
        if *state == WorkerState::Running {
            info!("{}: stop requested", self.shared.name);
            *state = WorkerState::Stopping;
            self.shared.state_cond.notify_all();
        }
    }

    /// Wait until the worker reaches Stopped; `None` waits without limit
    pub fn wait_stopped(&self, timeout: Option<Duration>) -> bool {
        let state = lock(&self.shared.state);
        match timeout {
            Some(t) => {
                wait_until(&self.shared.state_cond, state, t, |s| {
                    *s == WorkerState::Stopped
                })
                .1
            }
            None => {
                let _state = self
                    .shared
                    .state_cond
                    .wait_while(state, |s| *s != WorkerState::Stopped)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                true
            }
        }
    }

    /// Join the worker thread unless called from the worker thread itself
    pub fn join(&self) {
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                debug!("{}: join skipped on worker thread", self.shared.name);
                return;
            }
            if handle.join().is_err() {
                error!("{}: worker thread panicked", self.shared.name);
            }
        }
    }
}

impl Shared {
    fn state(&self) -> WorkerState {
        *lock(&self.state)
    }

    fn set_state(&self, new: WorkerState) {
        *lock(&self.state) = new;
        self.state_cond.notify_all();
    }

    fn listener(&self) -> Option<Arc<dyn WorkerListener>> {
        lock(&self.listener).clone()
    }

    /// One read followed by one write drain
    fn step(&self, config: &LoopConfig) -> Result<(), TransportError> {
        // Handle incoming data. The buffer shape is fixed while running.
        let received = {
            let mut buffer = lock(&self.read_buffer);
            let len = self.port.read(&mut buffer, config.read_timeout)?;
            if len > buffer.len() {
                warn!(
                    "{}: read reported {} bytes for a {}-byte buffer, ignoring",
                    self.name,
                    len,
                    buffer.len()
                );
                None
            } else if len > 0 {
                Some(buffer[..len].to_vec())
            } else {
                None
            }
        };

        match received {
            Some(data) => {
                trace!(
                    "{}: read {} bytes: {}",
                    self.name,
                    data.len(),
                    hex_preview(&data, PREVIEW_BYTES)
                );
                match self.listener() {
                    Some(listener) => listener.on_new_data(data),
                    None => warn!("{}: no listener, dropping {} bytes", self.name, data.len()),
                }
            }
            None => trace!("{}: no data available", self.name),
        }

        // Handle outgoing data. Producers never wait behind the transport write.
        let outgoing = {
            let mut buffer = lock(&self.write_buffer);
            if buffer.data.is_empty() {
                None
            } else {
                Some(buffer.data.drain(..).collect::<Vec<u8>>())
            }
        };

        if let Some(data) = outgoing {
            self.write_cond.notify_all();
            debug!("{}: writing {} bytes", self.name, data.len());
            self.port.write(&data, config.write_timeout)?;
        }

        Ok(())
    }
}

/// Marks the worker Stopped however the loop ends, including unwinding
struct StoppedOnExit(Arc<Shared>);

impl Drop for StoppedOnExit {
    fn drop(&mut self) {
        self.0.set_state(WorkerState::Stopped);
        info!("{}: stopped", self.0.name);
    }
}

/// Apply `priority` to the calling thread
fn apply_thread_priority(priority: ThreadPriority) -> Result<(), thread_priority::Error> {
    match priority {
        ThreadPriority::Default => Ok(()),
        ThreadPriority::Elevated => thread_priority::set_current_thread_priority(OsPriority::Max),
    }
}

fn run(shared: Arc<Shared>) {
    let _guard = StoppedOnExit(Arc::clone(&shared));
    let config = *lock(&shared.config);
    if let Err(e) = apply_thread_priority(config.priority) {
        warn!(
            "{}: could not raise thread priority, running at default: {:?}",
            shared.name, e
        );
    }
    info!(
        "{}: running (read timeout {:?}, write timeout {:?}, priority {:?})",
        shared.name, config.read_timeout, config.write_timeout, config.priority
    );
    let started = Instant::now();

    let outcome = loop {
        let state = shared.state();
        if state != WorkerState::Running {
            info!("{}: stopping, state={:?}", shared.name, state);
            break Ok(());
        }
        if let Err(e) = shared.step(&config) {
            break Err(e);
        }
    };

    if let Err(e) = outcome {
        if shared.state() == WorkerState::Stopping {
            debug!("{}: transport interrupted during shutdown: {}", shared.name, e);
        } else {
            warn!(
                "{}: run ending due to error after {:?}: {}",
                shared.name,
                started.elapsed(),
                e
            );
            if let Some(listener) = shared.listener() {
                listener.on_run_error(&e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::DriverKind;
    use common::DeviceHost;
    use common::test_utils::{
        DEFAULT_TEST_TIMEOUT, MOCK_MAX_PACKET_SIZE, MockHost, MockPort, mock_ch340,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingListener {
        data: Mutex<Vec<u8>>,
        errors: Mutex<Vec<TransportError>>,
        calls: AtomicUsize,
    }

    impl WorkerListener for CountingListener {
        fn on_new_data(&self, data: Vec<u8>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            lock(&self.data).extend_from_slice(&data);
        }

        fn on_run_error(&self, error: &TransportError) {
            lock(&self.errors).push(error.clone());
        }
    }

    fn open_mock() -> (Arc<dyn SerialPort>, Arc<MockPort>) {
        let host = MockHost::new();
        let raw = mock_ch340(7);
        host.add_device(raw.clone(), Some(DriverKind::Ch34x), true);
        let port = host
            .open_connection(&raw, DriverKind::Ch34x)
            .unwrap()
            .open_port()
            .unwrap();
        let mock = host.port(&raw.path).unwrap();
        (port, mock)
    }

    #[test]
    fn test_read_buffer_defaults_to_max_packet_size() {
        let (port, _mock) = open_mock();
        let worker = IoWorker::new("usb0", port);
        assert_eq!(worker.read_buffer_size(), MOCK_MAX_PACKET_SIZE);
        assert_eq!(worker.write_buffer_size(), DEFAULT_WRITE_BUFFER_SIZE);
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let (port, mock) = open_mock();
        let worker = IoWorker::new("usb0", port);
        worker.start().unwrap();
        assert_eq!(worker.state(), WorkerState::Running);
        assert_eq!(worker.start(), Err(WorkerStateError::AlreadyStarted));

        worker.stop();
        mock.close().unwrap();
        assert!(worker.wait_stopped(Some(DEFAULT_TEST_TIMEOUT)));
        worker.join();
    }

    #[test]
    fn test_configuration_requires_stopped() {
        let (port, mock) = open_mock();
        let worker = IoWorker::new("usb0", port);
        worker.start().unwrap();

        assert!(worker.set_read_buffer_size(128).is_err());
        assert!(worker.set_write_buffer_size(128).is_err());
        assert!(worker.set_read_timeout(Some(Duration::from_millis(5))).is_err());
        assert!(worker.set_write_timeout(None).is_err());
        assert!(worker.set_thread_priority(ThreadPriority::Default).is_err());

        worker.stop();
        mock.close().unwrap();
        worker.join();
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(worker.set_read_buffer_size(128).is_ok());
        assert_eq!(worker.read_buffer_size(), 128);
    }

    #[test]
    fn test_write_buffer_resize_keeps_pending_bytes() {
        let (port, _mock) = open_mock();
        let worker = IoWorker::new("usb0", port);
        worker.write_async(b"abcdef").unwrap();

        assert_eq!(
            worker.set_write_buffer_size(4),
            Err(WorkerStateError::BufferTooSmall {
                requested: 4,
                pending: 6
            })
        );
        worker.set_write_buffer_size(8).unwrap();
        assert_eq!(worker.pending_write_len(), 6);
        assert!(matches!(
            worker.write_async(b"xyz"),
            Err(SerialError::WriteBufferFull { .. })
        ));
        worker.write_async(b"xy").unwrap();
        assert_eq!(worker.pending_write_len(), 8);
    }

    #[test]
    fn test_delivers_reads_and_coalesces_writes() {
        let (port, mock) = open_mock();
        let worker = IoWorker::new("usb0", port);
        let listener = Arc::new(CountingListener::default());
        worker.set_listener(listener.clone());
        worker.start().unwrap();

        // The loop is blocked in an infinite read; both writes land in one drain
        worker.write_async(b"hello").unwrap();
        worker.write_async(b"abc").unwrap();
        mock.push_read(b"ping");

        assert!(mock.wait_for_written(8, DEFAULT_TEST_TIMEOUT));
        assert_eq!(mock.writes(), vec![b"helloabc".to_vec()]);
        assert_eq!(lock(&listener.data).as_slice(), b"ping");

        worker.stop();
        mock.close().unwrap();
        worker.join();
        assert!(lock(&listener.errors).is_empty());
    }

    #[test]
    fn test_finite_read_timeout_drains_without_reads() {
        let (port, mock) = open_mock();
        let worker = IoWorker::new("usb0", port);
        worker
            .set_read_timeout(Some(Duration::from_millis(5)))
            .unwrap();
        worker.start().unwrap();

        worker.write_async(b"tick").unwrap();
        assert!(mock.wait_for_written(4, DEFAULT_TEST_TIMEOUT));

        worker.stop();
        assert!(worker.wait_stopped(Some(DEFAULT_TEST_TIMEOUT)));
        worker.join();
        assert!(!mock.is_closed());
    }

    #[test]
    fn test_read_error_reported_once() {
        let (port, mock) = open_mock();
        let worker = IoWorker::new("usb0", port);
        let listener = Arc::new(CountingListener::default());
        worker.set_listener(listener.clone());
        worker.start().unwrap();

        mock.push_read_error(TransportError::Io("babble".into()));
        assert!(worker.wait_stopped(Some(DEFAULT_TEST_TIMEOUT)));
        worker.join();

        assert_eq!(
            lock(&listener.errors).as_slice(),
            &[TransportError::Io("babble".into())]
        );
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_close_during_stop_is_not_reported() {
        let (port, mock) = open_mock();
        let worker = IoWorker::new("usb0", port);
        let listener = Arc::new(CountingListener::default());
        worker.set_listener(listener.clone());
        worker.start().unwrap();

        worker.stop();
        assert_eq!(worker.state(), WorkerState::Stopping);
        mock.close().unwrap();
        assert!(worker.wait_stopped(Some(DEFAULT_TEST_TIMEOUT)));
        worker.join();

        assert!(lock(&listener.errors).is_empty());
    }

    #[test]
    fn test_default_priority_leaves_thread_alone() {
        assert!(apply_thread_priority(ThreadPriority::Default).is_ok());
    }

    #[test]
    fn test_elevated_priority_is_best_effort() {
        // Unprivileged processes may be refused; the worker runs either way
        let _ = std::thread::spawn(|| apply_thread_priority(ThreadPriority::Elevated))
            .join()
            .unwrap();

        let (port, mock) = open_mock();
        let worker = IoWorker::with_settings(
            "usb0",
            port,
            &WorkerSettings {
                read_timeout: Some(Duration::from_millis(5)),
                priority: ThreadPriority::Elevated,
                ..WorkerSettings::default()
            },
        );
        worker.start().unwrap();
        worker.write_async(b"go").unwrap();
        assert!(mock.wait_for_written(2, DEFAULT_TEST_TIMEOUT));
        assert_eq!(worker.state(), WorkerState::Running);

        worker.stop();
        worker.join();
    }

    #[test]
    fn test_write_timeout_waits_for_drain() {
        let (port, mock) = open_mock();
        let worker = IoWorker::with_settings(
            "usb0",
            port,
            &WorkerSettings {
                read_timeout: Some(Duration::from_millis(5)),
                write_buffer_size: 4,
                ..WorkerSettings::default()
            },
        );
        worker.write_async(b"abcd").unwrap();
        assert!(worker.write_async(b"ef").is_err());

        worker.start().unwrap();
        worker
            .write_async_timeout(b"ef", Some(DEFAULT_TEST_TIMEOUT))
            .unwrap();
        assert!(mock.wait_for_written(6, DEFAULT_TEST_TIMEOUT));
        assert_eq!(mock.written_bytes(), b"abcdef".to_vec());

        worker.stop();
        worker.join();
    }
}
