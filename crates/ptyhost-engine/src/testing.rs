//! Scripted in-memory pty backend for deterministic engine tests.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use ptyhost_native::{
    ExitWaiter, ProcessControl, PtyBackend, PtyDevice, PtyError, SpawnRequest, SpawnedPty,
};

/// Command name the fake backend refuses to spawn.
pub(crate) const MISSING_COMMAND: &str = "no-such-command";

/// Exit code the fake reports for a terminated process.
pub(crate) const KILLED_EXIT_CODE: i32 = 137;

enum Chunk {
    Bytes(Vec<u8>),
    Fail(io::ErrorKind),
    Eof,
}

#[derive(Default)]
struct Shared {
    written: Mutex<Vec<u8>>,
    sizes: Mutex<Vec<(u16, u16)>>,
    close_requests: AtomicUsize,
    terminations: AtomicUsize,
    device_released: AtomicBool,
    reject_resize: AtomicBool,
    reject_close: AtomicBool,
    kill_unconfirmed: AtomicBool,
    fail_next_terminate: AtomicBool,
}

/// Test-side controller of one fake pty. Clones share the same pty.
#[derive(Clone)]
pub(crate) struct FakePty {
    shared: Arc<Shared>,
    output_tx: Sender<Chunk>,
    exit_tx: Sender<Result<i32, String>>,
    output_rx: Arc<Mutex<Option<Receiver<Chunk>>>>,
    exit_rx: Arc<Mutex<Option<Receiver<Result<i32, String>>>>>,
}

impl FakePty {
    pub(crate) fn new() -> Self {
        let (output_tx, output_rx) = mpsc::channel();
        let (exit_tx, exit_rx) = mpsc::channel();
        Self {
            shared: Arc::new(Shared::default()),
            output_tx,
            exit_tx,
            output_rx: Arc::new(Mutex::new(Some(output_rx))),
            exit_rx: Arc::new(Mutex::new(Some(exit_rx))),
        }
    }

    pub(crate) fn device(&self) -> Box<dyn PtyDevice> {
        Box::new(FakeDevice {
            shared: Arc::clone(&self.shared),
        })
    }

    pub(crate) fn process(&self) -> Box<dyn ProcessControl> {
        Box::new(FakeProcess {
            shared: Arc::clone(&self.shared),
            output_tx: self.output_tx.clone(),
            exit_tx: self.exit_tx.clone(),
        })
    }

    pub(crate) fn waiter(&self) -> Box<dyn ExitWaiter> {
        let rx = self.exit_rx.lock().unwrap().take().expect("waiter already taken");
        Box::new(FakeWaiter { rx })
    }

    pub(crate) fn output(&self) -> Box<dyn Read + Send> {
        let rx = self.output_rx.lock().unwrap().take().expect("output already taken");
        Box::new(FakeOutput {
            rx,
            pending: Vec::new(),
        })
    }

    /// Child prints `bytes`.
    pub(crate) fn emit(&self, bytes: &[u8]) {
        let _ = self.output_tx.send(Chunk::Bytes(bytes.to_vec()));
    }

    /// The next read fails with `kind`.
    pub(crate) fn fail_read(&self, kind: io::ErrorKind) {
        let _ = self.output_tx.send(Chunk::Fail(kind));
    }

    /// Child exits on its own: output ends, then the status is available.
    pub(crate) fn exit(&self, code: i32) {
        let _ = self.output_tx.send(Chunk::Eof);
        let _ = self.exit_tx.send(Ok(code));
    }

    /// Output ends but the OS cannot report a status.
    pub(crate) fn vanish(&self) {
        let _ = self.output_tx.send(Chunk::Eof);
        let _ = self.exit_tx.send(Err("status lost".to_string()));
    }

    pub(crate) fn reject_resize(&self) {
        self.shared.reject_resize.store(true, Ordering::SeqCst);
    }

    pub(crate) fn reject_close(&self) {
        self.shared.reject_close.store(true, Ordering::SeqCst);
    }

    /// Terminating the process will not yield a confirmed status.
    pub(crate) fn kill_unconfirmed(&self) {
        self.shared.kill_unconfirmed.store(true, Ordering::SeqCst);
    }

    /// The next terminate attempt fails and leaves the process running.
    pub(crate) fn fail_next_terminate(&self) {
        self.shared.fail_next_terminate.store(true, Ordering::SeqCst);
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.shared.written.lock().unwrap().clone()
    }

    pub(crate) fn sizes(&self) -> Vec<(u16, u16)> {
        self.shared.sizes.lock().unwrap().clone()
    }

    pub(crate) fn close_requests(&self) -> usize {
        self.shared.close_requests.load(Ordering::SeqCst)
    }

    pub(crate) fn terminations(&self) -> usize {
        self.shared.terminations.load(Ordering::SeqCst)
    }

    pub(crate) fn device_released(&self) -> bool {
        self.shared.device_released.load(Ordering::SeqCst)
    }
}

struct FakeDevice {
    shared: Arc<Shared>,
}

impl PtyDevice for FakeDevice {
    fn write_input(&mut self, data: &[u8]) -> Result<(), PtyError> {
        self.shared.written.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn set_size(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        if self.shared.reject_resize.load(Ordering::SeqCst) {
            return Err(PtyError::ResizeFailed(format!("{cols}x{rows} rejected")));
        }
        self.shared.sizes.lock().unwrap().push((cols, rows));
        Ok(())
    }

    fn request_graceful_close(&mut self) -> Result<(), PtyError> {
        if self.shared.reject_close.load(Ordering::SeqCst) {
            return Err(PtyError::IoError(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "input closed",
            )));
        }
        self.shared.close_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.shared.device_released.store(true, Ordering::SeqCst);
    }
}

struct FakeProcess {
    shared: Arc<Shared>,
    output_tx: Sender<Chunk>,
    exit_tx: Sender<Result<i32, String>>,
}

impl ProcessControl for FakeProcess {
    fn terminate(&mut self) -> Result<(), PtyError> {
        if self.shared.fail_next_terminate.swap(false, Ordering::SeqCst) {
            return Err(PtyError::IoError(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "operation not permitted",
            )));
        }
        self.shared.terminations.fetch_add(1, Ordering::SeqCst);
        let _ = self.output_tx.send(Chunk::Eof);
        let status = if self.shared.kill_unconfirmed.load(Ordering::SeqCst) {
            Err("killed without status".to_string())
        } else {
            Ok(KILLED_EXIT_CODE)
        };
        let _ = self.exit_tx.send(status);
        Ok(())
    }
}

struct FakeWaiter {
    rx: Receiver<Result<i32, String>>,
}

impl ExitWaiter for FakeWaiter {
    fn wait_exit(self: Box<Self>) -> Result<i32, PtyError> {
        match self.rx.recv() {
            Ok(Ok(code)) => Ok(code),
            Ok(Err(msg)) => Err(PtyError::WaitFailed(msg)),
            Err(_) => Err(PtyError::WaitFailed("process handle gone".to_string())),
        }
    }
}

struct FakeOutput {
    rx: Receiver<Chunk>,
    pending: Vec<u8>,
}

impl Read for FakeOutput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(Chunk::Bytes(bytes)) => self.pending = bytes,
                Ok(Chunk::Fail(kind)) => return Err(io::Error::new(kind, "scripted read failure")),
                Ok(Chunk::Eof) | Err(_) => return Ok(0),
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

/// Backend handing out [`FakePty`]s, one per spawn.
#[derive(Default)]
pub(crate) struct FakeBackend {
    spawned: Mutex<Vec<FakePty>>,
    requests: Mutex<Vec<SpawnRequest>>,
    exit_on_spawn: Mutex<Option<i32>>,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Controller of the `index`th successful spawn.
    pub(crate) fn pty(&self, index: usize) -> FakePty {
        self.spawned.lock().unwrap()[index].clone()
    }

    pub(crate) fn last(&self) -> FakePty {
        self.spawned.lock().unwrap().last().cloned().expect("nothing spawned")
    }

    pub(crate) fn requests(&self) -> Vec<SpawnRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Every later spawn hands back a child that has already exited with
    /// `code`.
    pub(crate) fn exit_on_spawn(&self, code: i32) {
        *self.exit_on_spawn.lock().unwrap() = Some(code);
    }
}

impl PtyBackend for FakeBackend {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedPty, PtyError> {
        self.requests.lock().unwrap().push(request.clone());
        if request.command == MISSING_COMMAND {
            return Err(PtyError::SpawnFailed(format!(
                "{} does not exist",
                request.command
            )));
        }

        let fake = FakePty::new();
        if let Some(code) = *self.exit_on_spawn.lock().unwrap() {
            fake.exit(code);
        }
        let mut spawned = self.spawned.lock().unwrap();
        let pid = 1000 + spawned.len() as u32;
        let parts = SpawnedPty {
            pid: Some(pid),
            device: fake.device(),
            process: fake.process(),
            waiter: fake.waiter(),
            output: fake.output(),
        };
        spawned.push(fake);
        Ok(parts)
    }
}
