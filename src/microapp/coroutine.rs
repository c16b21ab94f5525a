//! Guest coroutine.
//!
//! The guest runs on a dedicated OS thread joined to the host by two
//! rendezvous channels. `resume` unblocks the guest and then blocks the
//! host until the guest yields; the guest's `yield_to_host` does the
//! mirror image. At no point do host and guest run concurrently, which is
//! the entire contract the supervisor builds on.
//!
//! A guest that returns from its entry function (or dies) disconnects its
//! channel ends; the host observes that as [`ResumeOutcome::Finished`] and
//! treats it as fatal to the guest.

use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::debug;

use super::binary::MICROAPP_RAM_SIZE;
use super::ipc::{IoBuffers, SharedIoBuffers};

/// Stack size of the guest thread.
const GUEST_STACK_SIZE: usize = 64 * 1024;

/// Result of resuming the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The guest yielded; control is back with the host.
    Yielded,
    /// The guest returned or died. It will not run again.
    Finished,
}

/// The guest's side of the handoff.
pub struct GuestYielder {
    yield_tx: Sender<()>,
    resume_rx: Receiver<()>,
}

impl GuestYielder {
    /// Hand control to the host; blocks until resumed.
    ///
    /// Returns `false` when the host is gone, in which case the guest must
    /// return from its entry function.
    pub fn yield_to_host(&self) -> bool {
        if self.yield_tx.send(()).is_err() {
            return false;
        }
        self.resume_rx.recv().is_ok()
    }
}

/// Execution environment handed to a guest program.
pub struct GuestEnv {
    io: SharedIoBuffers,
    ram: Vec<u8>,
    yielder: GuestYielder,
}

impl GuestEnv {
    /// Hand control to the host; blocks until resumed. Returns `false`
    /// when the host is gone and the guest must return.
    pub fn yield_to_host(&self) -> bool {
        self.yielder.yield_to_host()
    }

    /// Access the IPC frames. Only valid while the guest is running, which
    /// is the only time guest code executes at all.
    pub fn with_buffers<R>(&self, f: impl FnOnce(&mut IoBuffers) -> R) -> R {
        let mut buffers = self.io.lock();
        f(&mut buffers)
    }

    /// The guest's zeroed RAM region.
    pub fn ram(&mut self) -> &mut [u8] {
        &mut self.ram
    }
}

/// A guest program hosted by the supervisor.
///
/// `run` is the guest's entry function: it is called exactly once and must
/// yield through the environment instead of returning. Returning is treated
/// as a guest failure.
pub trait MicroappProgram: Send + 'static {
    fn run(&mut self, env: &mut GuestEnv);
}

impl<F> MicroappProgram for F
where
    F: FnMut(&mut GuestEnv) + Send + 'static,
{
    fn run(&mut self, env: &mut GuestEnv) {
        self(env)
    }
}

/// Host handle to the guest coroutine.
pub struct Coroutine {
    resume_tx: Sender<()>,
    yield_rx: Receiver<()>,
    _handle: thread::JoinHandle<()>,
}

impl Coroutine {
    /// Spawn a guest program on its own thread with a zeroed RAM region.
    ///
    /// The guest does not start executing until the first `resume`.
    pub fn spawn(
        mut program: Box<dyn MicroappProgram>,
        io: SharedIoBuffers,
    ) -> std::io::Result<Self> {
        let (resume_tx, resume_rx) = bounded(0);
        let (yield_tx, yield_rx) = bounded(0);

        let handle = thread::Builder::new()
            .name("microapp".into())
            .stack_size(GUEST_STACK_SIZE)
            .spawn(move || {
                let yielder = GuestYielder {
                    yield_tx,
                    resume_rx,
                };
                // Block until the host performs the first resume.
                if yielder.resume_rx.recv().is_err() {
                    return;
                }
                let mut env = GuestEnv {
                    io,
                    ram: vec![0; MICROAPP_RAM_SIZE],
                    yielder,
                };
                program.run(&mut env);
                debug!("Guest entry function returned");
                // Dropping env disconnects the yield channel; the host sees
                // Finished on its pending or next resume.
            })?;

        Ok(Self {
            resume_tx,
            yield_rx,
            _handle: handle,
        })
    }

    /// Run the guest until it yields.
    pub fn resume(&mut self) -> ResumeOutcome {
        if self.resume_tx.send(()).is_err() {
            return ResumeOutcome::Finished;
        }
        match self.yield_rx.recv() {
            Ok(()) => ResumeOutcome::Yielded,
            Err(_) => ResumeOutcome::Finished,
        }
    }
}
