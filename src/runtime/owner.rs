use crate::error::{CamkitError, Result};
use crate::runtime::manager::ComponentManager;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

pub type OwnerId = u64;

pub type Task = Box<dyn FnOnce(&OwnerContext) + Send>;

enum Message {
    Task(Task),
    Stop,
}

type StartHook = Box<dyn FnOnce() + Send>;

/// An execution context to which components and their state exclusively
/// belong. One `Owner` == one dedicated worker thread consuming a task
/// queue; there is no intra-owner locking because only that thread ever
/// mutates the owner's components.
///
/// The handle itself is `Send + Sync` and cheap to clone; all real work
/// happens by posting tasks onto the owner's loop.
#[derive(Clone)]
pub struct Owner {
    shared: Arc<OwnerShared>,
}

struct OwnerShared {
    name: String,
    id: OwnerId,
    tx: Sender<Message>,
    started: AtomicBool,
    stopped: AtomicBool,
    // Drained by the loop thread right after it marks the owner started.
    start_hooks: Mutex<Vec<StartHook>>,
    rx: Mutex<Option<Receiver<Message>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<OwnerContext>>> = const { RefCell::new(None) };
}

impl Owner {
    /// Create the owner and its task queue without starting the loop.
    /// Tasks posted before [`start`](Self::start) are buffered, never lost.
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = unbounded();
        Self {
            shared: Arc::new(OwnerShared {
                name: name.into(),
                id: NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed),
                tx,
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                start_hooks: Mutex::new(Vec::new()),
                rx: Mutex::new(Some(rx)),
                join: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn id(&self) -> OwnerId {
        self.shared.id
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    /// Spawn the worker thread and begin consuming tasks.
    pub fn start(&self) -> Result<()> {
        let rx = match self.shared.rx.lock().take() {
            Some(rx) => rx,
            None => {
                warn!("Owner '{}' already started", self.shared.name);
                return Ok(());
            }
        };

        let owner = self.clone();
        let thread_name = self.shared.name.clone();
        let join = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || owner.run_loop(rx))?;
        *self.shared.join.lock() = Some(join);
        Ok(())
    }

    fn run_loop(&self, rx: Receiver<Message>) {
        info!("Owner '{}' started", self.shared.name);
        let ctx = Rc::new(OwnerContext {
            owner: self.clone(),
            manager: ComponentManager::new(self.clone()),
        });
        CURRENT.with(|current| *current.borrow_mut() = Some(Rc::clone(&ctx)));

        // Mark started and drain the at-most-once start hooks under the same
        // lock that on_started uses, so no hook is lost to the race.
        let hooks = {
            let mut hooks = self.shared.start_hooks.lock();
            self.shared.started.store(true, Ordering::Release);
            std::mem::take(&mut *hooks)
        };
        for hook in hooks {
            hook();
        }

        while let Ok(message) = rx.recv() {
            match message {
                Message::Task(task) => task(&ctx),
                Message::Stop => break,
            }
        }

        debug!("Owner '{}' stopping, releasing components", self.shared.name);
        ctx.manager.release_all();
        self.shared.stopped.store(true, Ordering::Release);
        CURRENT.with(|current| *current.borrow_mut() = None);
        info!("Owner '{}' stopped", self.shared.name);
    }

    /// Whether the calling thread is this owner's loop.
    pub fn is_current(&self) -> bool {
        CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .map(|ctx| ctx.owner.shared.id == self.shared.id)
                .unwrap_or(false)
        })
    }

    /// Enqueue a task for the owner's loop. Tasks run in FIFO order.
    pub fn post(&self, task: impl FnOnce(&OwnerContext) + Send + 'static) -> Result<()> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(CamkitError::OwnerStopped {
                owner: self.shared.name.clone(),
            });
        }
        self.shared
            .tx
            .send(Message::Task(Box::new(task)))
            .map_err(|_| CamkitError::OwnerStopped {
                owner: self.shared.name.clone(),
            })
    }

    /// Run `f` on the owner's loop and wait for its result. Executes inline
    /// when the caller is already this owner; otherwise blocks the calling
    /// thread. Never call this from a *different* owner's loop, that would
    /// stall that loop on this one.
    pub fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&OwnerContext) -> R + Send + 'static,
    {
        if self.is_current() {
            let ctx = OwnerContext::current().expect("current context");
            return Ok(f(&ctx));
        }
        if OwnerContext::current().is_some() {
            warn!(
                "Blocking call into owner '{}' from another owner's loop",
                self.shared.name
            );
        }

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.post(move |ctx| {
            let _ = reply_tx.send(f(ctx));
        })?;
        reply_rx.recv().map_err(|_| CamkitError::OwnerStopped {
            owner: self.shared.name.clone(),
        })
    }

    /// Register an at-most-once hook invoked on the owner's thread when its
    /// loop starts. If the owner is already running the hook is posted
    /// immediately.
    pub fn on_started(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut hooks = self.shared.start_hooks.lock();
            if !self.shared.started.load(Ordering::Acquire) {
                hooks.push(Box::new(hook));
                return;
            }
        }
        if self.post(move |_| hook()).is_err() {
            error!("Owner '{}' stopped before start hook ran", self.shared.name);
        }
    }

    /// Ask the loop to stop after draining tasks queued so far. Components
    /// are released (reverse creation order) before the thread exits.
    pub fn shutdown(&self) {
        let _ = self.shared.tx.send(Message::Stop);
    }

    /// Wait for the loop thread to exit.
    pub fn join(&self) {
        let join = self.shared.join.lock().take();
        if let Some(join) = join {
            if join.join().is_err() {
                error!("Owner '{}' thread panicked", self.shared.name);
            }
        }
    }
}

impl std::fmt::Debug for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Owner")
            .field("name", &self.shared.name)
            .field("id", &self.shared.id)
            .field("started", &self.is_started())
            .finish()
    }
}

/// Thread-affine side of an owner: the component registry plus the owner
/// handle, reachable only from tasks running on the owner's loop.
pub struct OwnerContext {
    owner: Owner,
    manager: ComponentManager,
}

impl OwnerContext {
    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn manager(&self) -> &ComponentManager {
        &self.manager
    }

    /// The context of the owner loop the calling thread belongs to, if any.
    pub fn current() -> Option<Rc<OwnerContext>> {
        CURRENT.with(|current| current.borrow().clone())
    }
}
