//! In-memory stand-in for the host simulator runtime
//!
//! Backs the shared-memory comm with plain process memory so the full SHM
//! path can run without a simulator. In callback mode a notifier thread
//! owned by the runtime dispatches receive events, mirroring how a real
//! runtime invokes callbacks from its own thread.

use crate::comm::shm::{dispatch_recv_event, ShmRuntime};
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

struct ChannelSlot {
    capacity: usize,
    data: Vec<u8>,
}

struct EventSlot {
    robot: String,
    channel_id: u32,
    pending: bool,
}

#[derive(Default)]
struct NotifyQueue {
    queue: Mutex<VecDeque<i32>>,
    ready: Condvar,
}

// Event ids are unique across every runtime instance in the process, like
// the ids a real host runtime hands out.
static NEXT_EVENT_ID: AtomicI32 = AtomicI32::new(0);

/// Memory-backed [`ShmRuntime`]
pub struct MemoryShmRuntime {
    channels: Mutex<HashMap<(String, u32), ChannelSlot>>,
    events: Mutex<HashMap<i32, EventSlot>>,
    callback_dispatch: bool,
    notify: Arc<NotifyQueue>,
    notifier_running: Arc<AtomicBool>,
    notifier: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryShmRuntime {
    /// Poll-mode runtime: new data is observed through `poll_recv_event`
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            callback_dispatch: false,
            notify: Arc::new(NotifyQueue::default()),
            notifier_running: Arc::new(AtomicBool::new(false)),
            notifier: Mutex::new(None),
        })
    }

    /// Callback-mode runtime: a runtime-owned thread dispatches receive
    /// events to the registered comms
    pub fn with_callback_dispatch() -> Arc<Self> {
        let runtime = Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            callback_dispatch: true,
            notify: Arc::new(NotifyQueue::default()),
            notifier_running: Arc::new(AtomicBool::new(true)),
            notifier: Mutex::new(None),
        });

        let notify = Arc::clone(&runtime.notify);
        let running = Arc::clone(&runtime.notifier_running);
        let handle = std::thread::Builder::new()
            .name("shm-notifier".to_string())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    let event_id = {
                        let mut queue = notify.queue.lock();
                        loop {
                            if let Some(id) = queue.pop_front() {
                                break Some(id);
                            }
                            if !running.load(Ordering::Relaxed) {
                                break None;
                            }
                            notify
                                .ready
                                .wait_for(&mut queue, Duration::from_millis(100));
                        }
                    };
                    match event_id {
                        Some(id) => dispatch_recv_event(id),
                        None => break,
                    }
                }
            })
            .expect("failed to spawn shm notifier thread");
        *runtime.notifier.lock() = Some(handle);
        runtime
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }
}

impl ShmRuntime for MemoryShmRuntime {
    fn create_channel(&self, robot: &str, channel_id: u32, pdu_size: usize) -> Result<()> {
        self.channels
            .lock()
            .entry((robot.to_string(), channel_id))
            .or_insert(ChannelSlot {
                capacity: pdu_size,
                data: Vec::new(),
            });
        Ok(())
    }

    fn write_pdu(&self, robot: &str, channel_id: u32, data: &[u8]) -> Result<()> {
        let pending_events: Vec<i32> = {
            let mut channels = self.channels.lock();
            let slot = channels
                .get_mut(&(robot.to_string(), channel_id))
                .ok_or(Error::NoEntry)?;
            let len = if slot.capacity > 0 {
                data.len().min(slot.capacity)
            } else {
                data.len()
            };
            slot.data = data[..len].to_vec();

            let mut events = self.events.lock();
            events
                .iter_mut()
                .filter(|(_, e)| e.robot == robot && e.channel_id == channel_id)
                .map(|(id, e)| {
                    e.pending = true;
                    *id
                })
                .collect()
        };

        if self.callback_dispatch && !pending_events.is_empty() {
            let mut queue = self.notify.queue.lock();
            queue.extend(pending_events);
            self.notify.ready.notify_one();
        }
        Ok(())
    }

    fn read_pdu(&self, robot: &str, channel_id: u32, buf: &mut [u8]) -> Result<usize> {
        let channels = self.channels.lock();
        let slot = channels
            .get(&(robot.to_string(), channel_id))
            .ok_or(Error::NoEntry)?;
        if slot.data.is_empty() {
            return Err(Error::NoEntry);
        }
        let len = slot.data.len().min(buf.len());
        buf[..len].copy_from_slice(&slot.data[..len]);
        Ok(len)
    }

    fn register_recv_event(&self, robot: &str, channel_id: u32) -> Result<i32> {
        let event_id = NEXT_EVENT_ID.fetch_add(1, Ordering::SeqCst) + 1;
        self.events.lock().insert(
            event_id,
            EventSlot {
                robot: robot.to_string(),
                channel_id,
                pending: false,
            },
        );
        Ok(event_id)
    }

    fn unregister_recv_event(&self, event_id: i32) -> Result<()> {
        self.events.lock().remove(&event_id);
        Ok(())
    }

    fn poll_recv_event(&self, event_id: i32) -> bool {
        match self.events.lock().get_mut(&event_id) {
            Some(event) => std::mem::take(&mut event.pending),
            None => false,
        }
    }
}

impl Drop for MemoryShmRuntime {
    fn drop(&mut self) {
        self.notifier_running.store(false, Ordering::SeqCst);
        self.notify.ready.notify_one();
        if let Some(handle) = self.notifier.lock().take() {
            let _ = handle.join();
        }
    }
}
