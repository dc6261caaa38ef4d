//! The reactor: a single-threaded event loop multiplexing fd readiness,
//! scheduled callbacks, and timed alarms.
//!
//! A [`Selector`] owns its registered [`Selectable`]s (strong references,
//! keyed by fd), a wake fd, a FIFO of callbacks runnable from any thread,
//! and a cancelable alarm heap. Registration, desire updates, and close
//! paths run on the loop thread (or before the loop starts);
//! [`Selector::run_in_select_loop`], the alarm calls, and
//! [`Selector::make_loop_exit`] are safe from any thread.
//!
//! Loop step order: poll the backend, dispatch error → read → write per
//! event, drain the callback queue in bounded rounds, then fire due alarms.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::warn;

use crate::config::{LoopType, SelectorOptions};
use crate::error::{Error, Result};
use crate::metrics;
use crate::poller::{EpollPoller, PollPoller, Poller, DEFAULT_DESIRES, WANT_READ, WANT_WRITE};
use crate::selectable::{Selectable, INVALID_FD};

/// Identifies a registered alarm; returned by [`Selector::register_alarm`].
pub type AlarmId = u64;

/// "No alarm armed" sentinel for the next-deadline atomic.
const NO_ALARM: i64 = i64::MAX;

type Callback = Box<dyn FnOnce() + Send>;

struct Registration {
    selectable: Arc<dyn Selectable>,
    desires: u32,
}

#[derive(Default)]
struct AlarmState {
    callbacks: HashMap<AlarmId, Callback>,
    // Min-heap of (deadline nanos, id). Unregistered ids stay in the heap
    // as tombstones and are discarded at pop time.
    heap: BinaryHeap<Reverse<(i64, AlarmId)>>,
}

pub(crate) fn current_thread_id() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

/// The reactor. Created with [`Selector::create`]; drive it with
/// [`Selector::run_loop`] on a dedicated thread, or through
/// [`SelectorThread`].
pub struct Selector {
    options: SelectorOptions,
    self_weak: Weak<Selector>,

    // pthread id of the loop thread; 0 until the loop starts.
    tid: AtomicU64,
    should_end: AtomicBool,

    // Writing to wake_in_fd wakes a blocked backend step. With eventfd both
    // sides are the same fd; with the self-pipe they differ.
    wake_in_fd: RawFd,
    wake_out_fd: RawFd,

    poller: Mutex<Box<dyn Poller>>,
    registered: Mutex<HashMap<RawFd, Registration>>,

    to_run: Mutex<VecDeque<Callback>>,
    have_to_run: AtomicBool,

    alarms: Mutex<AlarmState>,
    alarm_seq: AtomicU64,
    num_alarms: AtomicUsize,
    // Nanos since `base` of the earliest alarm, NO_ALARM when none; lets the
    // loop compute its wait timeout without taking the alarm lock.
    next_alarm_nanos: AtomicI64,

    base: Instant,
    now_nanos: AtomicI64,

    call_on_close: Mutex<Option<Callback>>,
}

impl Selector {
    pub fn create(options: SelectorOptions) -> Result<Arc<Selector>> {
        let (wake_in_fd, wake_out_fd) = match options.loop_type {
            LoopType::Epoll => {
                let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
                if efd < 0 {
                    return Err(Error::last_os_error().annotate("creating wake eventfd"));
                }
                (efd, efd)
            }
            LoopType::Poll => {
                let mut fds = [0 as RawFd; 2];
                if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
                    return Err(Error::last_os_error().annotate("creating wake pipe"));
                }
                for fd in fds {
                    set_nonblocking(fd)?;
                }
                (fds[1], fds[0])
            }
        };
        let poller: Box<dyn Poller> = match options.loop_type {
            LoopType::Epoll => Box::new(EpollPoller::new(wake_out_fd, options.max_events_per_step)?),
            LoopType::Poll => Box::new(PollPoller::new(wake_out_fd)?),
        };
        Ok(Arc::new_cyclic(|weak| Selector {
            options,
            self_weak: weak.clone(),
            tid: AtomicU64::new(0),
            should_end: AtomicBool::new(false),
            wake_in_fd,
            wake_out_fd,
            poller: Mutex::new(poller),
            registered: Mutex::new(HashMap::new()),
            to_run: Mutex::new(VecDeque::new()),
            have_to_run: AtomicBool::new(false),
            alarms: Mutex::new(AlarmState::default()),
            alarm_seq: AtomicU64::new(0),
            num_alarms: AtomicUsize::new(0),
            next_alarm_nanos: AtomicI64::new(NO_ALARM),
            base: Instant::now(),
            now_nanos: AtomicI64::new(0),
            call_on_close: Mutex::new(None),
        }))
    }

    pub fn options(&self) -> &SelectorOptions {
        &self.options
    }

    /// Sets the function invoked after the loop exits and all selectables
    /// are closed. Set before starting the loop.
    pub fn set_call_on_close(&self, callback: impl FnOnce() + Send + 'static) {
        *self.call_on_close.lock().unwrap() = Some(Box::new(callback));
    }

    /// True when called on the thread running the loop.
    pub fn is_in_select_thread(&self) -> bool {
        self.tid.load(Ordering::Acquire) == current_thread_id()
    }

    /// True once the loop has been told to exit. Scheduled callbacks can
    /// still execute in this state.
    pub fn is_exiting(&self) -> bool {
        self.should_end.load(Ordering::Acquire)
    }

    /// Schedules the loop exit; safe from any thread. Off-thread calls are
    /// routed through the callback queue to guarantee ordering with
    /// previously scheduled work.
    pub fn make_loop_exit(&self) {
        if self.is_in_select_thread() {
            self.should_end.store(true, Ordering::Release);
        } else if let Some(me) = self.self_weak.upgrade() {
            self.run_in_select_loop(move || me.should_end.store(true, Ordering::Release));
        }
    }

    /// The last time the loop updated its monotonic snapshot.
    pub fn now(&self) -> Instant {
        self.base + Duration::from_nanos(self.now_nanos.load(Ordering::Acquire).max(0) as u64)
    }

    pub(crate) fn now_nanos(&self) -> i64 {
        self.now_nanos.load(Ordering::Acquire)
    }

    fn update_now(&self) {
        self.now_nanos
            .store(self.base.elapsed().as_nanos() as i64, Ordering::Release);
    }

    fn check_loop_thread(&self, what: &str) -> Result<()> {
        let tid = self.tid.load(Ordering::Acquire);
        if tid == 0 || tid == current_thread_id() {
            Ok(())
        } else {
            Err(Error::failed_precondition(format!(
                "{what} is only valid on the selector loop thread or before the loop starts"
            )))
        }
    }

    // ── Registration ────────────────────────────────────────────────

    /// Registers a selectable for event callbacks, with read and error on
    /// by default. Loop thread (or pre-start) only. Registering twice is a
    /// no-op; registering an object bound to another selector fails.
    pub fn register(&self, s: Arc<dyn Selectable>) -> Result<()> {
        self.check_loop_thread("register")?;
        let me = self
            .self_weak
            .upgrade()
            .ok_or_else(|| Error::failed_precondition("selector is being torn down"))?;
        match s.selector_handle().selector() {
            None => s.selector_handle().attach(&me),
            Some(other) => {
                if !std::ptr::eq(Arc::as_ptr(&other), self as *const Selector) {
                    return Err(Error::failed_precondition(
                        "selectable is registered with a different selector",
                    ));
                }
            }
        }
        let fd = s.get_fd();
        let mut registered = self.registered.lock().unwrap();
        if registered.contains_key(&fd) {
            return Ok(());
        }
        registered.insert(
            fd,
            Registration {
                selectable: s.clone(),
                desires: DEFAULT_DESIRES,
            },
        );
        if let Err(e) = self.poller.lock().unwrap().add(fd, DEFAULT_DESIRES) {
            registered.remove(&fd);
            s.selector_handle().detach();
            return Err(e);
        }
        Ok(())
    }

    /// Removes a previously registered selectable and clears its back
    /// pointer. Loop thread (or pre-start) only.
    pub fn unregister(&self, s: &dyn Selectable) -> Result<()> {
        self.check_loop_thread("unregister")?;
        if !s.selector_handle().is_attached_to(self) {
            return Err(Error::failed_precondition(
                "selectable is registered with a different selector",
            ));
        }
        let fd = s.get_fd();
        self.registered.lock().unwrap().remove(&fd);
        s.selector_handle().detach();
        self.poller.lock().unwrap().delete(fd)
    }

    pub fn enable_read_callback(&self, s: &dyn Selectable, enable: bool) -> Result<()> {
        self.update_desire(s, enable, WANT_READ)
    }

    pub fn enable_write_callback(&self, s: &dyn Selectable, enable: bool) -> Result<()> {
        self.update_desire(s, enable, WANT_WRITE)
    }

    fn update_desire(&self, s: &dyn Selectable, enable: bool, desire: u32) -> Result<()> {
        self.check_loop_thread("desire update")?;
        if !s.selector_handle().is_attached_to(self) {
            return Err(Error::failed_precondition(
                "selectable is registered with a different selector",
            ));
        }
        let fd = s.get_fd();
        let mut registered = self.registered.lock().unwrap();
        let Some(entry) = registered.get_mut(&fd) else {
            return Err(Error::not_found(format!(
                "file descriptor {fd} is not registered with this selector"
            )));
        };
        let current = entry.desires & desire != 0;
        if current == enable {
            return Ok(()); // already in the requested state
        }
        if enable {
            entry.desires |= desire;
        } else {
            entry.desires &= !desire;
        }
        let desires = entry.desires;
        drop(registered);
        self.poller.lock().unwrap().update(fd, desires)
    }

    /// Closes every registered selectable, head first, until the set is
    /// empty. Loop thread (or pre-start) only.
    pub fn clean_and_close_all(&self) -> Result<()> {
        self.check_loop_thread("clean_and_close_all")?;
        loop {
            let entry = {
                let registered = self.registered.lock().unwrap();
                registered
                    .iter()
                    .next()
                    .map(|(fd, reg)| (*fd, reg.selectable.clone()))
            };
            let Some((fd, selectable)) = entry else {
                return Ok(());
            };
            selectable.close();
            // Close must unregister; drop the entry ourselves if it did not
            // so this loop always terminates.
            let mut registered = self.registered.lock().unwrap();
            if registered.contains_key(&fd) {
                warn!("selectable on fd {fd} did not unregister in close(); dropping it");
                registered.remove(&fd);
                selectable.selector_handle().detach();
                drop(registered);
                let _ = self.poller.lock().unwrap().delete(fd);
            }
        }
    }

    // ── Cross-thread scheduling ─────────────────────────────────────

    /// Appends `callback` to the loop's callback queue; safe from any
    /// thread. Callbacks scheduled from one thread run in FIFO order.
    pub fn run_in_select_loop(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut to_run = self.to_run.lock().unwrap();
            to_run.push_back(Box::new(callback));
            self.have_to_run.store(true, Ordering::Release);
        }
        if !self.is_in_select_thread() {
            self.send_wake_signal();
        }
    }

    /// Runs `callback` after `timeout` on the loop thread; safe from any
    /// thread. The returned id cancels it via [`Selector::unregister_alarm`].
    pub fn register_alarm(
        &self,
        callback: impl FnOnce() + Send + 'static,
        timeout: Duration,
    ) -> AlarmId {
        let deadline = (self.base.elapsed() + timeout).as_nanos() as i64;
        let mut alarms = self.alarms.lock().unwrap();
        let id = self.alarm_seq.fetch_add(1, Ordering::AcqRel);
        alarms.callbacks.insert(id, Box::new(callback));
        alarms.heap.push(Reverse((deadline, id)));
        if let Some(Reverse((next, _))) = alarms.heap.peek() {
            self.next_alarm_nanos.store(*next, Ordering::Release);
        }
        self.num_alarms.store(alarms.callbacks.len(), Ordering::Release);
        drop(alarms);
        if !self.is_in_select_thread() {
            // Shorten the current backend wait if this deadline is nearer.
            self.send_wake_signal();
        }
        id
    }

    /// Cancels an alarm; safe from any thread. The heap entry becomes a
    /// tombstone discarded at pop time.
    pub fn unregister_alarm(&self, alarm_id: AlarmId) {
        let mut alarms = self.alarms.lock().unwrap();
        alarms.callbacks.remove(&alarm_id);
        self.num_alarms.store(alarms.callbacks.len(), Ordering::Release);
    }

    fn send_wake_signal(&self) {
        let value: u64 = 1;
        let cb = unsafe {
            libc::write(
                self.wake_in_fd,
                &value as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if cb < 0 && !crate::error::is_retryable_errno(crate::error::last_errno()) {
            warn!(
                "error writing a wake-up value to the selector wake fd: {}",
                Error::last_os_error()
            );
        }
    }

    fn clear_wake_signal(&self) {
        let mut buffer = [0u8; 512];
        loop {
            let cb = unsafe {
                libc::read(
                    self.wake_out_fd,
                    buffer.as_mut_ptr().cast(),
                    buffer.len(),
                )
            };
            if cb <= 0 {
                return;
            }
        }
    }

    // ── The loop ────────────────────────────────────────────────────

    /// Runs the select loop on the current thread until
    /// [`Selector::make_loop_exit`]. On exit every registered selectable is
    /// closed and the close callback, if set, is invoked.
    pub fn run_loop(&self) -> Result<()> {
        self.should_end.store(false, Ordering::Release);
        self.tid.store(current_thread_id(), Ordering::Release);

        while !self.should_end.load(Ordering::Acquire) {
            self.update_now();
            let mut loop_timeout = self.options.default_loop_timeout;
            if self.have_to_run.load(Ordering::Acquire) {
                loop_timeout = Duration::ZERO;
            } else {
                let next = self.next_alarm_nanos.load(Ordering::Acquire);
                if next != NO_ALARM {
                    let delta = next.saturating_sub(self.now_nanos());
                    let delta = Duration::from_nanos(delta.max(0) as u64);
                    loop_timeout = loop_timeout.min(delta);
                }
            }

            let events = self
                .poller
                .lock()
                .unwrap()
                .step(loop_timeout)
                .map_err(|e| e.annotate("during selector loop step"))?;
            self.update_now();

            for event in events {
                if event.token == self.wake_out_fd {
                    continue; // wake signal; drained with the callbacks
                }
                let selectable = {
                    let registered = self.registered.lock().unwrap();
                    registered.get(&event.token).map(|r| r.selectable.clone())
                };
                // Skip events for selectables unregistered earlier in this
                // same step.
                let Some(s) = selectable else { continue };
                let mut keep_processing = true;
                if event.desires & crate::poller::WANT_ERROR != 0 {
                    keep_processing = s.handle_error_event(event) && s.get_fd() != INVALID_FD;
                }
                if keep_processing && event.desires & WANT_READ != 0 {
                    keep_processing = s.handle_read_event(event) && s.get_fd() != INVALID_FD;
                }
                if keep_processing && event.desires & WANT_WRITE != 0 {
                    s.handle_write_event(event);
                }
            }

            self.loop_callbacks();
            self.loop_alarms();
        }

        self.clean_and_close_all()?;
        if let Some(callback) = self.call_on_close.lock().unwrap().take() {
            callback();
        }
        Ok(())
    }

    fn loop_callbacks(&self) -> usize {
        let mut run_count = 0;
        while self.have_to_run.load(Ordering::Acquire)
            && run_count < self.options.max_num_callbacks_per_event
        {
            self.update_now();
            let n = self.run_callbacks(self.options.max_num_callbacks_per_event - run_count);
            if n == 0 {
                break;
            }
            run_count += n;
        }
        run_count
    }

    fn run_callbacks(&self, max_num_to_run: usize) -> usize {
        self.clear_wake_signal();
        let mut batch = {
            let mut to_run = self.to_run.lock().unwrap();
            let take = max_num_to_run.min(to_run.len());
            let batch: VecDeque<Callback> = to_run.drain(..take).collect();
            self.have_to_run.store(!to_run.is_empty(), Ordering::Release);
            batch
        };
        let deadline = Instant::now() + self.options.callbacks_timeout_per_event;
        let mut num_run = 0;
        while let Some(callback) = batch.pop_front() {
            callback();
            num_run += 1;
            if Instant::now() >= deadline {
                break;
            }
        }
        // Anything the deadline cut off goes back to the front of the queue.
        if !batch.is_empty() {
            let mut to_run = self.to_run.lock().unwrap();
            while let Some(callback) = batch.pop_back() {
                to_run.push_front(callback);
            }
            self.have_to_run.store(true, Ordering::Release);
        }
        num_run
    }

    fn loop_alarms(&self) -> usize {
        if self.num_alarms.load(Ordering::Acquire) == 0 {
            return 0;
        }
        self.update_now();
        let due = {
            let mut alarms = self.alarms.lock().unwrap();
            let now = self.now_nanos();
            let mut due: Vec<Callback> = Vec::new();
            while let Some(Reverse((deadline, id))) = alarms.heap.peek().copied() {
                if deadline > now {
                    break;
                }
                alarms.heap.pop();
                // Unregistered ids are tombstones; skip them.
                if let Some(callback) = alarms.callbacks.remove(&id) {
                    due.push(callback);
                }
            }
            self.num_alarms.store(alarms.callbacks.len(), Ordering::Release);
            let next = alarms
                .heap
                .peek()
                .map(|Reverse((deadline, _))| *deadline)
                .unwrap_or(NO_ALARM);
            self.next_alarm_nanos.store(next, Ordering::Release);
            due
        };
        let count = due.len();
        for callback in due {
            metrics::ALARMS_FIRED.increment();
            callback();
        }
        count
    }

    // ── Event classification ────────────────────────────────────────

    pub fn is_hang_up_event(&self, raw: u32) -> bool {
        self.poller.lock().unwrap().is_hang_up_event(raw)
    }
    pub fn is_remote_hang_up_event(&self, raw: u32) -> bool {
        self.poller.lock().unwrap().is_remote_hang_up_event(raw)
    }
    pub fn is_any_hang_up_event(&self, raw: u32) -> bool {
        self.poller.lock().unwrap().is_any_hang_up_event(raw)
    }
    pub fn is_error_event(&self, raw: u32) -> bool {
        self.poller.lock().unwrap().is_error_event(raw)
    }
    pub fn is_input_event(&self, raw: u32) -> bool {
        self.poller.lock().unwrap().is_input_event(raw)
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        debug_assert!(self.registered.lock().unwrap().is_empty());
        unsafe {
            libc::close(self.wake_out_fd);
            if self.wake_in_fd != self.wake_out_fd {
                libc::close(self.wake_in_fd);
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(Error::last_os_error().annotate(format!("fcntl F_GETFL on fd {fd}")));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Error::last_os_error().annotate(format!("fcntl F_SETFL on fd {fd}")));
    }
    Ok(())
}

/// A selector driven by an owned thread.
///
/// Created stopped; [`SelectorThread::start`] launches the loop,
/// [`SelectorThread::stop`] exits it and joins. The acceptor pool hands
/// accepted connections to selector threads like this one.
pub struct SelectorThread {
    selector: Arc<Selector>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    loop_status: Arc<Mutex<Result<()>>>,
    is_started: AtomicBool,
}

impl SelectorThread {
    /// Creates a stopped selector thread.
    pub fn create(options: SelectorOptions) -> Result<Arc<SelectorThread>> {
        let selector =
            Selector::create(options).map_err(|e| e.annotate("creating selector for thread"))?;
        Ok(Arc::new(SelectorThread {
            selector,
            thread: Mutex::new(None),
            loop_status: Arc::new(Mutex::new(Ok(()))),
            is_started: AtomicBool::new(false),
        }))
    }

    /// Starts the loop thread. Returns false if already running.
    pub fn start(&self) -> bool {
        let mut thread = self.thread.lock().unwrap();
        if thread.is_some() || self.is_started.load(Ordering::Acquire) {
            return false;
        }
        let selector = self.selector.clone();
        let loop_status = self.loop_status.clone();
        let handle = thread::Builder::new()
            .name("wireline-selector".to_string())
            .spawn(move || {
                let status = selector.run_loop();
                *loop_status.lock().unwrap() = status;
            });
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                warn!("failed to spawn selector thread: {e}");
                return false;
            }
        };
        *thread = Some(handle);
        self.is_started.store(true, Ordering::Release);
        true
    }

    /// Exits the loop and joins the thread. Returns false if not running.
    pub fn stop(&self) -> bool {
        let handle = self.thread.lock().unwrap().take();
        let Some(handle) = handle else {
            return false;
        };
        self.selector.make_loop_exit();
        let _ = handle.join();
        self.is_started.store(false, Ordering::Release);
        true
    }

    /// Schedules the close of every selectable on the loop thread.
    pub fn clean_and_close_all(&self) {
        let selector = self.selector.clone();
        self.selector.run_in_select_loop(move || {
            if let Err(e) = selector.clean_and_close_all() {
                warn!("clean_and_close_all failed: {e}");
            }
        });
    }

    pub fn selector(&self) -> &Arc<Selector> {
        &self.selector
    }

    pub fn is_started(&self) -> bool {
        self.is_started.load(Ordering::Acquire)
    }

    /// The status the last loop run finished with.
    pub fn loop_status(&self) -> Result<()> {
        self.loop_status.lock().unwrap().clone()
    }
}

impl Drop for SelectorThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selectable::SelectorHandle;
    use std::sync::atomic::{AtomicI32, AtomicU32};

    fn options_for(loop_type: LoopType) -> SelectorOptions {
        SelectorOptions::default()
            .set_loop_type(loop_type)
            .set_default_loop_timeout(Duration::from_millis(50))
    }

    struct PipeSelectable {
        handle: SelectorHandle,
        fd: AtomicI32,
        // Write side, closed together with the read side.
        peer_fd: RawFd,
    }

    impl PipeSelectable {
        fn new() -> Arc<PipeSelectable> {
            let mut fds = [0 as RawFd; 2];
            assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
            Arc::new(PipeSelectable {
                handle: SelectorHandle::new(),
                fd: AtomicI32::new(fds[0]),
                peer_fd: fds[1],
            })
        }
    }

    impl Selectable for PipeSelectable {
        fn selector_handle(&self) -> &SelectorHandle {
            &self.handle
        }

        fn get_fd(&self) -> RawFd {
            self.fd.load(Ordering::Acquire)
        }

        fn close(&self) {
            if let Some(selector) = self.handle.selector() {
                let _ = selector.unregister(self);
            }
            let fd = self.fd.swap(INVALID_FD, Ordering::AcqRel);
            if fd != INVALID_FD {
                unsafe {
                    libc::close(fd);
                    libc::close(self.peer_fd);
                }
            }
        }
    }

    #[test]
    fn register_unregister_manages_back_pointer() {
        let selector = Selector::create(options_for(LoopType::Epoll)).unwrap();
        let s = PipeSelectable::new();
        assert!(!s.handle.is_attached());

        selector.register(s.clone()).unwrap();
        assert!(s.handle.is_attached_to(&selector));
        // Registering twice is a no-op.
        selector.register(s.clone()).unwrap();

        selector.unregister(s.as_ref()).unwrap();
        assert!(!s.handle.is_attached(), "unregister clears the back pointer");
        assert!(selector.registered.lock().unwrap().is_empty());
        s.close();
    }

    #[test]
    fn loop_exit_closes_registered_selectables() {
        let selector = Selector::create(options_for(LoopType::Epoll)).unwrap();
        let s = PipeSelectable::new();
        selector.register(s.clone()).unwrap();

        let selector_clone = selector.clone();
        let handle = thread::spawn(move || selector_clone.run_loop());
        thread::sleep(Duration::from_millis(50));
        selector.make_loop_exit();
        handle.join().unwrap().unwrap();

        // The loop returned only after closing the registered set.
        assert!(selector.registered.lock().unwrap().is_empty());
        assert_eq!(s.get_fd(), INVALID_FD);
        assert!(!s.handle.is_attached());
    }

    #[test]
    fn callbacks_run_in_fifo_order() {
        let st = SelectorThread::create(options_for(LoopType::Epoll)).unwrap();
        st.start();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = std::sync::mpsc::channel();
        for i in 0..10 {
            let order = order.clone();
            let tx = tx.clone();
            st.selector().run_in_select_loop(move || {
                order.lock().unwrap().push(i);
                if i == 9 {
                    tx.send(()).unwrap();
                }
            });
        }
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
        st.stop();
        assert!(st.loop_status().is_ok());
    }

    #[test]
    fn alarms_fire_in_deadline_order() {
        let st = SelectorThread::create(options_for(LoopType::Poll)).unwrap();
        st.start();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = std::sync::mpsc::channel();
        for (label, delay_ms) in [(2u32, 60u64), (1, 30), (3, 90)] {
            let order = order.clone();
            let tx = tx.clone();
            st.selector().register_alarm(
                move || {
                    order.lock().unwrap().push(label);
                    if label == 3 {
                        tx.send(()).unwrap();
                    }
                },
                Duration::from_millis(delay_ms),
            );
        }
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        st.stop();
    }

    #[test]
    fn unregistered_alarm_is_suppressed() {
        let st = SelectorThread::create(options_for(LoopType::Epoll)).unwrap();
        st.start();
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        let id = st.selector().register_alarm(
            move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(50),
        );
        st.selector().unregister_alarm(id);
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        st.stop();
    }

    #[test]
    fn exit_runs_close_callback() {
        let selector = Selector::create(options_for(LoopType::Epoll)).unwrap();
        let closed = Arc::new(AtomicBool::new(false));
        let closed_clone = closed.clone();
        selector.set_call_on_close(move || closed_clone.store(true, Ordering::SeqCst));
        let selector_clone = selector.clone();
        let handle = thread::spawn(move || selector_clone.run_loop());
        thread::sleep(Duration::from_millis(50));
        selector.make_loop_exit();
        handle.join().unwrap().unwrap();
        assert!(closed.load(Ordering::SeqCst));
    }
}
