//! Asynchronous syscall bridge over the per-core io_uring.
//!
//! Every operation here looks synchronous to the calling fiber: the
//! arguments are packaged into a request, a submission-queue entry is
//! pushed onto the core's ring, the issuer arms its timeout and suspends,
//! and the completion reaper wakes it when the kernel answers. Return
//! values are signed integers: `>= 0` is the kernel's result, negative
//! values are `-errno`, with `-ETIME` and `-EINTR` reserved for
//! bridge-initiated cancellation.
//!
//! Requests live in the core's slab arena and are keyed by their slab
//! index, which rides in the SQE's `user_data`. Exactly one party retires
//! each request: the issuer on normal completion, the reaper once the
//! issuer has marked it cancelled. Issuer and reaper run on the same
//! core's single thread and never interleave mid-operation.

use crate::cycles;
use crate::fiber;
use crate::id::FiberId;
use crate::runtime::{current, yield_now};
use crate::worker::{self, signal_on, with_core};
use io_uring::{opcode, squeue, types};
use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

/// Result sentinel: the kernel has not answered yet.
pub const INCOMPLETE: i32 = -255;

/// Timeout sentinel: wait for the completion indefinitely.
pub const NO_TIMEOUT: u64 = u64::MAX;

/// One in-flight operation on the owning core's ring.
pub(crate) struct SyscallRequest {
    issuer: FiberId,
    op: &'static str,
    /// Sequence tag carried in the SQE user_data alongside the arena
    /// key; lets stale cancels miss instead of hitting a slot reuser.
    seq: u32,
    pub(crate) result: i32,
    pub(crate) cancelled: bool,
    /// Shared completion count for scatter groups; `None` for solo ops.
    group: Option<Rc<Cell<u32>>>,
    /// Owned copy of the caller's iovec array. Boxed so the address the
    /// kernel reads stays put even when the arena reallocates.
    iov: Option<Box<[libc::iovec]>>,
    addr: Option<Box<SockAddrBuf>>,
    msg: Option<Box<libc::msghdr>>,
}

struct SockAddrBuf {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl SyscallRequest {
    fn new(op: &'static str, issuer: FiberId) -> Self {
        SyscallRequest {
            issuer,
            op,
            seq: 0,
            result: INCOMPLETE,
            cancelled: false,
            group: None,
            iov: None,
            addr: None,
            msg: None,
        }
    }

    fn with_iov(mut self, iov: &[libc::iovec]) -> Self {
        self.iov = Some(iov.to_vec().into_boxed_slice());
        self
    }
}

fn issuer() -> FiberId {
    let me = current();
    assert!(!me.is_null(), "the syscall bridge may only be used from fiber context");
    me
}

/// Inserts the request into the core's arena and returns its key plus
/// the sequence-tagged user_data for its SQE.
fn register(mut request: SyscallRequest) -> (usize, u64) {
    with_core(|core| {
        let seq = core.request_seq;
        core.request_seq = core.request_seq.wrapping_add(1);
        request.seq = seq;
        let key = core.requests.insert(request);
        debug_assert!(key <= u32::MAX as usize);
        (key, ((seq as u64) << 32) | key as u64)
    })
}

fn tagged_user_data(key: usize) -> u64 {
    with_core(|core| ((core.requests[key].seq as u64) << 32) | key as u64)
}

/// Arms the issuer's wakeup for `timeout_ms` (1 ms minimum effective
/// timeout, `NO_TIMEOUT` parks indefinitely) and returns the deadline.
fn arm_timeout(timeout_ms: u64) -> u64 {
    let deadline = if timeout_ms == NO_TIMEOUT {
        cycles::BLOCKED
    } else {
        cycles::rdtsc().saturating_add(cycles::from_millis(timeout_ms.max(1)))
    };
    let running = fiber::running().expect("the syscall bridge may only be used from fiber context");
    worker::set_wakeup(running.id, deadline);
    deadline
}

/// Pushes one SQE, yielding while the submission queue is full.
fn submit_entry(entry: squeue::Entry) {
    loop {
        let pushed = with_core(|core| {
            // SAFETY: every buffer the entry points into is owned by the
            // request arena (or by the suspended issuer) and stays valid
            // until the completion is reaped.
            let pushed = unsafe { core.ring.submission().push(&entry).is_ok() };
            if let Err(err) = core.ring.submit() {
                tracing::warn!(error = %err, "io_uring submit failed");
            }
            pushed
        });
        if pushed {
            return;
        }
        // Queue full: run other fibers and the reaper until space opens.
        yield_now();
    }
}

/// Submits one request and suspends until completion, timeout, or
/// interruption.
fn issue(
    request: SyscallRequest,
    timeout_ms: u64,
    build: impl FnOnce(&SyscallRequest) -> squeue::Entry,
) -> isize {
    let op = request.op;
    let (key, user_data) = register(request);
    let entry = with_core(|core| build(&core.requests[key]))
        .flags(squeue::Flags::ASYNC)
        .user_data(user_data);
    submit_entry(entry);

    #[cfg(feature = "metrics")]
    with_core(|core| core.runtime.metrics.syscalls_issued.fetch_add(1, std::sync::atomic::Ordering::Relaxed));

    let deadline = arm_timeout(timeout_ms);
    fiber::dispatch();

    let result = with_core(|core| core.requests[key].result);
    if result == INCOMPLETE {
        // Woken by timeout or a stray signal, not by the reaper. Hand the
        // request to the reaper and chase it with an async cancel.
        let timed_out = cycles::rdtsc() >= deadline;
        tracing::trace!(op, timed_out, "cancelling in-flight request");
        with_core(|core| core.requests[key].cancelled = true);
        post_cancels(&[key]);
        #[cfg(feature = "metrics")]
        with_core(|core| core.runtime.metrics.syscalls_cancelled.fetch_add(1, std::sync::atomic::Ordering::Relaxed));
        return if timed_out {
            -(libc::ETIME as isize)
        } else {
            -(libc::EINTR as isize)
        };
    }

    with_core(|core| {
        core.requests.remove(key);
    });
    result as isize
}

type EntryBuilder = Box<dyn FnOnce(&SyscallRequest) -> squeue::Entry>;

/// Submits N correlated requests sharing one completion count and
/// suspends once; the issuer wakes when the whole group has completed.
fn issue_group(
    items: Vec<(SyscallRequest, EntryBuilder)>,
    rcs: &mut [i32],
    timeout_ms: u64,
) -> i32 {
    let count = items.len();
    assert!(count > 0, "empty scatter request");
    assert!(rcs.len() >= count, "result array shorter than the scatter request");

    let group = Rc::new(Cell::new(count as u32));
    let mut keys = Vec::with_capacity(count);
    for (mut request, build) in items {
        request.group = Some(Rc::clone(&group));
        let (key, user_data) = register(request);
        let entry = with_core(|core| build(&core.requests[key]))
            .flags(squeue::Flags::ASYNC)
            .user_data(user_data);
        submit_entry(entry);
        keys.push(key);
    }

    #[cfg(feature = "metrics")]
    with_core(|core| {
        core.runtime
            .metrics
            .syscalls_issued
            .fetch_add(count as u64, std::sync::atomic::Ordering::Relaxed)
    });

    let deadline = arm_timeout(timeout_ms);
    fiber::dispatch();

    if group.get() != 0 {
        // Timed out or interrupted mid-group. Completed members are
        // retired here; the rest transfer to the reaper, chased by
        // cancels.
        let timed_out = cycles::rdtsc() >= deadline;
        let mut cancels = Vec::new();
        with_core(|core| {
            for (index, &key) in keys.iter().enumerate() {
                let result = core.requests[key].result;
                rcs[index] = result;
                if result == INCOMPLETE {
                    core.requests[key].cancelled = true;
                    cancels.push(key);
                } else {
                    core.requests.remove(key);
                }
            }
        });
        post_cancels(&cancels);
        #[cfg(feature = "metrics")]
        with_core(|core| {
            core.runtime
                .metrics
                .syscalls_cancelled
                .fetch_add(cancels.len() as u64, std::sync::atomic::Ordering::Relaxed)
        });
        return if timed_out { -libc::ETIME } else { -libc::EINTR };
    }

    let mut rc = 0;
    with_core(|core| {
        for (index, &key) in keys.iter().enumerate() {
            let request = core.requests.remove(key);
            rcs[index] = request.result;
            if request.result < 0 {
                rc = request.result;
            }
        }
    });
    rc
}

/// Posts an async cancel for each targeted request and waits for the
/// cancels themselves to complete. The targets' own completions are then
/// guaranteed to be observed (and freed) by the reaper.
fn post_cancels(targets: &[usize]) {
    if targets.is_empty() {
        return;
    }
    let me = issuer();
    let group = Rc::new(Cell::new(targets.len() as u32));
    let mut cancel_keys = Vec::with_capacity(targets.len());
    for &target in targets {
        let target_user_data = tagged_user_data(target);
        let mut request = SyscallRequest::new("async-cancel", me);
        request.group = Some(Rc::clone(&group));
        let (key, user_data) = register(request);
        let entry = opcode::AsyncCancel::new(target_user_data)
            .build()
            .user_data(user_data);
        submit_entry(entry);
        cancel_keys.push(key);
    }
    while group.get() != 0 {
        fiber::dispatch();
    }
    with_core(|core| {
        for key in cancel_keys {
            core.requests.remove(key);
        }
    });
}

/// Drains the core's completion queue, waking issuers whose operations
/// finished. Called by the dispatcher on every pass.
///
/// Cancelled requests are retired here instead of waking anyone: the
/// issuer gave up ownership when it set the flag.
pub(crate) fn check_for_completions() {
    with_core(|core| {
        let mut completions = core.ring.completion();
        while let Some(cqe) = completions.next() {
            let key = (cqe.user_data() & u32::MAX as u64) as usize;
            let seq = (cqe.user_data() >> 32) as u32;
            let Some(request) = core.requests.get_mut(key) else {
                debug_assert!(false, "completion for an unknown request {key}");
                continue;
            };
            debug_assert_eq!(request.seq, seq, "completion for a recycled request slot");
            request.result = cqe.result();

            if request.cancelled {
                core.requests.remove(key);
                continue;
            }

            let done = match &request.group {
                None => true,
                Some(group) => {
                    group.set(group.get() - 1);
                    group.get() == 0
                }
            };
            if done {
                let issuer = request.issuer;
                signal_on(&core.shared, issuer);
            }

            #[cfg(feature = "metrics")]
            core.runtime
                .metrics
                .completions_reaped
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    });
}

/// Vectored read at `offset`. Returns bytes read or `-errno`.
///
/// # Safety
///
/// Every buffer named by `iov` must stay valid — and otherwise untouched —
/// until the operation is retired. On a `-ETIME`/`-EINTR` return the
/// kernel may still write into the buffers until the reaper observes the
/// cancelled completion, so they must outlive the runtime's next dispatch
/// passes, not just this call.
pub unsafe fn preadv(fd: RawFd, iov: &[libc::iovec], offset: u64, timeout_ms: u64) -> isize {
    let request = SyscallRequest::new("preadv", issuer()).with_iov(iov);
    issue(request, timeout_ms, move |request| {
        let iov = request.iov.as_ref().unwrap();
        opcode::Readv::new(types::Fd(fd), iov.as_ptr(), iov.len() as u32)
            .offset(offset)
            .build()
    })
}

/// Vectored write at `offset`. Returns bytes written or `-errno`.
///
/// # Safety
///
/// As [`preadv`]: the buffers must stay valid until the operation is
/// retired, which on cancellation outlives this call.
pub unsafe fn pwritev(fd: RawFd, iov: &[libc::iovec], offset: u64, timeout_ms: u64) -> isize {
    let request = SyscallRequest::new("pwritev", issuer()).with_iov(iov);
    issue(request, timeout_ms, move |request| {
        let iov = request.iov.as_ref().unwrap();
        opcode::Writev::new(types::Fd(fd), iov.as_ptr(), iov.len() as u32)
            .offset(offset)
            .build()
    })
}

/// Flushes `fd` to stable storage.
pub fn fsync(fd: RawFd, timeout_ms: u64) -> isize {
    let request = SyscallRequest::new("fsync", issuer());
    issue(request, timeout_ms, move |_| {
        opcode::Fsync::new(types::Fd(fd)).build()
    })
}

/// Sends `buf` on a connected socket.
///
/// # Safety
///
/// On a cancellation return the kernel may still read `buf` until the
/// reaper retires the request; the buffer must outlive this call.
pub unsafe fn send(fd: RawFd, buf: &[u8], flags: i32, timeout_ms: u64) -> isize {
    let request = SyscallRequest::new("send", issuer());
    let ptr = buf.as_ptr();
    let len = buf.len() as u32;
    issue(request, timeout_ms, move |_| {
        opcode::Send::new(types::Fd(fd), ptr, len).flags(flags).build()
    })
}

/// Sends a message on a socket. The header and its iovec array are
/// copied into the request; the payload buffers are not.
///
/// # Safety
///
/// The payload buffers (and any `msg_name`/`msg_control` storage) must
/// stay valid until the operation is retired, which on cancellation
/// outlives this call.
pub unsafe fn sendmsg(fd: RawFd, msg: &libc::msghdr, timeout_ms: u64) -> isize {
    let mut request = SyscallRequest::new("sendmsg", issuer());
    let mut header = *msg;
    if !msg.msg_iov.is_null() && msg.msg_iovlen as usize > 0 {
        let iov = std::slice::from_raw_parts(msg.msg_iov, msg.msg_iovlen as usize);
        let boxed: Box<[libc::iovec]> = iov.to_vec().into_boxed_slice();
        header.msg_iov = boxed.as_ptr() as *mut libc::iovec;
        request.iov = Some(boxed);
    }
    request.msg = Some(Box::new(header));
    issue(request, timeout_ms, move |request| {
        let header: &libc::msghdr = request.msg.as_ref().unwrap();
        opcode::SendMsg::new(types::Fd(fd), header as *const libc::msghdr).build()
    })
}

/// Accepts a connection on a listening socket. Returns the new fd; the
/// peer address is discarded.
pub fn accept(fd: RawFd, timeout_ms: u64) -> isize {
    let mut request = SyscallRequest::new("accept", issuer());
    request.addr = Some(Box::new(SockAddrBuf {
        // SAFETY: sockaddr_storage is valid all-zeroes.
        storage: unsafe { std::mem::zeroed() },
        len: std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
    }));
    issue(request, timeout_ms, move |request| {
        let buf = request.addr.as_ref().unwrap();
        opcode::Accept::new(
            types::Fd(fd),
            &buf.storage as *const _ as *mut libc::sockaddr,
            &buf.len as *const _ as *mut libc::socklen_t,
        )
        .build()
    })
}

/// Connects a socket to `addr`.
///
/// # Safety
///
/// `addr` must point to a valid socket address of `len` bytes. The bytes
/// are copied into the request, so the caller's storage may go away as
/// soon as this returns.
pub unsafe fn connect(
    fd: RawFd,
    addr: *const libc::sockaddr,
    len: libc::socklen_t,
    timeout_ms: u64,
) -> isize {
    let mut buf = Box::new(SockAddrBuf {
        storage: std::mem::zeroed(),
        len,
    });
    std::ptr::copy_nonoverlapping(
        addr as *const u8,
        &mut buf.storage as *mut _ as *mut u8,
        len as usize,
    );
    let mut request = SyscallRequest::new("connect", issuer());
    request.addr = Some(buf);
    issue(request, timeout_ms, move |request| {
        let buf = request.addr.as_ref().unwrap();
        opcode::Connect::new(
            types::Fd(fd),
            &buf.storage as *const _ as *const libc::sockaddr,
            buf.len,
        )
        .build()
    })
}

/// Closes `fd` through the ring.
pub fn close(fd: RawFd, timeout_ms: u64) -> isize {
    let request = SyscallRequest::new("close", issuer());
    issue(request, timeout_ms, move |_| {
        opcode::Close::new(types::Fd(fd)).build()
    })
}

/// Waits for readiness on `fd`. `events` is a `POLL*` mask; the result is
/// the returned event mask.
pub fn poll(fd: RawFd, events: u32, timeout_ms: u64) -> isize {
    let request = SyscallRequest::new("poll", issuer());
    issue(request, timeout_ms, move |_| {
        opcode::PollAdd::new(types::Fd(fd), events).build()
    })
}

/// Scatter form of [`preadv`]: one read per fd, completing as a group.
/// Per-op byte counts land in `rcs`; the return value is the last
/// negative per-op result, or zero.
///
/// # Safety
///
/// As [`preadv`], for every buffer of every op.
pub unsafe fn preadvv(
    fds: &[RawFd],
    iovs: &[&[libc::iovec]],
    offsets: &[u64],
    rcs: &mut [i32],
    timeout_ms: u64,
) -> i32 {
    scatter_rw("preadvv", true, fds, iovs, offsets, rcs, timeout_ms)
}

/// Scatter form of [`pwritev`].
///
/// # Safety
///
/// As [`pwritev`], for every buffer of every op.
pub unsafe fn pwritevv(
    fds: &[RawFd],
    iovs: &[&[libc::iovec]],
    offsets: &[u64],
    rcs: &mut [i32],
    timeout_ms: u64,
) -> i32 {
    scatter_rw("pwritevv", false, fds, iovs, offsets, rcs, timeout_ms)
}

fn scatter_rw(
    op: &'static str,
    read: bool,
    fds: &[RawFd],
    iovs: &[&[libc::iovec]],
    offsets: &[u64],
    rcs: &mut [i32],
    timeout_ms: u64,
) -> i32 {
    assert_eq!(fds.len(), iovs.len(), "scatter arity mismatch");
    assert_eq!(fds.len(), offsets.len(), "scatter arity mismatch");
    let me = issuer();
    let items = fds
        .iter()
        .zip(iovs.iter())
        .zip(offsets.iter())
        .map(|((&fd, &iov), &offset)| {
            let request = SyscallRequest::new(op, me).with_iov(iov);
            let build: EntryBuilder = Box::new(move |request: &SyscallRequest| {
                let iov = request.iov.as_ref().unwrap();
                if read {
                    opcode::Readv::new(types::Fd(fd), iov.as_ptr(), iov.len() as u32)
                        .offset(offset)
                        .build()
                } else {
                    opcode::Writev::new(types::Fd(fd), iov.as_ptr(), iov.len() as u32)
                        .offset(offset)
                        .build()
                }
            });
            (request, build)
        })
        .collect();
    issue_group(items, rcs, timeout_ms)
}

/// Scatter form of [`fsync`]: flushes every fd, completing as a group.
pub fn fsyncv(fds: &[RawFd], rcs: &mut [i32], timeout_ms: u64) -> i32 {
    let me = issuer();
    let items = fds
        .iter()
        .map(|&fd| {
            let request = SyscallRequest::new("fsyncv", me);
            let build: EntryBuilder = Box::new(move |_: &SyscallRequest| {
                opcode::Fsync::new(types::Fd(fd)).build()
            });
            (request, build)
        })
        .collect();
    issue_group(items, rcs, timeout_ms)
}
