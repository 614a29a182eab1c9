// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Message-passing IPC.
//!
//! Every thread owns a mailbox: a bounded ring of 64-byte messages plus two
//! wait-queue heads (senders stalled on a full ring, the owner stalled on an
//! empty one) and a 32-bit notification word. The thread id indexes both the
//! TCB pool and the mailbox table.
//!
//! The synchronous pattern is send/receive/reply:
//!
//! ```text
//! client:  send(server, request, &mut reply)   -- blocks until replied
//! server:  receive(&mut msg)                   -- blocks until a request lands
//! server:  reply(msg.sender, response)         -- unblocks the client
//! ```
//!
//! While a send is outstanding, the client's mailbox records where the reply
//! should be written (the *reply slot*) and why the client is blocked. The
//! kernel performs all message movement itself, copy-in/copy-out, so neither
//! side ever trusts the other's buffers.
//!
//! Notifications are the odd one out: `notify` is a pure OR into the
//! destination's notification word, never blocks, never wakes, and is the
//! one kernel entry point an interrupt handler may call.

use abi::{IpcError, Message, ThreadId, MAILBOX_DEPTH};

use crate::{arch, sched, waitq, Kernel};

/// Why a mailbox's owning thread is currently blocked, if it is.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlockReason {
    None,
    /// Stalled sending: the destination ring was full.
    Send,
    /// Waiting for a message to arrive.
    Receive,
    /// Waiting for a server to reply to a delivered request.
    Reply,
}

/// Per-thread mailbox.
pub struct Mailbox {
    slots: [Message; MAILBOX_DEPTH],
    head: u8,
    tail: u8,
    count: u8,
    notify_bits: u32,
    /// Threads blocked trying to send here.
    sender_wait: Option<ThreadId>,
    /// The owner, when blocked in receive. (At most one entry.)
    receiver_wait: Option<ThreadId>,
    /// Why the *owning* thread is blocked.
    block_reason: BlockReason,
    /// Where the owner's outstanding `send` wants its reply written. Borrowed
    /// from the owner for the duration of the send; null when none.
    reply_slot: *mut Message,
}

impl Mailbox {
    pub(crate) const EMPTY: Self = Self {
        slots: [Message::ZERO; MAILBOX_DEPTH],
        head: 0,
        tail: 0,
        count: 0,
        notify_bits: 0,
        sender_wait: None,
        receiver_wait: None,
        block_reason: BlockReason::None,
        reply_slot: core::ptr::null_mut(),
    };

    /// Messages currently queued.
    pub fn count(&self) -> u8 {
        self.count
    }

    pub fn block_reason(&self) -> BlockReason {
        self.block_reason
    }

    pub fn notify_bits(&self) -> u32 {
        self.notify_bits
    }

    fn is_full(&self) -> bool {
        usize::from(self.count) >= MAILBOX_DEPTH
    }

    /// Appends `msg`, stamping its sender. Caller must hold the critical
    /// section. False when full.
    fn enqueue(&mut self, msg: &Message, sender: ThreadId) -> bool {
        if self.is_full() {
            return false;
        }
        let slot = &mut self.slots[usize::from(self.tail)];
        *slot = *msg;
        slot.sender = sender;
        self.tail = (self.tail + 1) % MAILBOX_DEPTH as u8;
        self.count += 1;
        true
    }

    /// Removes the oldest message. Caller must hold the critical section.
    fn dequeue(&mut self) -> Option<Message> {
        if self.count == 0 {
            return None;
        }
        let msg = self.slots[usize::from(self.head)];
        self.head = (self.head + 1) % MAILBOX_DEPTH as u8;
        self.count -= 1;
        Some(msg)
    }
}

fn live_dest(k: &Kernel, dest: ThreadId) -> Result<usize, IpcError> {
    if k.threads.is_live(dest) {
        Ok(dest.index())
    } else {
        Err(IpcError::NoThread)
    }
}

fn current_thread(k: &Kernel) -> Result<ThreadId, IpcError> {
    k.sched.current_thread().ok_or(IpcError::Invalid)
}

/// Wakes one sender stalled on mailbox `index`, if any. Returns the
/// scheduler's preemption verdict (callers on non-preempting paths ignore
/// it; the woken sender re-checks for space when it runs).
fn wake_one_sender(k: &mut Kernel, index: usize) -> bool {
    let woken =
        waitq::remove_head(&mut k.threads, &mut k.mailboxes[index].sender_wait);
    match woken {
        Some(sender) => {
            k.mailboxes[sender.index()].block_reason = BlockReason::None;
            k.sched.unblock(&mut k.threads, sender)
        }
        None => false,
    }
}

/// Synchronous RPC send: delivers `msg` to `dest`'s mailbox (blocking while
/// it is full), then blocks until the server replies through `reply`.
///
/// `reply` is a borrowed pointer to caller-owned storage; it must stay valid
/// until this call returns. Not legal from interrupt context.
pub fn send(
    k: &mut Kernel,
    dest: ThreadId,
    msg: &Message,
    reply: *mut Message,
) -> Result<(), IpcError> {
    if arch::in_isr_context() {
        return Err(IpcError::Isr);
    }
    if reply.is_null() {
        return Err(IpcError::Invalid);
    }
    let dest_index = live_dest(k, dest)?;

    arch::enter_critical();
    let cur = match current_thread(k) {
        Ok(c) => c,
        Err(e) => {
            arch::exit_critical();
            return Err(e);
        }
    };

    // Wait for ring space. On hardware we only resume here after a receive
    // freed a slot, but another sender may have raced us to it, so re-check.
    while k.mailboxes[dest_index].is_full() {
        k.mailboxes[cur.index()].block_reason = BlockReason::Send;
        waitq::insert(
            &mut k.threads,
            &mut k.mailboxes[dest_index].sender_wait,
            cur,
        );
        k.sched.block_current(&mut k.threads);
        sched::switch_and_arm(k);
        arch::exit_critical();
        arch::trigger_context_switch();

        arch::enter_critical();
    }

    k.mailboxes[dest_index].enqueue(msg, cur);

    // A receiver parked on an empty ring gets to run for this message.
    let woken = waitq::remove_head(
        &mut k.threads,
        &mut k.mailboxes[dest_index].receiver_wait,
    );
    if let Some(receiver) = woken {
        k.mailboxes[receiver.index()].block_reason = BlockReason::None;
        // Preemption is irrelevant: we are about to block regardless.
        let _ = k.sched.unblock(&mut k.threads, receiver);
    }

    // Park until the server replies into our slot.
    let my = &mut k.mailboxes[cur.index()];
    my.reply_slot = reply;
    my.block_reason = BlockReason::Reply;
    k.sched.block_current(&mut k.threads);
    sched::switch_and_arm(k);
    arch::exit_critical();
    arch::trigger_context_switch();

    // Resumed: `reply` has been filled in by the server's reply().
    Ok(())
}

/// Receives the oldest message into `out`, blocking while the mailbox is
/// empty. Frees ring space, so one stalled sender (if any) is woken.
pub fn receive(k: &mut Kernel, out: &mut Message) -> Result<(), IpcError> {
    if arch::in_isr_context() {
        return Err(IpcError::Isr);
    }

    arch::enter_critical();
    let cur = match current_thread(k) {
        Ok(c) => c,
        Err(e) => {
            arch::exit_critical();
            return Err(e);
        }
    };
    let index = cur.index();

    if let Some(msg) = k.mailboxes[index].dequeue() {
        *out = msg;
        let _ = wake_one_sender(k, index);
        arch::exit_critical();
        return Ok(());
    }

    // Nothing queued; park on our own receiver slot.
    k.mailboxes[index].block_reason = BlockReason::Receive;
    waitq::insert(&mut k.threads, &mut k.mailboxes[index].receiver_wait, cur);
    k.sched.block_current(&mut k.threads);
    sched::switch_and_arm(k);
    arch::exit_critical();
    arch::trigger_context_switch();

    // Resumed: a sender delivered exactly one message.
    arch::enter_critical();
    if let Some(msg) = k.mailboxes[index].dequeue() {
        *out = msg;
        let _ = wake_one_sender(k, index);
    }
    arch::exit_critical();
    Ok(())
}

/// Completes an RPC: writes `msg` through `dest`'s registered reply slot and
/// unblocks it, preempting if the client out-ranks us.
///
/// `dest` must actually be blocked awaiting a reply; anything else is a
/// protocol violation reported as `Invalid`, with no state modified.
pub fn reply(
    k: &mut Kernel,
    dest: ThreadId,
    msg: &Message,
) -> Result<(), IpcError> {
    if arch::in_isr_context() {
        return Err(IpcError::Isr);
    }
    let dest_index = live_dest(k, dest)?;

    arch::enter_critical();
    let slot = {
        let b = &k.mailboxes[dest_index];
        if b.block_reason != BlockReason::Reply || b.reply_slot.is_null() {
            arch::exit_critical();
            return Err(IpcError::Invalid);
        }
        b.reply_slot
    };

    // Safety: the slot was registered by `send` from the (still blocked)
    // client, which guarantees it valid until its send returns -- which can
    // only happen after we unblock it below.
    unsafe {
        core::ptr::write(slot, *msg);
    }
    {
        let b = &mut k.mailboxes[dest_index];
        b.reply_slot = core::ptr::null_mut();
        b.block_reason = BlockReason::None;
    }

    if k.sched.unblock(&mut k.threads, dest) {
        sched::switch_and_arm(k);
        arch::exit_critical();
        arch::trigger_context_switch();
        return Ok(());
    }
    arch::exit_critical();
    Ok(())
}

/// Non-blocking send; no reply is expected or awaited. `Full` when the ring
/// has no space. Still wakes a parked receiver on success.
pub fn try_send(
    k: &mut Kernel,
    dest: ThreadId,
    msg: &Message,
) -> Result<(), IpcError> {
    if arch::in_isr_context() {
        return Err(IpcError::Isr);
    }
    let dest_index = live_dest(k, dest)?;

    arch::enter_critical();
    let cur = match current_thread(k) {
        Ok(c) => c,
        Err(e) => {
            arch::exit_critical();
            return Err(e);
        }
    };

    if !k.mailboxes[dest_index].enqueue(msg, cur) {
        arch::exit_critical();
        return Err(IpcError::Full);
    }

    let woken = waitq::remove_head(
        &mut k.threads,
        &mut k.mailboxes[dest_index].receiver_wait,
    );
    if let Some(receiver) = woken {
        k.mailboxes[receiver.index()].block_reason = BlockReason::None;
        if k.sched.unblock(&mut k.threads, receiver) {
            sched::switch_and_arm(k);
            arch::exit_critical();
            arch::trigger_context_switch();
            return Ok(());
        }
    }
    arch::exit_critical();
    Ok(())
}

/// Non-blocking receive. `Empty` when nothing is queued.
pub fn try_receive(k: &mut Kernel, out: &mut Message) -> Result<(), IpcError> {
    if arch::in_isr_context() {
        return Err(IpcError::Isr);
    }

    arch::enter_critical();
    let cur = match current_thread(k) {
        Ok(c) => c,
        Err(e) => {
            arch::exit_critical();
            return Err(e);
        }
    };
    let index = cur.index();

    match k.mailboxes[index].dequeue() {
        Some(msg) => {
            *out = msg;
            let _ = wake_one_sender(k, index);
            arch::exit_critical();
            Ok(())
        }
        None => {
            arch::exit_critical();
            Err(IpcError::Empty)
        }
    }
}

/// ISR-safe notification: ORs `bits` into `dest`'s notification word. Pure
/// aggregation -- setting an already-set bit is invisible, and nobody is
/// woken.
pub fn notify(
    k: &mut Kernel,
    dest: ThreadId,
    bits: u32,
) -> Result<(), IpcError> {
    if bits == 0 {
        return Err(IpcError::Invalid);
    }
    let dest_index = live_dest(k, dest)?;

    arch::enter_critical();
    k.mailboxes[dest_index].notify_bits |= bits;
    arch::exit_critical();
    Ok(())
}

/// Atomically reads and clears the current thread's notification word.
/// Returns 0 from interrupt context.
pub fn check_notify(k: &mut Kernel) -> u32 {
    if arch::in_isr_context() {
        return 0;
    }

    arch::enter_critical();
    let bits = match k.sched.current_thread() {
        Some(cur) => {
            let b = &mut k.mailboxes[cur.index()];
            core::mem::replace(&mut b.notify_bits, 0)
        }
        None => 0,
    };
    arch::exit_critical();
    bits
}

/// Returns `id`'s mailbox to its pristine state. Part of thread destruction.
pub(crate) fn reset_mailbox(k: &mut Kernel, id: ThreadId) {
    k.mailboxes[id.index()] = Mailbox::EMPTY;
}

/// Unlinks a dying thread from every mailbox wait queue it might occupy.
pub(crate) fn forget_waiter(k: &mut Kernel, id: ThreadId) {
    for i in 0..abi::MAX_THREADS {
        waitq::remove(&mut k.threads, &mut k.mailboxes[i].sender_wait, id);
        waitq::remove(&mut k.threads, &mut k.mailboxes[i].receiver_wait, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::testing;
    use crate::testutil::{kernel_with_idle, run, spawn};
    use crate::thread::ThreadState;
    use abi::{service_hash, MessageType};

    const ECHO: u32 = 0x3B7D_6BA4;

    #[test]
    fn rpc_round_trip_stamps_sender_and_fills_reply() {
        let mut k = kernel_with_idle();
        let server = spawn(&mut k, "server", 8);
        let client = spawn(&mut k, "client", 10);

        // Client issues the request first; server is not yet receiving.
        run(&mut k, client);
        let req = Message::request(ECHO, 1, &42u32.to_le_bytes());
        let mut reply_buf = Message::ZERO;
        send(&mut k, server, &req, &mut reply_buf).unwrap();

        // Client is now parked awaiting the reply.
        assert_eq!(k.threads[client].state(), ThreadState::Blocked);
        assert_eq!(
            k.mailboxes[client.index()].block_reason(),
            BlockReason::Reply
        );

        // Server picks up the request.
        run(&mut k, server);
        let mut req_in = Message::ZERO;
        receive(&mut k, &mut req_in).unwrap();
        assert_eq!(req_in.sender, client);
        assert_eq!(req_in.service, ECHO);
        assert_eq!(req_in.method, 1);
        assert_eq!(&req_in.payload[..4], &42u32.to_le_bytes());

        // And answers.
        let resp = Message::reply(0, &43u32.to_le_bytes());
        reply(&mut k, req_in.sender, &resp).unwrap();

        assert_eq!(reply_buf.status, 0);
        assert_eq!(&reply_buf.payload[..4], &43u32.to_le_bytes());
        assert_eq!(reply_buf.mtype, MessageType::Reply as u8);
        assert_eq!(k.threads[client].state(), ThreadState::Ready);
        assert_eq!(
            k.mailboxes[client.index()].block_reason(),
            BlockReason::None
        );
        assert!(k.mailboxes[client.index()].reply_slot.is_null());
    }

    #[test]
    fn reply_preempts_more_important_client() {
        let mut k = kernel_with_idle();
        let server = spawn(&mut k, "server", 10);
        let client = spawn(&mut k, "client", 5);

        run(&mut k, client);
        let mut reply_buf = Message::ZERO;
        send(&mut k, server, &Message::request(ECHO, 1, &[]), &mut reply_buf)
            .unwrap();

        run(&mut k, server);
        let mut req = Message::ZERO;
        receive(&mut k, &mut req).unwrap();
        reply(&mut k, req.sender, &Message::reply(0, &[])).unwrap();

        // Client out-ranks the server, so the reply handed over the CPU.
        assert_eq!(k.sched.current_thread(), Some(client));
        assert_eq!(k.threads[server].state(), ThreadState::Ready);
    }

    #[test]
    fn mailbox_fills_at_depth_and_drains_fifo() {
        let mut k = kernel_with_idle();
        let a = spawn(&mut k, "a", 10);
        let b = spawn(&mut k, "b", 10);

        run(&mut k, a);
        for i in 0..MAILBOX_DEPTH as u16 {
            let m = Message::request(ECHO, i, &[]);
            assert_eq!(try_send(&mut k, b, &m), Ok(()));
        }
        assert_eq!(
            try_send(&mut k, b, &Message::request(ECHO, 99, &[])),
            Err(IpcError::Full)
        );

        // One receive frees one slot.
        run(&mut k, b);
        let mut m = Message::ZERO;
        try_receive(&mut k, &mut m).unwrap();
        assert_eq!(m.method, 0);
        assert_eq!(m.sender, a);

        run(&mut k, a);
        assert_eq!(
            try_send(&mut k, b, &Message::request(ECHO, 4, &[])),
            Ok(())
        );

        // Drain; FIFO of successful enqueue.
        run(&mut k, b);
        for want in [1u16, 2, 3, 4] {
            try_receive(&mut k, &mut m).unwrap();
            assert_eq!(m.method, want);
        }
        assert_eq!(try_receive(&mut k, &mut m), Err(IpcError::Empty));
    }

    #[test]
    fn send_wakes_parked_receiver() {
        let mut k = kernel_with_idle();
        let server = spawn(&mut k, "server", 8);
        let client = spawn(&mut k, "client", 10);

        run(&mut k, server);
        let mut inbox = Message::ZERO;
        receive(&mut k, &mut inbox).unwrap(); // parks; nothing queued yet
        assert_eq!(k.threads[server].state(), ThreadState::Blocked);
        assert_eq!(
            k.mailboxes[server.index()].block_reason(),
            BlockReason::Receive
        );

        run(&mut k, client);
        try_send(&mut k, server, &Message::request(ECHO, 7, &[])).unwrap();

        // try_send preempted us for the more important server.
        assert_eq!(k.sched.current_thread(), Some(server));
        assert_eq!(
            k.mailboxes[server.index()].block_reason(),
            BlockReason::None
        );
        // The parked receive never returned on this host harness; the
        // message sits in the ring for the server's next fetch.
        let mut m = Message::ZERO;
        try_receive(&mut k, &mut m).unwrap();
        assert_eq!(m.method, 7);
    }

    #[test]
    fn receive_frees_space_for_stalled_sender() {
        let mut k = kernel_with_idle();
        let a = spawn(&mut k, "a", 10);
        let b = spawn(&mut k, "b", 10);

        run(&mut k, a);
        for i in 0..MAILBOX_DEPTH as u16 {
            try_send(&mut k, b, &Message::request(ECHO, i, &[])).unwrap();
        }

        // Park `a` on b's sender queue the way a blocking send would.
        k.mailboxes[a.index()].block_reason = BlockReason::Send;
        waitq::insert(
            &mut k.threads,
            &mut k.mailboxes[b.index()].sender_wait,
            a,
        );
        crate::testutil::park(&mut k, a);

        run(&mut k, b);
        let mut m = Message::ZERO;
        receive(&mut k, &mut m).unwrap();
        assert_eq!(k.threads[a].state(), ThreadState::Ready);
        assert_eq!(k.mailboxes[a.index()].block_reason(), BlockReason::None);
    }

    #[test]
    fn reply_to_thread_not_awaiting_one_is_invalid() {
        let mut k = kernel_with_idle();
        let a = spawn(&mut k, "a", 10);
        let b = spawn(&mut k, "b", 10);

        run(&mut k, a);
        assert_eq!(
            reply(&mut k, b, &Message::reply(0, &[])),
            Err(IpcError::Invalid)
        );
        // No state disturbed.
        assert_eq!(k.threads[b].state(), ThreadState::Ready);
        assert_eq!(k.mailboxes[b.index()].count(), 0);
    }

    #[test]
    fn send_argument_validation() {
        let mut k = kernel_with_idle();
        let a = spawn(&mut k, "a", 10);
        run(&mut k, a);

        let msg = Message::request(ECHO, 1, &[]);
        let mut reply_buf = Message::ZERO;
        assert_eq!(
            send(&mut k, ThreadId(6), &msg, &mut reply_buf),
            Err(IpcError::NoThread)
        );
        assert_eq!(
            send(&mut k, ThreadId::INVALID, &msg, &mut reply_buf),
            Err(IpcError::NoThread)
        );
        assert_eq!(
            send(&mut k, a, &msg, core::ptr::null_mut()),
            Err(IpcError::Invalid)
        );
    }

    #[test]
    fn notifications_accumulate_and_clear() {
        let mut k = kernel_with_idle();
        let t = spawn(&mut k, "t", 10);

        notify(&mut k, t, 0b0001).unwrap();
        notify(&mut k, t, 0b0100).unwrap();
        notify(&mut k, t, 0b0001).unwrap(); // lossy re-set of the same bit

        run(&mut k, t);
        assert_eq!(check_notify(&mut k), 0b0101);
        assert_eq!(check_notify(&mut k), 0);
    }

    #[test]
    fn notify_validates_arguments_and_never_wakes() {
        let mut k = kernel_with_idle();
        let t = spawn(&mut k, "t", 10);
        crate::testutil::park(&mut k, t);

        assert_eq!(notify(&mut k, t, 0), Err(IpcError::Invalid));
        assert_eq!(
            notify(&mut k, ThreadId(6), 1),
            Err(IpcError::NoThread)
        );
        notify(&mut k, t, 0b10).unwrap();
        // Pure bit-set: the blocked thread stays blocked.
        assert_eq!(k.threads[t].state(), ThreadState::Blocked);
    }

    #[test]
    fn isr_policy_notify_only() {
        let mut k = kernel_with_idle();
        let t = spawn(&mut k, "t", 10);
        run(&mut k, t);

        let msg = Message::request(ECHO, 1, &[]);
        let mut buf = Message::ZERO;

        testing::set_isr_mode(true);
        assert_eq!(send(&mut k, t, &msg, &mut buf), Err(IpcError::Isr));
        assert_eq!(receive(&mut k, &mut buf), Err(IpcError::Isr));
        assert_eq!(reply(&mut k, t, &msg), Err(IpcError::Isr));
        assert_eq!(try_send(&mut k, t, &msg), Err(IpcError::Isr));
        assert_eq!(try_receive(&mut k, &mut buf), Err(IpcError::Isr));
        assert_eq!(check_notify(&mut k), 0);
        assert_eq!(notify(&mut k, t, 0b1), Ok(())); // the one legal call
        testing::set_isr_mode(false);

        assert_eq!(check_notify(&mut k), 0b1);
    }

    #[test]
    fn service_hash_is_fnv1a() {
        // Offset basis for the empty string, and two published FNV-1a
        // vectors.
        assert_eq!(service_hash(""), 0x811C_9DC5);
        assert_eq!(service_hash("a"), 0xE40C_292C);
        assert_eq!(service_hash("foobar"), 0xBF9C_F968);
    }
}
