// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and applications.
//!
//! Everything in this crate crosses the privilege boundary in one direction or
//! another: identifiers and status codes travel in registers, and `Message` /
//! `HeapStats` are copied bytewise between user memory and kernel memory. For
//! that reason the copyable types here derive the `zerocopy` traits and carry
//! `repr` attributes pinning their layout.

#![no_std]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Number of thread control blocks in the fixed pool.
pub const MAX_THREADS: usize = 8;

/// Number of distinct priority levels. Must not exceed 32, because the
/// scheduler advertises non-empty levels in a single-word bitmap.
pub const PRIORITY_LEVELS: usize = 32;

/// Round-robin quantum, in ticks, assigned when a `ThreadConfig` leaves its
/// `time_slice` as zero.
pub const DEFAULT_TIME_SLICE: u32 = 10;

/// Number of message slots in each thread's mailbox ring.
pub const MAILBOX_DEPTH: usize = 4;

/// Bytes of inline payload in a `Message`.
pub const MAX_PAYLOAD: usize = 48;

/// Number of mutex control blocks in the fixed pool.
pub const MAX_MUTEXES: usize = 8;

/// Number of semaphore control blocks in the fixed pool.
pub const MAX_SEMAPHORES: usize = 8;

/// Names a thread by its slot in the thread pool.
///
/// A `ThreadId` is just a small index. The all-ones value is reserved as the
/// "no thread" sentinel on the syscall wire; inside the kernel, absence is
/// expressed with `Option<ThreadId>` instead.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct ThreadId(pub u8);

impl ThreadId {
    /// Wire encoding of "no such thread" / creation failure.
    pub const INVALID: Self = Self(0xFF);

    /// Extracts this id as a pool index.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Indicates priority of a thread.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important, so priority 0 is the most likely to be
/// scheduled, followed by 1, and so forth.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means numerically
/// greater / less important, or more important / numerically smaller.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable,
    KnownLayout, Default,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// The least important level; reserved by convention for the idle thread.
    pub const IDLE: Self = Self((PRIORITY_LEVELS - 1) as u8);

    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

/// Names a mutex in the kernel's fixed mutex pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct MutexId(pub u8);

impl MutexId {
    /// Wire encoding of creation failure / no such mutex.
    pub const INVALID: Self = Self(0xFF);

    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Names a semaphore in the kernel's fixed semaphore pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct SemId(pub u8);

impl SemId {
    /// Wire encoding of creation failure / no such semaphore.
    pub const INVALID: Self = Self(0xFF);

    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Distinguishes the roles a `Message` can play in the send/receive/reply
/// protocol.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum MessageType {
    /// Client half of an RPC; the sender expects a `Reply`.
    Request = 1,
    /// Server half of an RPC, written through the client's reply slot.
    Reply = 2,
    /// Event advertisement; no reply expected.
    Notify = 3,
    /// Fire-and-forget datagram (typically delivered with `try_send`).
    OneWay = 4,
}

impl core::convert::TryFrom<u8> for MessageType {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::Request),
            2 => Ok(Self::Reply),
            3 => Ok(Self::Notify),
            4 => Ok(Self::OneWay),
            _ => Err(()),
        }
    }
}

/// The fixed 64-byte IPC record.
///
/// The fixed size is load-bearing: it lets the kernel copy messages in and out
/// across the privilege boundary with a single bounded copy, no marshalling.
/// `sender` is stamped by the kernel on delivery; whatever the caller put
/// there is overwritten.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Message {
    /// Sending thread, filled in by the kernel on delivery.
    pub sender: ThreadId,
    /// A `MessageType` discriminant. Kept as a raw byte so that an arbitrary
    /// 64-byte pattern is still a valid `Message` for `zerocopy` purposes;
    /// consumers convert with `MessageType::try_from`.
    pub mtype: u8,
    /// Service-defined operation code.
    pub method: u16,
    /// FNV-1a hash of the target service's name; see [`service_hash`].
    pub service: u32,
    /// Result code, meaningful in replies.
    pub status: i32,
    /// Bytes used of `payload`.
    pub payload_len: u16,
    /// Reserved, keep zero.
    pub reserved: [u8; 2],
    /// Inline payload.
    pub payload: [u8; MAX_PAYLOAD],
}

const _: () = assert!(core::mem::size_of::<Message>() == 64);

impl Message {
    /// A zeroed message; useful as a starting point for building requests and
    /// as the target of copy-in.
    pub const ZERO: Self = Self {
        sender: ThreadId(0),
        mtype: 0,
        method: 0,
        service: 0,
        status: 0,
        payload_len: 0,
        reserved: [0; 2],
        payload: [0; MAX_PAYLOAD],
    };

    /// Builds a `Request` with an inline payload.
    ///
    /// # Panics
    ///
    /// If `payload` exceeds `MAX_PAYLOAD`. Message sizes are static in
    /// practice, so that is a programming error, not a runtime condition.
    pub fn request(service: u32, method: u16, payload: &[u8]) -> Self {
        let mut m = Self::ZERO;
        m.mtype = MessageType::Request as u8;
        m.service = service;
        m.method = method;
        m.payload_len = payload.len() as u16;
        m.payload[..payload.len()].copy_from_slice(payload);
        m
    }

    /// Builds a `Reply` carrying `status` and an inline payload. Same payload
    /// size rules as [`Message::request`].
    pub fn reply(status: i32, payload: &[u8]) -> Self {
        let mut m = Self::ZERO;
        m.mtype = MessageType::Reply as u8;
        m.status = status;
        m.payload_len = payload.len() as u16;
        m.payload[..payload.len()].copy_from_slice(payload);
        m
    }
}

/// Caller-visible IPC failures. On the syscall wire these travel as the
/// negative `i32` codes; `0` is success.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IpcError {
    /// Null pointer, out-of-range argument, or protocol violation (e.g.
    /// replying to a thread that is not waiting for a reply).
    Invalid,
    /// Non-blocking send: destination mailbox is full.
    Full,
    /// Non-blocking receive: mailbox is empty.
    Empty,
    /// Destination thread id is out of range or names an inactive slot.
    NoThread,
    /// Blocking call attempted from an interrupt handler.
    Isr,
    /// Unknown method id. Returned by servers, never by the kernel itself; it
    /// is defined here so both sides agree on the code.
    Method,
}

impl IpcError {
    pub const fn code(self) -> i32 {
        match self {
            Self::Invalid => -1,
            Self::Full => -2,
            Self::Empty => -3,
            Self::NoThread => -4,
            Self::Isr => -5,
            Self::Method => -6,
        }
    }
}

/// Collapses an IPC result to its wire encoding.
pub fn ipc_code(r: Result<(), IpcError>) -> i32 {
    match r {
        Ok(()) => 0,
        Err(e) => e.code(),
    }
}

impl core::convert::TryFrom<i32> for IpcError {
    type Error = ();

    fn try_from(x: i32) -> Result<Self, Self::Error> {
        match x {
            -1 => Ok(Self::Invalid),
            -2 => Ok(Self::Full),
            -3 => Ok(Self::Empty),
            -4 => Ok(Self::NoThread),
            -5 => Ok(Self::Isr),
            -6 => Ok(Self::Method),
            _ => Err(()),
        }
    }
}

/// Heap usage snapshot returned by the heap-stats syscall.
#[derive(
    Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct HeapStats {
    pub total_size: u32,
    pub used_size: u32,
    pub free_size: u32,
    /// Maximum `used_size` ever observed.
    pub high_watermark: u32,
    /// Number of live allocations.
    pub alloc_count: u32,
    /// Largest single contiguous free block.
    pub largest_free_block: u32,
}

/// Enumeration of syscall numbers.
///
/// Number 0 is reserved for the first-thread launch issued by the kernel
/// itself during boot; it is consumed entirely by the SVC entry assembly and
/// never reaches the dispatch switch.
#[repr(u32)]
pub enum Sysnum {
    StartFirstThread = 0,
    Yield = 1,
    Sleep = 2,
    TickCount = 3,
    MutexCreate = 4,
    MutexDestroy = 5,
    MutexLock = 6,
    MutexTryLock = 7,
    MutexUnlock = 8,
    SemCreate = 9,
    SemDestroy = 10,
    SemWait = 11,
    SemTryWait = 12,
    SemSignal = 13,
    MsgSend = 14,
    MsgReceive = 15,
    MsgReply = 16,
    MsgTrySend = 17,
    MsgTryReceive = 18,
    MsgNotify = 19,
    MsgCheckNotify = 20,
    HeapAlloc = 21,
    HeapFree = 22,
    HeapStats = 23,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the kernel doesn't currently depend on `num-traits`
/// and this seems okay.
impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::StartFirstThread),
            1 => Ok(Self::Yield),
            2 => Ok(Self::Sleep),
            3 => Ok(Self::TickCount),
            4 => Ok(Self::MutexCreate),
            5 => Ok(Self::MutexDestroy),
            6 => Ok(Self::MutexLock),
            7 => Ok(Self::MutexTryLock),
            8 => Ok(Self::MutexUnlock),
            9 => Ok(Self::SemCreate),
            10 => Ok(Self::SemDestroy),
            11 => Ok(Self::SemWait),
            12 => Ok(Self::SemTryWait),
            13 => Ok(Self::SemSignal),
            14 => Ok(Self::MsgSend),
            15 => Ok(Self::MsgReceive),
            16 => Ok(Self::MsgReply),
            17 => Ok(Self::MsgTrySend),
            18 => Ok(Self::MsgTryReceive),
            19 => Ok(Self::MsgNotify),
            20 => Ok(Self::MsgCheckNotify),
            21 => Ok(Self::HeapAlloc),
            22 => Ok(Self::HeapFree),
            23 => Ok(Self::HeapStats),
            _ => Err(()),
        }
    }
}

/// FNV-1a hash of a service name, used as the `service` field of request
/// messages so a server can tell which of its published APIs a `method`
/// belongs to.
pub const fn service_hash(name: &str) -> u32 {
    let bytes = name.as_bytes();
    let mut hash: u32 = 0x811C_9DC5;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        i += 1;
    }
    hash
}
