// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Priority-sorted wait queues.
//!
//! A wait queue is just a head index; the links are the `next_wait` fields
//! threaded through the TCB pool, so enqueueing a blocked thread allocates
//! nothing. The queue is kept sorted by `current_priority`, most important
//! first, with FIFO order among equals -- which makes removal-of-head both
//! O(1) and the correct wake policy for mutexes, semaphores, and mailbox
//! sender queues alike.
//!
//! The sort key is the priority *at insertion time*. Priority-inheritance
//! boosts do not re-sort queues the boosted thread is already waiting in;
//! the inheritance protocol only ever boosts queue *owners*, and an owner is
//! never simultaneously a waiter on its own queue.

use abi::ThreadId;

use crate::thread::Pool;

/// Inserts `id` behind every queued thread of equal or higher priority.
pub fn insert(pool: &mut Pool, head: &mut Option<ThreadId>, id: ThreadId) {
    let priority = pool[id].current_priority();
    pool[id].set_next_wait(None);

    let Some(first) = *head else {
        *head = Some(id);
        return;
    };

    if priority.is_more_important_than(pool[first].current_priority()) {
        pool[id].set_next_wait(Some(first));
        *head = Some(id);
        return;
    }

    let mut prev = first;
    loop {
        match pool[prev].next_wait() {
            None => {
                pool[prev].set_next_wait(Some(id));
                return;
            }
            Some(next) => {
                if priority
                    .is_more_important_than(pool[next].current_priority())
                {
                    pool[id].set_next_wait(Some(next));
                    pool[prev].set_next_wait(Some(id));
                    return;
                }
                prev = next;
            }
        }
    }
}

/// Pops the most important waiter, or `None` if the queue is empty.
pub fn remove_head(pool: &mut Pool, head: &mut Option<ThreadId>) -> Option<ThreadId> {
    let first = (*head)?;
    *head = pool[first].next_wait();
    pool[first].set_next_wait(None);
    Some(first)
}

/// Unlinks a specific thread, wherever it sits in the queue. A no-op if the
/// thread is not queued here.
pub fn remove(pool: &mut Pool, head: &mut Option<ThreadId>, id: ThreadId) {
    let Some(first) = *head else {
        return;
    };

    if first == id {
        remove_head(pool, head);
        return;
    }

    let mut prev = first;
    while let Some(next) = pool[prev].next_wait() {
        if next == id {
            let new_next = pool[id].next_wait();
            pool[prev].set_next_wait(new_next);
            pool[id].set_next_wait(None);
            return;
        }
        prev = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::pool_with;

    fn drain(pool: &mut Pool, head: &mut Option<ThreadId>) -> Vec<ThreadId> {
        let mut out = Vec::new();
        while let Some(id) = remove_head(pool, head) {
            out.push(id);
        }
        out
    }

    #[test]
    fn orders_by_priority() {
        let mut pool = pool_with(&[20, 5, 10]);
        let (t20, t5, t10) = (ThreadId(0), ThreadId(1), ThreadId(2));
        let mut head = None;
        insert(&mut pool, &mut head, t20);
        insert(&mut pool, &mut head, t5);
        insert(&mut pool, &mut head, t10);
        assert_eq!(drain(&mut pool, &mut head), vec![t5, t10, t20]);
    }

    #[test]
    fn fifo_within_a_priority() {
        let mut pool = pool_with(&[10, 10, 10, 5]);
        let mut head = None;
        for i in 0..3 {
            insert(&mut pool, &mut head, ThreadId(i));
        }
        // A more important late arrival still jumps the whole class.
        insert(&mut pool, &mut head, ThreadId(3));
        assert_eq!(
            drain(&mut pool, &mut head),
            vec![ThreadId(3), ThreadId(0), ThreadId(1), ThreadId(2)]
        );
    }

    #[test]
    fn remove_head_of_empty() {
        let mut pool = pool_with(&[]);
        let mut head = None;
        assert_eq!(remove_head(&mut pool, &mut head), None);
    }

    #[test]
    fn remove_specific_unlinks_cleanly() {
        let mut pool = pool_with(&[1, 2, 3]);
        let mut head = None;
        for i in 0..3 {
            insert(&mut pool, &mut head, ThreadId(i));
        }

        // Middle.
        remove(&mut pool, &mut head, ThreadId(1));
        assert_eq!(pool[ThreadId(1)].next_wait(), None);
        // Head.
        remove(&mut pool, &mut head, ThreadId(0));
        // Absent id is a no-op.
        remove(&mut pool, &mut head, ThreadId(7));
        assert_eq!(drain(&mut pool, &mut head), vec![ThreadId(2)]);
    }
}
