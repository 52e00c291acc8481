use std::cell::RefCell;
use std::collections::VecDeque;

use super::{run_isolated, Executor, Task};

thread_local! {
    // `Some` while this thread is draining inline work.
    static TRAMPOLINE: RefCell<Option<VecDeque<Task>>> = const { RefCell::new(None) };
}

/// Runs tasks on the submitting thread.
///
/// The outermost `execute` on a thread runs its task and then drains every
/// task submitted while it was running, in submission order. Inner calls only
/// enqueue. Blocking inside an inline task on a future that another queued
/// inline task would complete therefore never finishes; use a pool executor
/// for such continuations.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Task) {
        let first = TRAMPOLINE.with(|slot| {
            let mut slot = slot.borrow_mut();
            match slot.as_mut() {
                Some(queue) => {
                    queue.push_back(task);
                    None
                }
                None => {
                    *slot = Some(VecDeque::new());
                    Some(task)
                }
            }
        });
        let Some(first) = first else {
            return;
        };

        run_isolated(first);
        while let Some(next) =
            TRAMPOLINE.with(|slot| slot.borrow_mut().as_mut().and_then(VecDeque::pop_front))
        {
            run_isolated(next);
        }
        TRAMPOLINE.with(|slot| *slot.borrow_mut() = None);
    }
}
