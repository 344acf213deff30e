//! A toy round-robin loop acting as the scheduler hub of the main thread.

use std::collections::VecDeque;
use std::rc::Rc;

use spindle::{Fiber, State, runtime};

fn main() {
    // the loop runs on the thread root, so it is the hub
    let hub = Fiber::current();
    runtime::set_hub_fiber(&hub);

    let mut run_queue: VecDeque<Rc<Fiber>> = (0..3)
        .map(|i| {
            Fiber::new(
                move || {
                    for step in 0..i + 1 {
                        println!("task {} step {}", i, step);
                        spindle::yield_now();
                    }
                },
                0,
                true,
            )
        })
        .collect();

    while let Some(fiber) = run_queue.pop_front() {
        fiber.resume();
        match fiber.state() {
            State::Ready => run_queue.push_back(fiber),
            State::Term => println!("fiber {} finished", fiber.id()),
            State::Running => unreachable!(),
        }
    }

    runtime::clear_hub_fiber();
}
