//! Terminated fibers go back to a pool and get a new callback with `reset`,
//! so their stacks are allocated once.

use std::rc::Rc;

use spindle::{Fiber, State};

struct Pool {
    idle: Vec<Rc<Fiber>>,
}

impl Pool {
    fn run<F: FnOnce() + 'static>(&mut self, job: F) -> Rc<Fiber> {
        match self.idle.pop() {
            Some(fiber) => {
                fiber.reset(job);
                fiber
            }
            None => Fiber::new(job, 32 * 1024, false),
        }
    }

    fn recycle(&mut self, fiber: Rc<Fiber>) {
        assert_eq!(fiber.state(), State::Term);
        self.idle.push(fiber);
    }
}

fn main() {
    let mut pool = Pool { idle: vec![] };
    for round in 0..3 {
        let fibers: Vec<_> = (0..2)
            .map(|job| {
                pool.run(move || {
                    println!("round {} job {} on fiber {}", round, job, Fiber::current_id());
                    spindle::yield_now();
                    println!("round {} job {} done", round, job);
                })
            })
            .collect();
        for fiber in &fibers {
            fiber.resume();
        }
        for fiber in &fibers {
            fiber.resume();
        }
        fibers.into_iter().for_each(|fiber| pool.recycle(fiber));
    }
    println!("{} fibers served every round", Fiber::total_live() - 1);
}
