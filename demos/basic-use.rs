use std::cell::Cell;
use std::rc::Rc;

use spindle::{Fiber, State};

fn main() {
    let counter = Rc::new(Cell::new(0));
    let mut fibers = vec![];
    for i in 0..4 {
        let c = counter.clone();
        let fiber = Fiber::new(
            move || {
                for _ in 0..3 {
                    c.set(c.get() + 1);
                    println!("Fiber {} incremented counter to {}", i, c.get());
                    spindle::yield_now();
                }
            },
            0,
            false,
        );
        fibers.push(fiber);
    }

    while fibers.iter().any(|fiber| fiber.state() != State::Term) {
        for fiber in fibers.iter().filter(|fiber| fiber.state() == State::Ready) {
            fiber.resume();
        }
    }
    println!("Final counter value: {}, live fibers: {}", counter.get(), Fiber::total_live());
}
