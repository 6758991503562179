use std::time::Duration;

use coro_loop::{schedule_task, sleep, EventLoop, Task};

fn say_after(delay: Duration, what: &'static str) -> Task<&'static str> {
    Task::new(async move {
        sleep(delay).await?;
        println!("{}", what);
        Ok(what)
    })
}

fn main() -> coro_loop::Result<()> {
    tracing_subscriber::fmt::init();

    let mut ev = EventLoop::new();
    let first = ev.run_until_complete(Task::new(async {
        let task1 = schedule_task(say_after(Duration::from_millis(100), "hello"))?;
        let task2 = schedule_task(say_after(Duration::from_millis(200), "world"))?;
        let first = task1.await?;
        task2.cancel();
        Ok(first)
    }))?;
    println!("first finisher: {:?} at loop time {:?}", first, ev.time());
    Ok(())
}
