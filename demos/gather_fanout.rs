use std::time::Duration;

use coro_loop::{gather, sleep, EventLoop, Task};

fn main() -> coro_loop::Result<()> {
    tracing_subscriber::fmt::init();

    let mut ev = EventLoop::new();
    let (greeting, answer, bytes) = ev.run_until_complete(Task::new(async {
        gather((
            async {
                sleep(Duration::from_millis(300)).await?;
                Ok(String::from("hello"))
            },
            async {
                sleep(Duration::from_millis(100)).await?;
                Ok(42u32)
            },
            async {
                sleep(Duration::from_millis(200)).await?;
                Ok(vec![1u8, 2, 3])
            },
        ))
        .await
    }))?;

    println!(
        "gathered ({:?}, {}, {:?}) in {:?} of loop time",
        greeting,
        answer,
        bytes,
        ev.time()
    );
    Ok(())
}
