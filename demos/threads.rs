//! A small multi-threaded host. Linking `memtrack` in is the same as
//! preloading it: `malloc` and `free` below land in the interposer.
//!
//! ```plaintext
//! RUST_LOG=memtrack=trace cargo run --example threads
//! ```

use memtrack as _;

const THREADS: usize = 4;

fn main() {
    env_logger::init();
    crossbeam::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|_| {
                for i in 1..=10 {
                    unsafe {
                        let buf = libc::malloc(4_000_000 * i);
                        libc::free(buf);
                    }
                }
            });
        }
    })
    .expect("a worker panicked");
}
