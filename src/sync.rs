#[cfg(feature = "loom")]
mod imp {
    pub(crate) use loom::{
        sync::{
            Condvar, Mutex, MutexGuard,
            atomic::{AtomicBool, Ordering},
        },
        thread,
    };
    use std::sync::Arc;

    pub(crate) type WorkerPoolError = core::convert::Infallible;

    /// Background worker threads, joined on shutdown so the model checker sees
    /// every thread run to completion.
    #[derive(Debug)]
    pub(crate) struct WorkerPool(Vec<thread::JoinHandle<()>>);

    impl WorkerPool {
        pub(crate) fn spawn(
            count: usize,
            _name_prefix: &str,
            worker: impl Fn(usize) + Send + Sync + 'static,
        ) -> Result<Self, WorkerPoolError> {
            let worker = Arc::new(worker);
            let handles = (0..count)
                .map(|index| {
                    let worker = Arc::clone(&worker);
                    thread::spawn(move || worker(index))
                })
                .collect();
            Ok(Self(handles))
        }

        pub(crate) fn shutdown(self) {
            for handle in self.0 {
                // A panicking worker has already been accounted for as stopped.
                let _ = handle.join();
            }
        }
    }
}

#[cfg(not(feature = "loom"))]
mod imp {
    use rayon::{ThreadPool, ThreadPoolBuilder};
    pub(crate) use std::sync::{
        Condvar, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    };
    use std::sync::Arc;

    pub(crate) type WorkerPoolError = rayon::ThreadPoolBuildError;

    /// Dedicated rayon pool where every thread runs exactly one long-lived
    /// worker loop.
    #[derive(Debug)]
    pub(crate) struct WorkerPool(ThreadPool);

    impl WorkerPool {
        pub(crate) fn spawn(
            count: usize,
            name_prefix: &str,
            worker: impl Fn(usize) + Send + Sync + 'static,
        ) -> Result<Self, WorkerPoolError> {
            let prefix = name_prefix.to_owned();
            let pool = ThreadPoolBuilder::new()
                .num_threads(count)
                .thread_name(move |index| format!("{prefix}-{index}"))
                // Rayon aborts the process on an unhandled job panic.
                .panic_handler(|payload| {
                    tracing::error!(
                        panic = %crate::utils::panic_message(payload),
                        "executor thread panicked"
                    );
                })
                .build()?;
            let worker = Arc::new(worker);
            // Each loop blocks its thread until the shared queue closes, so `count`
            // spawns occupy the `count` threads one-to-one.
            for index in 0..count {
                let worker = Arc::clone(&worker);
                pool.spawn(move || worker(index));
            }
            Ok(Self(pool))
        }

        pub(crate) fn shutdown(self) {
            drop(self.0);
        }
    }
}

pub(crate) use imp::*;
