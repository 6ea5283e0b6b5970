//! A test-runner for flushing out data-races and race-conditions.

use std::{
    hint,
    sync::{Arc, atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering}},
    thread::{self, JoinHandle},
};

/// Lockstep runs a step on multiple threads, for a number of rounds, with all threads starting each round together.
///
/// -   The Shared state is shared across all threads.
/// -   Each thread owns one instance of the Local state, returned on `join`.
///
/// If any thread panics, the other threads panic at the next rendez-vous rather than waiting forever.
///
/// #   Example
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use hpmalloc_test::Lockstep;
///
/// let mut lockstep = Lockstep::launch(AtomicUsize::new(0), vec!(1, 10), 4, |shared: &AtomicUsize, local: &mut usize, _| {
///     shared.fetch_add(*local, Ordering::Relaxed);
/// });
///
/// assert_eq!(vec!(1, 10), lockstep.join());
/// assert_eq!(44, lockstep.shared().load(Ordering::Relaxed));
/// ```
pub struct Lockstep<Shared, Local> {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<Local>>,
}

impl<Shared, Local> Lockstep<Shared, Local>
    where
        Shared: Send + Sync + 'static,
        Local: Send + 'static,
{
    /// Spawns one thread per `locals`, each invoking `step` once per round, for `rounds` rounds.
    ///
    /// The step is invoked with the shared state, the thread's local state, and the index of the round.
    pub fn launch<Step>(shared: Shared, locals: Vec<Local>, rounds: usize, step: Step) -> Self
        where
            Step: Fn(&Shared, &mut Local, usize) + Send + Sync + 'static,
    {
        assert!(!locals.is_empty(), "Cannot run in lockstep without a single thread");

        let shared = Arc::new(shared);
        let step = Arc::new(step);
        let barrier = Arc::new(Barrier::new(locals.len()));

        let threads = locals.into_iter().map(|mut local| {
            let shared = shared.clone();
            let step = step.clone();
            let barrier = barrier.clone();

            thread::spawn(move || {
                let guard = PoisonGuard(Some(barrier.clone()));

                for round in 0..rounds {
                    barrier.wait();

                    step(&*shared, &mut local, round);
                }

                barrier.wait();

                guard.dismiss();

                local
            })
        }).collect();

        Self { shared, threads }
    }
}

impl<Shared, Local> Lockstep<Shared, Local> {
    /// Returns a reference to the Shared state.
    ///
    /// #   Warning
    ///
    /// Access is provided _without_ joining the threads first.
    pub fn shared(&self) -> &Shared { &*self.shared }

    /// Joins the threads, returning their Local states in the order they were provided.
    ///
    /// Returns an empty vector if already joined.
    ///
    /// #   Panics
    ///
    /// -   If any of the threads panicked.
    pub fn join(&mut self) -> Vec<Local> {
        self.threads.drain(..)
            .map(|handle| handle.join().expect("No panic in lockstep thread"))
            .collect()
    }
}

impl<Shared, Local> Drop for Lockstep<Shared, Local> {
    fn drop(&mut self) {
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

//
//  Implementation details
//

//  If a single thread panics, all other threads must stop waiting for it.
struct PoisonGuard(Option<Arc<Barrier>>);

impl PoisonGuard {
    fn dismiss(mut self) { self.0 = None; }
}

impl Drop for PoisonGuard {
    fn drop(&mut self) {
        if let Some(barrier) = self.0.take() {
            barrier.poison();
        }
    }
}

//  A reusable spinning barrier.
//
//  The last thread to arrive resets the count, then bumps the generation, releasing the others.
struct Barrier {
    count: isize,
    remaining: AtomicIsize,
    generation: AtomicUsize,
    poisoned: AtomicBool,
}

impl Barrier {
    fn new(count: usize) -> Self {
        assert!(count <= (isize::MAX as usize));

        Self {
            count: count as isize,
            remaining: AtomicIsize::new(count as isize),
            generation: AtomicUsize::new(0),
            poisoned: AtomicBool::new(false),
        }
    }

    fn poison(&self) { self.poisoned.store(true, Ordering::Release); }

    fn wait(&self) {
        let generation = self.generation.load(Ordering::Acquire);

        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.remaining.store(self.count, Ordering::Relaxed);
            self.generation.fetch_add(1, Ordering::Release);
            return;
        }

        while self.generation.load(Ordering::Acquire) == generation {
            if self.poisoned.load(Ordering::Acquire) {
                self.abandon_ship();
            }

            hint::spin_loop();
        }
    }

    //  Internal.
    #[cold]
    #[inline(never)]
    fn abandon_ship(&self) -> ! {
        panic!("Someone poisoned the well!");
    }
}
