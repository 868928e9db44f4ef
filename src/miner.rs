//! Proof of work for BYOB blocks
//!
//! A block is solved by a 32-byte compliment `c` such that
//! `sha256(c ^ hash) <= target`, comparing big-endian. The search is a plain
//! random walk and runs on a dedicated worker thread; callers talk to it
//! through channels and get a [`SolveTicket`] back for every request.

use crate::crypto::Sha256Hash;
use crate::error::ChainError;
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use primitive_types::U256;
use rand::{rngs::StdRng, RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

pub type Compliment = [u8; 32];
pub type Target = [u8; 32];

/// Attempts between two looks at the command channel.
const DEFAULT_BATCH_SIZE: usize = 4096;

pub fn xor(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}

/// The digest compared against the target.
pub fn pow_digest(compliment: &Compliment, hash: &Sha256Hash) -> Sha256Hash {
    Sha256::digest(xor(compliment, hash)).into()
}

/// Byte-wise big-endian comparison of the digest against `target`.
pub fn is_solution(compliment: &Compliment, hash: &Sha256Hash, target: &Target) -> bool {
    pow_digest(compliment, hash) <= *target
}

/// Target giving one solution per `target_time` for a searcher trying
/// `hash_rate` compliments per time unit.
pub fn calculate_target(hash_rate: u64, target_time: u64) -> Result<Target, ChainError> {
    if hash_rate == 0 || target_time == 0 {
        return Err(ChainError::SolverError(
            "hash rate and target time must be positive".to_string(),
        ));
    }
    let target = U256::MAX / U256::from(target_time) / U256::from(hash_rate);
    let mut bytes = [0u8; 32];
    target.to_big_endian(&mut bytes);
    Ok(bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Problem {
    pub hash: Sha256Hash,
    pub target: Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Solution {
    pub problem: Problem,
    pub compliment: Compliment,
}

#[derive(Debug)]
enum Command {
    Solve(Problem),
    Stop,
}

/// Outstanding requests. Only the latest request is kept alive when a
/// solution for some other problem arrives.
#[derive(Default)]
struct Waiters {
    latest: Option<Problem>,
    pending: Vec<(Problem, oneshot::Sender<Option<Compliment>>)>,
}

impl Waiters {
    fn register(&mut self, problem: Problem) -> oneshot::Receiver<Option<Compliment>> {
        let (tx, rx) = oneshot::channel();
        self.latest = Some(problem);
        self.pending.push((problem, tx));
        rx
    }

    fn resolve(&mut self, solution: &Solution) {
        let latest = self.latest;
        let mut kept = Vec::new();
        for (problem, tx) in self.pending.drain(..) {
            if problem == solution.problem {
                let _ = tx.send(Some(solution.compliment));
            } else if Some(problem) == latest {
                kept.push((problem, tx));
            } else {
                let _ = tx.send(None);
            }
        }
        self.pending = kept;
    }

    fn cancel_all(&mut self) {
        self.latest = None;
        for (_, tx) in self.pending.drain(..) {
            let _ = tx.send(None);
        }
    }
}

/// Resolves to the compliment for the requested problem, or `None` once the
/// request has been superseded or the solver restarted.
#[derive(Debug)]
pub struct SolveTicket {
    pub problem: Problem,
    receiver: oneshot::Receiver<Option<Compliment>>,
}

impl SolveTicket {
    /// Blocks the current thread until the ticket resolves.
    pub fn wait_blocking(self) -> Option<Compliment> {
        self.receiver.blocking_recv().ok().flatten()
    }
}

impl Future for SolveTicket {
    type Output = Option<Compliment>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.ok().flatten())
    }
}

/// Decrements the live worker count when the worker thread ends.
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle to the proof of work worker.
pub struct Solver {
    commands: Sender<Command>,
    worker: Option<JoinHandle<()>>,
    solutions: Sender<Solution>,
    waiters: Arc<Mutex<Waiters>>,
    live: Arc<AtomicUsize>,
    batch_size: usize,
}

impl Solver {
    pub fn new() -> Result<Self, ChainError> {
        Self::with_batch_size(DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size(batch_size: usize) -> Result<Self, ChainError> {
        let waiters = Arc::new(Mutex::new(Waiters::default()));
        let (solutions, solution_rx) = unbounded::<Solution>();

        let dispatch_waiters = Arc::clone(&waiters);
        thread::Builder::new()
            .name("byob-solver-dispatch".to_string())
            .spawn(move || {
                for solution in solution_rx.iter() {
                    trace!("Dispatching solution for {}", hex::encode(&solution.problem.hash[..8]));
                    dispatch_waiters.lock().resolve(&solution);
                }
            })?;

        let (commands, _) = unbounded();
        let mut solver = Solver {
            commands,
            worker: None,
            solutions,
            waiters,
            live: Arc::new(AtomicUsize::new(0)),
            batch_size: batch_size.max(1),
        };
        solver.spawn_worker()?;
        Ok(solver)
    }

    fn spawn_worker(&mut self) -> Result<(), ChainError> {
        let (commands, command_rx) = unbounded();
        let solutions = self.solutions.clone();
        let live = Arc::clone(&self.live);
        let batch_size = self.batch_size;

        self.live.fetch_add(1, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name("byob-solver".to_string())
            .spawn(move || {
                let _guard = LiveGuard(live);
                run_worker(command_rx, solutions, batch_size);
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        self.commands = commands;
        self.worker = Some(handle);
        debug!("Solver worker started");
        Ok(())
    }

    fn stop_worker(&mut self) {
        let _ = self.commands.send(Command::Stop);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("Solver worker panicked");
            }
        }
    }

    /// Asks the worker to solve `hash` under `target`. Any earlier request
    /// stops being worked on and resolves to `None` once a solution for a
    /// different problem is found.
    pub fn solve(&mut self, hash: Sha256Hash, target: Target) -> Result<SolveTicket, ChainError> {
        let finished = self.worker.as_ref().map_or(true, |w| w.is_finished());
        if finished {
            warn!("Solver worker is gone, spawning a new one");
            self.stop_worker();
            self.spawn_worker()?;
        }

        let problem = Problem { hash, target };
        let receiver = self.waiters.lock().register(problem);
        self.commands
            .send(Command::Solve(problem))
            .map_err(|e| ChainError::SolverError(format!("worker unreachable: {}", e)))?;

        Ok(SolveTicket { problem, receiver })
    }

    /// Stops the worker, resolves every outstanding ticket to `None` and
    /// starts a fresh worker.
    pub fn restart(&mut self) -> Result<(), ChainError> {
        self.stop_worker();
        self.waiters.lock().cancel_all();
        self.spawn_worker()
    }

    /// Number of worker threads currently running.
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl Drop for Solver {
    fn drop(&mut self) {
        self.stop_worker();
        self.waiters.lock().cancel_all();
    }
}

fn run_worker(commands: Receiver<Command>, solutions: Sender<Solution>, batch_size: usize) {
    let mut rng = StdRng::from_entropy();
    let mut current: Option<Problem> = None;

    loop {
        if current.is_none() {
            match commands.recv() {
                Ok(Command::Solve(problem)) => current = Some(problem),
                Ok(Command::Stop) | Err(_) => return,
            }
        }

        // only the newest request matters
        loop {
            match commands.try_recv() {
                Ok(Command::Solve(problem)) => current = Some(problem),
                Ok(Command::Stop) | Err(TryRecvError::Disconnected) => return,
                Err(TryRecvError::Empty) => break,
            }
        }

        let Some(problem) = current else {
            continue;
        };

        let mut compliment = [0u8; 32];
        for _ in 0..batch_size {
            rng.fill_bytes(&mut compliment);
            if is_solution(&compliment, &problem.hash, &problem.target) {
                if solutions.send(Solution { problem, compliment }).is_err() {
                    return;
                }
                current = None;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const EASY: Target = [0xFF; 32];
    const IMPOSSIBLE: Target = [0x00; 32];

    fn medium() -> Target {
        let mut target = [0xFF; 32];
        target[0] = 0x0F;
        target
    }

    #[test]
    fn test_xor() {
        let a = [0b1010_1010u8; 32];
        let b = [0b0110_0110u8; 32];
        assert_eq!(xor(&a, &b), [0b1100_1100u8; 32]);
        assert_eq!(xor(&a, &a), [0u8; 32]);
    }

    #[test]
    fn test_is_solution_bounds() {
        let hash = [5u8; 32];
        let compliment = [9u8; 32];
        assert!(is_solution(&compliment, &hash, &EASY));
        assert!(!is_solution(&compliment, &hash, &IMPOSSIBLE));

        let digest = pow_digest(&compliment, &hash);
        assert!(is_solution(&compliment, &hash, &digest));
    }

    #[test]
    fn test_is_solution_is_monotonic() {
        let hash = [0x42u8; 32];
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let mut compliment = [0u8; 32];
            rng.fill_bytes(&mut compliment);
            let mut tight = [0u8; 32];
            rng.fill_bytes(&mut tight);
            let mut loose = tight;
            loose[0] = loose[0].saturating_add(1);

            if is_solution(&compliment, &hash, &tight) {
                assert!(is_solution(&compliment, &hash, &loose));
            }
        }
    }

    #[test]
    fn test_calculate_target() {
        assert_eq!(calculate_target(1, 1).unwrap(), [0xFF; 32]);

        let halved = calculate_target(2, 1).unwrap();
        assert_eq!(halved[0], 0x7F);
        assert!(halved[1..].iter().all(|b| *b == 0xFF));

        assert_eq!(calculate_target(1, 2).unwrap(), halved);
        assert!(calculate_target(0, 1).is_err());
        assert!(calculate_target(1, 0).is_err());
    }

    #[test]
    fn test_solver_finds_solution() {
        let mut solver = Solver::new().unwrap();
        let hash = [1u8; 32];
        let target = medium();
        let compliment = solver
            .solve(hash, target)
            .unwrap()
            .wait_blocking()
            .expect("solution");
        assert!(is_solution(&compliment, &hash, &target));
    }

    #[tokio::test]
    async fn test_ticket_is_a_future() {
        let mut solver = Solver::new().unwrap();
        let hash = [2u8; 32];
        let ticket = solver.solve(hash, EASY).unwrap();
        let compliment = tokio::time::timeout(Duration::from_secs(10), ticket)
            .await
            .unwrap()
            .unwrap();
        assert!(is_solution(&compliment, &hash, &EASY));
    }

    #[test]
    fn test_superseded_request_resolves_to_none() {
        let mut solver = Solver::with_batch_size(64).unwrap();
        let stale = solver.solve([3u8; 32], IMPOSSIBLE).unwrap();
        let fresh = solver.solve([4u8; 32], EASY).unwrap();

        let fresh_hash = fresh.problem.hash;
        let compliment = fresh.wait_blocking().expect("fresh request is answered");
        assert!(is_solution(&compliment, &fresh_hash, &EASY));
        assert_eq!(stale.wait_blocking(), None);
    }

    #[test]
    fn test_restart_cancels_and_keeps_one_worker() {
        let mut solver = Solver::with_batch_size(64).unwrap();
        let ticket = solver.solve([5u8; 32], IMPOSSIBLE).unwrap();
        solver.restart().unwrap();
        assert_eq!(ticket.wait_blocking(), None);
        assert_eq!(solver.live_workers(), 1);

        solver.restart().unwrap();
        assert_eq!(solver.live_workers(), 1);

        let after = solver.solve([6u8; 32], EASY).unwrap();
        assert!(after.wait_blocking().is_some());
    }

    #[test]
    fn test_drop_stops_worker() {
        let solver = Solver::new().unwrap();
        let live = Arc::clone(&solver.live);
        drop(solver);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }
}
