//! Repository lock manager
//!
//! Serializes every push/fetch against one logical repository across all
//! gateway instances sharing a depot. The lock is not an in-process mutex:
//! mutual exclusion comes from the depot's atomic counter increment, so it
//! holds across hosts.
//!
//! ## Protocol
//!
//! - Acquire: atomically increment the lock counter; the process that
//!   observes the value 1 owns the lock. Any other value means someone
//!   else holds it, and the caller waits. Acquisition never times out.
//! - Heartbeat: the holder writes a liveness token (host, pid, beat
//!   number) to a companion counter, refreshed by a pacemaker thread.
//! - Reap: a blocked waiter watches the heartbeat; when it has not changed
//!   for the staleness window the holder is presumed dead and the waiter
//!   clears the counter pair, atomically and only while the heartbeat
//!   still holds the stale token, then retries immediately. Recovery is
//!   driven by liveness evidence, never by a blind lock timeout.
//! - Release: delete the heartbeat then the lock counter. The next
//!   waiter's increment observes 1 and wins.

use crate::areas::depot::Depot;
use crate::errors::GatewayResult;
use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Tunable lock timings. Defaults mirror production behavior; tests
/// shrink them so reap scenarios finish quickly.
#[derive(Debug, Clone, Copy)]
pub struct LockParams {
    /// How often a blocked waiter retries the acquisition.
    pub retry_period: Duration,
    /// How long an unchanged heartbeat marks its holder as dead.
    pub stale_after: Duration,
    /// How often the holder's pacemaker refreshes the heartbeat.
    pub heart_rate: Duration,
}

impl Default for LockParams {
    fn default() -> Self {
        LockParams {
            retry_period: Duration::from_millis(500),
            stale_after: Duration::from_secs(60),
            heart_rate: Duration::from_secs(10),
        }
    }
}

fn lock_counter_name(repo_id: &str) -> String {
    format!("git-{}-lock", repo_id)
}

fn heartbeat_counter_name(repo_id: &str) -> String {
    format!("git-{}-lock-heartbeat", repo_id)
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|raw| raw.trim().to_string())
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}

fn heartbeat_content(beat: u64) -> String {
    format!(
        "{} {} {} {}",
        hostname(),
        std::process::id(),
        chrono::Local::now().timestamp(),
        beat
    )
}

/// Is the pid named in a heartbeat token still alive on this host?
/// Returns None when the token belongs to another host and local
/// liveness cannot be judged.
fn holder_alive_locally(heartbeat: &str) -> Option<bool> {
    let mut parts = heartbeat.split(' ');
    let host = parts.next()?;
    let pid = parts.next()?.parse::<u32>().ok()?;
    if host != hostname() {
        return None;
    }
    Some(std::path::Path::new(&format!("/proc/{}", pid)).exists())
}

struct Pacemaker {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Pacemaker {
    fn start(depot: Arc<Depot>, repo_id: String, heart_rate: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = std::thread::spawn(move || {
            let hb_name = heartbeat_counter_name(&repo_id);
            let mut beat: u64 = 1;
            let tick = Duration::from_millis(25).min(heart_rate);
            let mut since_beat = Duration::ZERO;
            while !stop_flag.load(Ordering::Relaxed) {
                std::thread::sleep(tick);
                since_beat += tick;
                if since_beat < heart_rate {
                    continue;
                }
                since_beat = Duration::ZERO;
                beat += 1;
                if let Err(e) = depot.counter_set(&hb_name, &heartbeat_content(beat)) {
                    tracing::warn!(repo = %repo_id, error = %e, "heartbeat update failed");
                }
            }
        });
        Pacemaker {
            stop,
            handle: Some(handle),
        }
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Pacemaker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// An acquired repository lock. Releases on `release()` and on `Drop`,
/// covering every exit path including panics inside a push.
pub struct RepoLock {
    depot: Arc<Depot>,
    repo_id: String,
    holder: String,
    pacemaker: Option<Pacemaker>,
    released: bool,
    stolen: bool,
}

impl RepoLock {
    /// Block until the repository lock is acquired.
    ///
    /// Never times out: an arbitrary timeout could abort a legitimately
    /// long push. Abandoned locks are reaped opportunistically while
    /// waiting.
    pub fn acquire(
        depot: Arc<Depot>,
        repo_id: &str,
        holder: &str,
        params: LockParams,
    ) -> GatewayResult<RepoLock> {
        let lock_name = lock_counter_name(repo_id);
        let hb_name = heartbeat_counter_name(repo_id);

        let mut alerted = false;
        let mut stolen = false;
        let mut last_beat = depot.counter_get(&hb_name)?;
        let mut last_beat_changed = Instant::now();

        loop {
            if depot.counter_increment(&lock_name)? == 1 {
                depot.counter_set(&hb_name, &heartbeat_content(1))?;
                let pacemaker =
                    Pacemaker::start(depot.clone(), repo_id.to_string(), params.heart_rate);
                tracing::debug!(repo = repo_id, holder, stolen, "acquired repository lock");
                return Ok(RepoLock {
                    depot,
                    repo_id: repo_id.to_string(),
                    holder: holder.to_string(),
                    pacemaker: Some(pacemaker),
                    released: false,
                    stolen,
                });
            }

            // Let the client know we're waiting for a lock.
            if !alerted {
                eprintln!(
                    "{}",
                    "Waiting for access to repository...".yellow()
                );
                alerted = true;
            }

            // Check on the lock holder's status, maybe clear the lock.
            let beat = depot.counter_get(&hb_name)?;
            if beat != last_beat {
                last_beat = beat;
                last_beat_changed = Instant::now();
            } else {
                let confirmed_dead = last_beat
                    .as_deref()
                    .and_then(holder_alive_locally)
                    .map(|alive| !alive)
                    .unwrap_or(false);
                if confirmed_dead || last_beat_changed.elapsed() >= params.stale_after {
                    // clear only while the heartbeat still holds the stale
                    // token; a racing waiter that already took over keeps
                    // its lock
                    if depot.counter_clear_pair_if(
                        &lock_name,
                        &hb_name,
                        last_beat.as_deref(),
                    )? {
                        tracing::warn!(repo = repo_id, "releasing abandoned repository lock");
                        stolen = true;
                    }
                    last_beat = depot.counter_get(&hb_name)?;
                    last_beat_changed = Instant::now();
                    // skip the sleep and retry immediately
                    continue;
                }
            }

            std::thread::sleep(params.retry_period);
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Did acquisition have to clear a dead holder's lock first?
    pub fn was_stolen(&self) -> bool {
        self.stolen
    }

    /// Release the lock. Safe to call once; `Drop` covers the rest.
    pub fn release(&mut self) -> GatewayResult<()> {
        if self.released {
            return Ok(());
        }
        if let Some(mut pacemaker) = self.pacemaker.take() {
            pacemaker.stop();
        }
        self.depot
            .counter_delete(&heartbeat_counter_name(&self.repo_id))?;
        self.depot
            .counter_delete(&lock_counter_name(&self.repo_id))?;
        self.released = true;
        tracing::debug!(repo = %self.repo_id, holder = %self.holder, "released repository lock");
        Ok(())
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(repo = %self.repo_id, error = %e, "lock release on drop failed");
        }
    }
}

/// Check a repository lock's holder for liveness and force-release the
/// lock if the holder is confirmed dead. Returns whether a lock was
/// cleared.
///
/// This is the standalone entry point used by the reaper command; blocked
/// acquisitions run the same check inline.
pub fn reap_abandoned(depot: &Depot, repo_id: &str, params: LockParams) -> GatewayResult<bool> {
    let lock_name = lock_counter_name(repo_id);
    let hb_name = heartbeat_counter_name(repo_id);

    if depot.counter_get(&lock_name)?.is_none() {
        return Ok(false);
    }

    let first = depot.counter_get(&hb_name)?;
    let confirmed_dead = match first.as_deref().and_then(holder_alive_locally) {
        Some(alive) => !alive,
        None => {
            // Foreign host or unreadable token: judge by heartbeat movement.
            std::thread::sleep(params.stale_after);
            depot.counter_get(&hb_name)? == first
        }
    };

    if !confirmed_dead {
        return Ok(false);
    }

    let cleared = depot.counter_clear_pair_if(&lock_name, &hb_name, first.as_deref())?;
    if cleared {
        tracing::warn!(repo = repo_id, "reaped lock left by dead holder");
    }
    Ok(cleared)
}
