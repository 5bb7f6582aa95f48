use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use nix::unistd::{getgid, getuid, mkdtemp};
use tokio::{
    signal::unix::{signal, SignalKind},
    task::JoinHandle,
    time::{interval, sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{cmd, error::PlacerError, ui};

// ── Mount mechanism ───────────────────────────────────────────────────────────

/// Exposes one partition of a disk image as a directory.
///
/// `mount` runs in the foreground for as long as the partition stays mounted;
/// it only returns once the filesystem is released (or fails to come up).
#[async_trait]
pub trait Mounter: Send + Sync {
    async fn mount(
        &self,
        image: &Path,
        partition: u32,
        uid: u32,
        gid: u32,
        dir: &Path,
    ) -> Result<(), PlacerError>;

    /// Best effort; failures are logged by the implementation.
    async fn unmount(&self, dir: &Path);
}

/// libguestfs FUSE mounts, no root required.
pub struct GuestMounter;

#[async_trait]
impl Mounter for GuestMounter {
    async fn mount(
        &self,
        image: &Path,
        partition: u32,
        uid: u32,
        gid: u32,
        dir: &Path,
    ) -> Result<(), PlacerError> {
        let args = [
            "-a".to_string(),
            image.display().to_string(),
            "-m".to_string(),
            format!("/dev/sda{}", partition),
            "-o".to_string(),
            format!("uid={}", uid),
            "-o".to_string(),
            format!("gid={}", gid),
            "--rw".to_string(),
            dir.display().to_string(),
            "--no-fork".to_string(),
        ];
        cmd::run_async("guestmount", &args).await.map(|_| ())
    }

    async fn unmount(&self, dir: &Path) {
        cmd::run_best_effort("guestunmount", &[dir.display().to_string()]).await;
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Budget for the partition to appear, and separately for it to go away.
    pub timeout: Duration,
    pub populate_poll: Duration,
    pub unmount_poll: Duration,
    /// Pause after the directory empties, before it is removed.
    pub settle: Duration,
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            populate_poll: Duration::from_millis(500),
            unmount_poll: Duration::from_secs(1),
            settle: Duration::from_secs(1),
            attempts: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MountState {
    Created,
    Mounting,
    Mounted,
    Unmounting,
    Closed,
}

struct MountSession {
    partition: u32,
    dir: PathBuf,
    state: MountState,
}

impl MountSession {
    fn new(partition: u32, dir: PathBuf) -> Self {
        let session = Self {
            partition,
            dir,
            state: MountState::Created,
        };
        debug!(partition, dir = %session.dir.display(), "mount session created");
        session
    }

    fn advance(&mut self, next: MountState) {
        info!(
            partition = self.partition,
            dir = %self.dir.display(),
            from = ?self.state,
            to = ?next,
            "mount session"
        );
        self.state = next;
    }
}

type MountTask = JoinHandle<Result<(), PlacerError>>;

/// Mounts `partition` of `image` on a fresh temporary directory, runs `f` on
/// it and unmounts again, whatever `f` returned.
///
/// `f` runs on the current worker thread via `block_in_place`, so it may block
/// (extraction, prompts). Requires the multi-threaded runtime.
pub async fn with_mounted_partition<T, F>(
    mounter: Arc<dyn Mounter>,
    signals: &SignalGuard,
    image: &Path,
    partition: u32,
    options: &MountOptions,
    f: F,
) -> Result<T, PlacerError>
where
    F: FnOnce(&Path) -> Result<T, PlacerError>,
{
    let dir = mkdtemp(&std::env::temp_dir().join("mount-dir-XXXXXX"))?;
    let mut session = MountSession::new(partition, dir.clone());
    signals.track(mounter.clone(), &dir);

    session.advance(MountState::Mounting);
    let populated = Arc::new(AtomicBool::new(false));
    let mut task: Option<MountTask> = Some(tokio::spawn(mount_with_retries(
        mounter.clone(),
        image.to_path_buf(),
        partition,
        dir.clone(),
        options.clone(),
        populated.clone(),
    )));

    let pb = ui::spinner(format!("Mounting partition {}…", partition));
    let result = match wait_until_populated(&mut task, &dir, options).await {
        Ok(()) => {
            populated.store(true, Ordering::SeqCst);
            session.advance(MountState::Mounted);
            ui::done_spinner(pb, &format!("Partition {} mounted.", partition));
            tokio::task::block_in_place(|| f(&dir))
        }
        Err(e) => {
            pb.finish_and_clear();
            Err(e)
        }
    };

    session.advance(MountState::Unmounting);
    release(mounter.as_ref(), &dir, options).await;
    reap(task, options.timeout).await;
    signals.clear();
    session.advance(MountState::Closed);

    result
}

// ── Mounting ──────────────────────────────────────────────────────────────────

async fn mount_with_retries(
    mounter: Arc<dyn Mounter>,
    image: PathBuf,
    partition: u32,
    dir: PathBuf,
    options: MountOptions,
    populated: Arc<AtomicBool>,
) -> Result<(), PlacerError> {
    let uid = getuid().as_raw();
    let gid = getgid().as_raw();
    let mut last_error = String::new();

    for attempt in 1..=options.attempts {
        info!(partition, attempt, dir = %dir.display(), "mounting partition");
        match mounter.mount(&image, partition, uid, gid, &dir).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(partition, attempt, error = %e, "mount attempt failed");
                last_error = e.to_string();
            }
        }
        // A mount that already served the session is not retried.
        if populated.load(Ordering::SeqCst) {
            break;
        }
        if attempt < options.attempts {
            sleep(options.retry_delay).await;
        }
    }

    Err(PlacerError::MountFailed {
        partition,
        attempts: options.attempts,
        message: last_error,
    })
}

/// Resolves with the mount task's outcome; pending forever once it was taken.
async fn join_mount(task: &mut Option<MountTask>) -> Result<(), PlacerError> {
    match task {
        Some(handle) => {
            let joined = handle.await;
            *task = None;
            match joined {
                Ok(result) => result,
                Err(e) => Err(PlacerError::Io(io::Error::other(e))),
            }
        }
        None => std::future::pending().await,
    }
}

/// Races the mount task against the population poll and the timeout.
async fn wait_until_populated(
    task: &mut Option<MountTask>,
    dir: &Path,
    options: &MountOptions,
) -> Result<(), PlacerError> {
    let deadline = sleep(options.timeout);
    tokio::pin!(deadline);
    let mut poll = interval(options.populate_poll);

    loop {
        tokio::select! {
            result = join_mount(task) => {
                result?;
                debug!(dir = %dir.display(), "mount command exited cleanly before the partition appeared");
            }
            _ = poll.tick() => {
                if is_populated(dir)? {
                    return Ok(());
                }
            }
            _ = &mut deadline => return Err(PlacerError::MountTimedOut),
        }
    }
}

fn is_populated(dir: &Path) -> Result<bool, PlacerError> {
    let mut entries = fs::read_dir(dir).map_err(PlacerError::file("read directory", dir))?;
    Ok(entries.next().is_some())
}

// ── Unmounting ────────────────────────────────────────────────────────────────

/// Sync, unmount, wait for the directory to empty, then remove it. Never fails.
async fn release(mounter: &dyn Mounter, dir: &Path, options: &MountOptions) {
    nix::unistd::sync();
    mounter.unmount(dir).await;

    let emptied = timeout(options.timeout, async {
        let mut poll = interval(options.unmount_poll);
        loop {
            poll.tick().await;
            if !is_populated(dir).unwrap_or(false) {
                break;
            }
        }
    })
    .await;
    if emptied.is_err() {
        warn!(dir = %dir.display(), "mount directory still populated after unmount timeout");
    }

    sleep(options.settle).await;
    // remove_dir, not remove_dir_all: a directory that is still mounted must
    // never be recursed into.
    if let Err(e) = fs::remove_dir(dir) {
        warn!(dir = %dir.display(), error = %e, "could not remove mount directory");
    }
}

async fn reap(task: Option<MountTask>, wait: Duration) {
    let Some(mut handle) = task else {
        return;
    };
    match timeout(wait, &mut handle).await {
        Ok(Ok(Err(e))) => debug!(error = %e, "mount command exited with an error after unmount"),
        Ok(_) => debug!("mount command finished"),
        Err(_) => {
            warn!("mount command still running after unmount, abandoning it");
            handle.abort();
        }
    }
}

// ── Signals ───────────────────────────────────────────────────────────────────

type ActiveMount = Option<(Arc<dyn Mounter>, PathBuf)>;

/// SIGINT/SIGTERM listener for the whole run. A signal unmounts the partition
/// that is mounted at the time, if any, and ends the process.
///
/// Once installed, the default signal disposition is gone for good, so the
/// listener stays alive between and after mount sessions.
#[derive(Clone)]
pub struct SignalGuard {
    active: Arc<Mutex<ActiveMount>>,
}

impl SignalGuard {
    pub fn install() -> Result<Self, PlacerError> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let guard = Self {
            active: Arc::new(Mutex::new(None)),
        };

        let active = guard.active.clone();
        tokio::spawn(async move {
            let name = tokio::select! {
                _ = sigint.recv() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            };
            let mounted = lock(&active).take();
            match mounted {
                Some((mounter, dir)) => {
                    warn!(signal = name, dir = %dir.display(), "received signal, unmounting");
                    ui::print_warning(&format!("Received {}. Unmounting {}…", name, dir.display()));
                    nix::unistd::sync();
                    mounter.unmount(&dir).await;
                }
                None => warn!(signal = name, "received signal, no partition mounted"),
            }
            std::process::exit(1);
        });
        Ok(guard)
    }

    fn track(&self, mounter: Arc<dyn Mounter>, dir: &Path) {
        *lock(&self.active) = Some((mounter, dir.to_path_buf()));
    }

    fn clear(&self) {
        lock(&self.active).take();
    }

    #[cfg(test)]
    fn is_tracking(&self) -> bool {
        lock(&self.active).is_some()
    }
}

fn lock(active: &Mutex<ActiveMount>) -> std::sync::MutexGuard<'_, ActiveMount> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicU32, time::Instant};

    use tokio::sync::Notify;

    use super::*;

    #[derive(Clone, Copy)]
    enum Behavior {
        /// Populates the directory and stays "mounted" until unmounted.
        Serve,
        /// Like `Serve`, but the directory keeps its content after unmount.
        Stuck,
        Fail,
        Hang,
    }

    struct FakeMounter {
        behavior: Behavior,
        mounts: AtomicU32,
        unmounts: AtomicU32,
        released: Notify,
    }

    impl FakeMounter {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                mounts: AtomicU32::new(0),
                unmounts: AtomicU32::new(0),
                released: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl Mounter for FakeMounter {
        async fn mount(&self, _: &Path, _: u32, _: u32, _: u32, dir: &Path) -> Result<(), PlacerError> {
            self.mounts.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Serve | Behavior::Stuck => {
                    fs::write(dir.join("etc-marker"), "").unwrap();
                    self.released.notified().await;
                    Ok(())
                }
                Behavior::Fail => Err(PlacerError::CommandFailed {
                    program: "guestmount".into(),
                    code: 1,
                    stderr: "no such partition".into(),
                }),
                Behavior::Hang => std::future::pending().await,
            }
        }

        async fn unmount(&self, dir: &Path) {
            self.unmounts.fetch_add(1, Ordering::SeqCst);
            if !matches!(self.behavior, Behavior::Stuck) {
                let _ = fs::remove_file(dir.join("etc-marker"));
            }
            self.released.notify_one();
        }
    }

    fn fast() -> MountOptions {
        MountOptions {
            timeout: Duration::from_secs(2),
            populate_poll: Duration::from_millis(10),
            unmount_poll: Duration::from_millis(10),
            settle: Duration::ZERO,
            attempts: 3,
            retry_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_runs_closure_once_populated_and_cleans_up() {
        let fake = FakeMounter::new(Behavior::Serve);
        let signals = SignalGuard::install().unwrap();
        let seen = Mutex::new(None);

        let value = with_mounted_partition(fake.clone(), &signals, Path::new("disk.img"), 2, &fast(), |dir| {
            assert!(dir.join("etc-marker").exists());
            assert!(signals.is_tracking());
            *seen.lock().unwrap() = Some(dir.to_path_buf());
            Ok(42)
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(fake.mounts.load(Ordering::SeqCst), 1);
        assert_eq!(fake.unmounts.load(Ordering::SeqCst), 1);
        let dir = seen.lock().unwrap().clone().unwrap();
        assert!(dir.file_name().unwrap().to_string_lossy().starts_with("mount-dir-"));
        assert!(!dir.exists());
        assert!(!signals.is_tracking());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_closure_error_still_unmounts() {
        let fake = FakeMounter::new(Behavior::Serve);
        let signals = SignalGuard::install().unwrap();
        let result: Result<(), _> =
            with_mounted_partition(fake.clone(), &signals, Path::new("disk.img"), 1, &fast(), |_| {
                Err(PlacerError::Config("boom".into()))
            })
            .await;

        assert!(matches!(result, Err(PlacerError::Config(_))));
        assert_eq!(fake.unmounts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mount_failure_is_retried_then_fatal() {
        let fake = FakeMounter::new(Behavior::Fail);
        let signals = SignalGuard::install().unwrap();
        let called = AtomicBool::new(false);

        let err = with_mounted_partition(fake.clone(), &signals, Path::new("disk.img"), 3, &fast(), |_| {
            called.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, PlacerError::MountFailed { partition: 3, attempts: 3, .. }));
        assert!(err.to_string().contains("no such partition"));
        assert_eq!(fake.mounts.load(Ordering::SeqCst), 3);
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_times_out_when_nothing_appears() {
        let fake = FakeMounter::new(Behavior::Hang);
        let signals = SignalGuard::install().unwrap();
        let options = MountOptions {
            timeout: Duration::from_millis(200),
            ..fast()
        };

        let err = with_mounted_partition(fake.clone(), &signals, Path::new("disk.img"), 1, &options, |_| Ok(()))
            .await
            .unwrap_err();

        assert!(matches!(err, PlacerError::MountTimedOut));
        assert_eq!(err.to_string(), "Mount command timed out");
        assert_eq!(fake.unmounts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stuck_unmount_is_not_fatal() {
        let fake = FakeMounter::new(Behavior::Stuck);
        let signals = SignalGuard::install().unwrap();
        let options = MountOptions {
            timeout: Duration::from_millis(300),
            settle: Duration::from_millis(50),
            ..fast()
        };
        let seen = Mutex::new(Vec::new());

        let started = Instant::now();
        let ok = with_mounted_partition(fake.clone(), &signals, Path::new("disk.img"), 1, &options, |dir| {
            seen.lock().unwrap().push(dir.to_path_buf());
            Ok("copied")
        })
        .await;
        let failed: Result<(), _> =
            with_mounted_partition(fake.clone(), &signals, Path::new("disk.img"), 1, &options, |dir| {
                seen.lock().unwrap().push(dir.to_path_buf());
                Err(PlacerError::Config("boom".into()))
            })
            .await;
        let elapsed = started.elapsed();

        assert_eq!(ok.unwrap(), "copied");
        assert!(matches!(failed, Err(PlacerError::Config(_))));
        assert_eq!(fake.unmounts.load(Ordering::SeqCst), 2);
        // Two sessions, each bounded by the unmount wait plus the settle pause.
        assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
        for dir in seen.lock().unwrap().iter() {
            assert!(dir.join("etc-marker").exists());
            fs::remove_dir_all(dir).unwrap();
        }
    }

    #[test]
    fn test_default_options() {
        let options = MountOptions::default();
        assert_eq!(options.timeout, Duration::from_secs(60));
        assert_eq!(options.populate_poll, Duration::from_millis(500));
        assert_eq!(options.attempts, 3);
    }
}
