use std::sync::{Arc, Mutex, MutexGuard, Condvar};
use std::sync::atomic::{AtomicU64, AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tracing::{info, warn, error, debug};

use crate::sluicedb::Result;
use crate::sluicedb::config::{UsersConfig, UserAccountsFileUsage};
use crate::sluicedb::users::database::UserDatabase;
use crate::sluicedb::users::loader::{UserLoader, FileUserLoader};

type UpdateCallback = Box<dyn Fn() + Send + Sync>;

struct UpdaterState {
    keep_running: bool,
    update_requested: bool,
    successful_loads: u32,
    consecutive_failures: u32,
    last_update: Option<Instant>,
}

/// Owns the user account snapshot of the service and the thread that refreshes it.
///
/// Readers never block: the current snapshot is published through an ArcSwap and a version
/// counter that only changes when a load produced different content. Workers keep their own
/// copy of the Arc and compare versions before each lookup (see UserCache).
pub struct UserManager {
    userdb: ArcSwap<UserDatabase>,
    version: AtomicU64,
    can_update: AtomicBool,
    state: Mutex<UpdaterState>,
    notifier: Condvar,
    config: UsersConfig,
    loader: Box<dyn UserLoader>,
    on_update: Mutex<Option<UpdateCallback>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // The state is always consistent between statements, a panic elsewhere doesn't invalidate it
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl UserManager {
    /// Creates a manager that loads from loader (the servers) and, depending on
    /// user_accounts_file_usage, the accounts file.
    pub fn new(config: UsersConfig, loader: Box<dyn UserLoader>) -> Self {
        Self {
            userdb: ArcSwap::from_pointee(UserDatabase::new()),
            version: AtomicU64::new(0),
            can_update: AtomicBool::new(true),
            state: Mutex::new(UpdaterState {
                keep_running: true,
                update_requested: true,
                successful_loads: 0,
                consecutive_failures: 0,
                last_update: None,
            }),
            notifier: Condvar::new(),
            config,
            loader,
            on_update: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }

    /// Registers a callback run on the updater thread after every update attempt,
    /// used to wake up sessions waiting for fresh accounts.
    pub fn set_on_update<F: Fn() + Send + Sync + 'static>(&self, f: F) {
        *lock(&self.on_update) = Some(Box::new(f));
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut handle = lock(&self.thread);
        if handle.is_some() {
            warn!("user account updater already running");
            return Ok(());
        }
        lock(&self.state).keep_running = true;
        let manager = self.clone();
        let thread = thread::Builder::new()
            .name("user-updater".to_string())
            .spawn(move || manager.updater_loop())?;
        *handle = Some(thread);
        info!("user account updater started");
        Ok(())
    }

    pub fn stop(&self) {
        lock(&self.state).keep_running = false;
        self.notifier.notify_all();
        if let Some(handle) = lock(&self.thread).take() {
            if handle.join().is_err() {
                error!("user account updater panicked");
            }
        }
        info!("user account updater stopped");
    }

    /// Asks the updater to reload. Requests are coalesced, and rate limited once the updater throttles.
    pub fn update_user_accounts(&self) {
        lock(&self.state).update_requested = true;
        self.notifier.notify_all();
    }

    /// True if an update request would be served right away. A session whose client failed
    /// authentication only waits for a reload (TRY_AGAIN) when this is true.
    pub fn can_update_immediately(&self) -> bool {
        if self.can_update.load(Ordering::Acquire) {
            return true;
        }
        let mut state = lock(&self.state);
        self.lift_throttle(&mut state)
    }

    /// Clears the throttle once users_refresh_time has passed since the last load.
    /// Returns true if updates are no longer throttled.
    fn lift_throttle(&self, state: &mut UpdaterState) -> bool {
        if self.can_update.load(Ordering::Acquire) {
            return true;
        }
        let elapsed = state.last_update.map_or(true, |last| last.elapsed() >= self.min_interval());
        if elapsed {
            debug!("user account reload throttle lifted");
            state.successful_loads = 0;
            state.consecutive_failures = 0;
            self.can_update.store(true, Ordering::Release);
        }
        elapsed
    }

    /// True if a reload was asked for and hasn't started yet.
    pub fn update_pending(&self) -> bool {
        lock(&self.state).update_requested
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn user_database(&self) -> Arc<UserDatabase> {
        self.userdb.load_full()
    }

    /// Publishes db if it differs from the current snapshot. Returns true if the version changed.
    pub fn apply_loaded(&self, db: UserDatabase) -> bool {
        let current = self.userdb.load();
        if **current == db {
            debug!(users = db.n_entries(), "user accounts unchanged");
            return false;
        }
        let (usernames, entries) = (db.n_usernames(), db.n_entries());
        self.userdb.store(Arc::new(db));
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        info!(version, usernames, entries, "user accounts updated");
        true
    }

    fn load(&self) -> Result<UserDatabase> {
        let file = self.config.user_accounts_file.as_ref().map(|p| FileUserLoader::new(p.clone()));
        match (self.config.user_accounts_file_usage, file) {
            (UserAccountsFileUsage::FileOnlyAlways, Some(file)) => file.load(),
            (_, file) => {
                let mut db = self.loader.load()?;
                if let Some(file) = file {
                    db.merge(file.load()?);
                }
                Ok(db)
            },
        }
    }

    /// Runs one load and records the outcome. Normally called by the updater thread.
    pub fn run_update(&self) -> Result<bool> {
        lock(&self.state).update_requested = false;
        let result = self.load();
        let mut state = lock(&self.state);
        state.last_update = Some(Instant::now());
        let changed = match result {
            Ok(db) => {
                state.successful_loads = state.successful_loads.saturating_add(1);
                state.consecutive_failures = 0;
                drop(state);
                Ok(self.apply_loaded(db))
            },
            Err(e) => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                drop(state);
                warn!(%e, "failed to load user accounts");
                Err(e)
            },
        };
        let state = lock(&self.state);
        let throttle = state.successful_loads >= self.config.throttle_after_successful_loads
            || state.consecutive_failures >= self.config.throttle_after_failed_loads;
        drop(state);
        self.can_update.store(!throttle, Ordering::Release);
        changed
    }

    fn min_interval(&self) -> Duration {
        Duration::from_secs(self.config.users_refresh_time)
    }

    fn max_interval(&self) -> Option<Duration> {
        match self.config.users_refresh_interval {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    fn updater_loop(self: Arc<Self>) {
        let mut state = lock(&self.state);
        loop {
            if !state.keep_running {
                break;
            }
            let now = Instant::now();
            let throttled = !self.lift_throttle(&mut state);
            let (due, deadline) = match state.last_update {
                None => (true, None),
                Some(last) => {
                    let earliest = if throttled { last + self.min_interval() } else { last };
                    let periodic = self.max_interval().map(|d| last + d);
                    let requested_due = state.update_requested && now >= earliest;
                    let periodic_due = periodic.map(|p| now >= p).unwrap_or(false);
                    let mut deadline = periodic;
                    if state.update_requested {
                        deadline = Some(deadline.map_or(earliest, |d| d.min(earliest)));
                    }
                    (requested_due || periodic_due, deadline)
                },
            };
            if !due {
                state = match deadline {
                    Some(d) => match self.notifier.wait_timeout(state, d.saturating_duration_since(now)) {
                        Ok((g, _)) => g,
                        Err(poisoned) => poisoned.into_inner().0,
                    },
                    None => match self.notifier.wait(state) {
                        Ok(g) => g,
                        Err(poisoned) => poisoned.into_inner(),
                    },
                };
                continue;
            }

            drop(state);
            let _ = self.run_update();
            if let Some(callback) = lock(&self.on_update).as_ref() {
                callback();
            }
            state = lock(&self.state);
        }
    }
}
