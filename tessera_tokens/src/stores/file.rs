//! A token store shared through the filesystem
//!
//! The token lives in a JSON file that every instance can read. The refresh
//! lock is a sibling lease file. A lease is written out in full under a
//! private name and then hard-linked into place, which fails if a lease
//! already exists, so other instances only ever see complete leases. Each
//! lease records the acquisition it belongs to and until when it is held, so
//! a lease left behind by a crashed holder can be taken over once it runs out.
//!
//! The directory must be on a filesystem that supports hard links.

use std::{
    ffi::OsStr,
    fmt, io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tessera_clock::{Clock, DurationSecs, System, UnixTime};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

use super::{LockToken, TokenStore};
use crate::{AccessToken, AccessTokenRef, StoreError};

const DEFAULT_LEASE: DurationSecs = DurationSecs(60);

#[derive(Debug, Serialize, Deserialize)]
struct StoredToken {
    access_token: AccessToken,
    expires_at: UnixTime,
}

#[derive(Debug, Serialize, Deserialize)]
struct Lease {
    owner: u64,
    nonce: u64,
    lease_until: UnixTime,
}

/// A token store backed by files on a filesystem shared by all instances
///
/// The lock is exclusive across every acquisition, whether made through
/// another store instance, another process, or another caller sharing this
/// instance. [`unlock`][TokenStore::unlock] only frees the lease belonging to
/// the [`LockToken`] it is given.
pub struct FileTokenStore<C = System> {
    path: PathBuf,
    lease_path: PathBuf,
    owner: u64,
    lease: DurationSecs,
    clock: C,
}

fn with_suffix(path: &Path, suffix: impl AsRef<OsStr>) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

async fn write_private(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file_opts = OpenOptions::new();
    file_opts.create(true).truncate(true).write(true);

    #[cfg(unix)]
    file_opts.mode(0o600);

    let mut file = file_opts.open(path).await?;
    file.write_all(data).await?;
    file.sync_all().await
}

async fn discard(path: &Path) {
    if let Err(error) = fs::remove_file(path).await {
        if error.kind() != io::ErrorKind::NotFound {
            tracing::warn!(
                error = (&error as &dyn std::error::Error),
                path = %path.display(),
                "unable to remove scratch file"
            );
        }
    }
}

impl FileTokenStore<System> {
    /// Constructs a store keeping its token at `path`
    ///
    /// The lease file is placed next to it with a `.lock` suffix.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lease_path = with_suffix(&path, ".lock");

        Self {
            path,
            lease_path,
            owner: rand::random(),
            lease: DEFAULT_LEASE,
            clock: System,
        }
    }
}

impl<C> FileTokenStore<C> {
    /// Sets how long a taken lock stays valid if never released
    ///
    /// This should comfortably exceed the time a fetch takes. Defaults to
    /// 60 seconds.
    pub fn with_lease(mut self, lease: DurationSecs) -> Self {
        self.lease = lease;
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> FileTokenStore<D> {
        FileTokenStore {
            path: self.path,
            lease_path: self.lease_path,
            owner: self.owner,
            lease: self.lease,
            clock,
        }
    }

    /// The file holding the token
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
        match fs::read(path).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn write_token(&self, stored: &StoredToken) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(stored)?;

        // Unique per write: callers sharing this instance may write concurrently.
        let tmp_path = with_suffix(&self.path, format!(".{:016x}.tmp", rand::random::<u64>()));

        if let Err(err) = write_private(&tmp_path, &data).await {
            discard(&tmp_path).await;
            return Err(err.into());
        }

        // Readers on other instances must never see a half-written token.
        if let Err(err) = fs::rename(&tmp_path, &self.path).await {
            discard(&tmp_path).await;
            return Err(err.into());
        }
        Ok(())
    }

    /// Publishes `lease` if no lease exists, returning whether it was published
    async fn create_lease(&self, lease: &Lease) -> Result<bool, StoreError> {
        let data = serde_json::to_vec(lease)?;
        let tmp_path = with_suffix(&self.lease_path, format!(".{:016x}.tmp", lease.nonce));

        let written = write_private(&tmp_path, &data).await;
        let linked = match written {
            Ok(()) => fs::hard_link(&tmp_path, &self.lease_path).await,
            Err(err) => Err(err),
        };
        discard(&tmp_path).await;

        match linked {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Decides whether the lease file whose contents are `observed` is abandoned
    ///
    /// Leases that cannot be decoded were not written by this store; they are
    /// judged by their modification time instead.
    async fn is_stale(&self, observed: &[u8], now: UnixTime) -> Result<bool, StoreError> {
        match serde_json::from_slice::<Lease>(observed) {
            Ok(current) => {
                if current.lease_until > now {
                    tracing::trace!(
                        holder = format_args!("{:016x}", current.owner),
                        lease_until = current.lease_until.0,
                        "refresh lease is held"
                    );
                    Ok(false)
                } else {
                    tracing::debug!(
                        holder = format_args!("{:016x}", current.owner),
                        lease_until = current.lease_until.0,
                        "refresh lease has expired"
                    );
                    Ok(true)
                }
            }
            Err(error) => {
                let modified = match fs::metadata(&self.lease_path).await {
                    Ok(meta) => meta.modified()?,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
                    Err(err) => return Err(err.into()),
                };
                let lease_until = UnixTime::from(modified) + self.lease;
                tracing::debug!(
                    error = (&error as &dyn std::error::Error),
                    lease_until = lease_until.0,
                    "refresh lease is unreadable, judging it by age"
                );
                Ok(lease_until <= now)
            }
        }
    }

    /// Moves aside the stale lease with contents `observed`
    ///
    /// Returns `false` without disturbing anything if the lease in place is no
    /// longer the one observed, as when another contender took over first.
    async fn take_over(&self, observed: &[u8], lock: LockToken) -> Result<bool, StoreError> {
        let aside = with_suffix(&self.lease_path, format!(".{:016x}.stale", lock.nonce()));

        match fs::rename(&self.lease_path, &aside).await {
            Ok(()) => {}
            // Released or taken over and released again: free for the taking.
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(err.into()),
        }

        let moved = Self::read_optional(&aside).await;
        if let Ok(Some(moved)) = &moved {
            if moved.as_slice() == observed {
                discard(&aside).await;
                return Ok(true);
            }
        }

        // Someone else's lease was moved aside: put it back.
        if let Err(error) = fs::hard_link(&aside, &self.lease_path).await {
            tracing::warn!(
                error = (&error as &dyn std::error::Error),
                path = %self.lease_path.display(),
                "unable to restore a refresh lease taken over concurrently"
            );
        }
        discard(&aside).await;
        moved?;
        Ok(false)
    }
}

impl<C: fmt::Debug> fmt::Debug for FileTokenStore<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FileTokenStore")
            .field("path", &self.path)
            .field("lease_path", &self.lease_path)
            .field("owner", &format_args!("{:016x}", self.owner))
            .field("lease", &self.lease)
            .field("clock", &self.clock)
            .finish()
    }
}

#[async_trait]
impl<C: Clock + Send + Sync> TokenStore for FileTokenStore<C> {
    async fn get(&self) -> Result<AccessToken, StoreError> {
        let data = Self::read_optional(&self.path)
            .await?
            .ok_or(StoreError::Empty)?;
        let stored: StoredToken = serde_json::from_slice(&data)?;

        if self.clock.now() >= stored.expires_at {
            return Err(StoreError::Expired {
                expired_at: stored.expires_at,
            });
        }

        if stored.access_token.as_str().is_empty() {
            return Err(StoreError::Empty);
        }

        Ok(stored.access_token)
    }

    async fn set(&self, token: &AccessTokenRef, ttl: DurationSecs) -> Result<(), StoreError> {
        let stored = StoredToken {
            access_token: token.to_owned(),
            expires_at: self.clock.now() + ttl,
        };
        self.write_token(&stored).await?;
        tracing::trace!(path = %self.path.display(), expires_at = stored.expires_at.0, "stored token to file");
        Ok(())
    }

    async fn lock(&self) -> Result<LockToken, StoreError> {
        let now = self.clock.now();
        let token = LockToken::new();
        let lease = Lease {
            owner: self.owner,
            nonce: token.nonce(),
            lease_until: now + self.lease,
        };

        let acquired = if self.create_lease(&lease).await? {
            true
        } else {
            match Self::read_optional(&self.lease_path).await? {
                // Released in the meantime.
                None => self.create_lease(&lease).await?,
                Some(observed) => {
                    self.is_stale(&observed, now).await?
                        && self.take_over(&observed, token).await?
                        && self.create_lease(&lease).await?
                }
            }
        };

        if acquired {
            tracing::trace!(path = %self.lease_path.display(), lease_until = lease.lease_until.0, "took refresh lease");
            Ok(token)
        } else {
            Err(StoreError::Locked)
        }
    }

    async fn unlock(&self, lock: Option<LockToken>) {
        let lock = match lock {
            Some(lock) => lock,
            None => return,
        };

        let current = match Self::read_optional(&self.lease_path).await {
            Ok(Some(data)) => serde_json::from_slice::<Lease>(&data).ok(),
            Ok(None) => None,
            Err(error) => {
                tracing::trace!(
                    error = (&error as &dyn std::error::Error),
                    "refresh lease unreadable, leaving it alone"
                );
                return;
            }
        };

        match current {
            // An expired lease may already be in the middle of a takeover.
            Some(current) if current.nonce == lock.nonce() && current.lease_until > self.clock.now() => {
                if let Err(error) = fs::remove_file(&self.lease_path).await {
                    if error.kind() != io::ErrorKind::NotFound {
                        tracing::warn!(
                            error = (&error as &dyn std::error::Error),
                            path = %self.lease_path.display(),
                            "unable to release refresh lease"
                        );
                    }
                } else {
                    tracing::trace!(path = %self.lease_path.display(), "released refresh lease");
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use tessera_clock::TestClock;

    use super::*;

    fn store_in(dir: &tempfile::TempDir, clock: &TestClock) -> FileTokenStore<TestClock> {
        FileTokenStore::new(dir.path().join("token.json")).with_clock(clock.clone())
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let clock = TestClock::new(UnixTime(1_000));
        let store = store_in(&dir, &clock);

        assert!(matches!(store.get().await, Err(StoreError::Empty)));
    }

    #[tokio::test]
    async fn token_is_shared_between_instances_and_expires() {
        let dir = tempfile::tempdir().unwrap();
        let clock = TestClock::new(UnixTime(1_000));
        let writer = store_in(&dir, &clock);
        let reader = store_in(&dir, &clock);

        writer
            .set(&AccessToken::new("abc".to_owned()), DurationSecs(10))
            .await
            .unwrap();
        assert_eq!(reader.get().await.unwrap().as_str(), "abc");

        clock.advance(DurationSecs(11));
        assert!(matches!(reader.get().await, Err(StoreError::Expired { .. })));
    }

    #[tokio::test]
    async fn corrupt_token_file_is_a_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let clock = TestClock::new(UnixTime(1_000));
        let store = store_in(&dir, &clock);
        fs::write(store.path(), b"not json").await.unwrap();

        assert!(matches!(store.get().await, Err(StoreError::Serialization(_))));
    }

    async fn dir_entries(dir: &tempfile::TempDir) -> Vec<String> {
        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        names
    }

    #[tokio::test]
    async fn lock_excludes_other_instances_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let clock = TestClock::new(UnixTime(1_000));
        let first = store_in(&dir, &clock);
        let second = store_in(&dir, &clock);

        let held = first.lock().await.unwrap();
        assert!(matches!(second.lock().await, Err(StoreError::Locked)));

        // Releasing without the acquisition's token must not free the lease.
        second.unlock(None).await;
        second.unlock(Some(LockToken::new())).await;
        assert!(matches!(second.lock().await, Err(StoreError::Locked)));

        first.unlock(Some(held)).await;
        second.lock().await.unwrap();
    }

    #[tokio::test]
    async fn callers_sharing_an_instance_exclude_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let clock = TestClock::new(UnixTime(1_000));
        let shared = store_in(&dir, &clock);
        let other = store_in(&dir, &clock);

        let held = shared.lock().await.unwrap();
        assert!(matches!(shared.lock().await, Err(StoreError::Locked)));

        // A caller whose lock failed releases unconditionally.
        shared.unlock(None).await;
        assert!(matches!(other.lock().await, Err(StoreError::Locked)));

        shared.unlock(Some(held)).await;
        other.lock().await.unwrap();
    }

    #[tokio::test]
    async fn lock_leaves_only_the_lease_behind() {
        let dir = tempfile::tempdir().unwrap();
        let clock = TestClock::new(UnixTime(1_000));
        let store = store_in(&dir, &clock);

        let held = store.lock().await.unwrap();
        store
            .set(&AccessToken::new("abc".to_owned()), DurationSecs(10))
            .await
            .unwrap();
        assert_eq!(dir_entries(&dir).await, vec!["token.json", "token.json.lock"]);

        store.unlock(Some(held)).await;
        assert_eq!(dir_entries(&dir).await, vec!["token.json"]);
    }

    #[tokio::test]
    async fn concurrent_writes_through_one_instance_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let clock = TestClock::new(UnixTime(1_000));
        let store = store_in(&dir, &clock);
        let first = AccessToken::new("first".to_owned());
        let second = AccessToken::new("second".to_owned());

        let (a, b) = tokio::join!(
            store.set(&first, DurationSecs(10)),
            store.set(&second, DurationSecs(10)),
        );
        a.unwrap();
        b.unwrap();

        let stored = store.get().await.unwrap();
        assert!(stored == first || stored == second);
        assert_eq!(dir_entries(&dir).await, vec!["token.json"]);
    }

    #[tokio::test]
    async fn unlock_without_lock_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let clock = TestClock::new(UnixTime(1_000));
        let store = store_in(&dir, &clock);

        store.unlock(None).await;
        store.unlock(Some(LockToken::new())).await;
        store.lock().await.unwrap();
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let clock = TestClock::new(UnixTime(1_000));
        let crashed = store_in(&dir, &clock).with_lease(DurationSecs(30));
        let survivor = store_in(&dir, &clock);

        let abandoned = crashed.lock().await.unwrap();
        assert!(matches!(survivor.lock().await, Err(StoreError::Locked)));

        clock.advance(DurationSecs(30));
        survivor.lock().await.unwrap();

        // The previous holder's late release must not free the new lease.
        crashed.unlock(Some(abandoned)).await;
        assert!(matches!(crashed.lock().await, Err(StoreError::Locked)));
        assert_eq!(dir_entries(&dir).await, vec!["token.json.lock"]);
    }

    #[tokio::test]
    async fn unreadable_lease_expires_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let clock = TestClock::new(UnixTime::from(SystemTime::now()));
        let store = store_in(&dir, &clock).with_lease(DurationSecs(30));

        // What a holder that died mid-write by some other tool might leave.
        fs::write(&store.lease_path, b"").await.unwrap();
        assert!(matches!(store.lock().await, Err(StoreError::Locked)));

        clock.advance(DurationSecs(60));
        let held = store.lock().await.unwrap();

        let other = store_in(&dir, &clock);
        assert!(matches!(other.lock().await, Err(StoreError::Locked)));
        store.unlock(Some(held)).await;
        other.lock().await.unwrap();
    }

    #[tokio::test]
    async fn late_contender_does_not_displace_a_fresh_takeover() {
        let dir = tempfile::tempdir().unwrap();
        let clock = TestClock::new(UnixTime(1_000));
        let crashed = store_in(&dir, &clock).with_lease(DurationSecs(30));
        let winner = store_in(&dir, &clock);
        let late = store_in(&dir, &clock);

        crashed.lock().await.unwrap();
        clock.advance(DurationSecs(31));

        // Both contenders see the same expired lease, but the winner moves first.
        let observed = fs::read(&late.lease_path).await.unwrap();
        assert!(late.is_stale(&observed, clock.now()).await.unwrap());
        let held = winner.lock().await.unwrap();

        assert!(!late.take_over(&observed, LockToken::new()).await.unwrap());
        assert!(matches!(late.lock().await, Err(StoreError::Locked)));
        assert_eq!(dir_entries(&dir).await, vec!["token.json.lock"]);

        winner.unlock(Some(held)).await;
        late.lock().await.unwrap();
    }
}
