//! Content-addressed reuse cache for repeat transfer inputs
//!
//! Objects are stored under their checksum and scoped to a principal tag;
//! a receiver that already holds a declared checksum can place the file
//! into a sandbox without the bytes ever crossing the wire. Admission is
//! reservation-based: space must be reserved before ingestion, and a
//! [`Reservation`] releases its claim when dropped, so no exit path can
//! leak quota.
//!
//! The catalog is in-memory only and rebuilt empty at startup; the object
//! files themselves are the durable state of previous runs but are not
//! trusted until re-ingested.

#![deny(missing_docs)]
#![warn(clippy::all)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::Digest;
use stagehand_types::{ChecksumKind, Error, Result};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifier of a space reservation
pub type ReservationId = Uuid;

#[derive(Debug, Clone)]
struct ObjectMeta {
    size: u64,
    tag: String,
}

#[derive(Debug, Clone)]
struct ReservationMeta {
    bytes: u64,
    tag: String,
    expires: Instant,
}

#[derive(Debug, Default)]
struct CacheState {
    objects: HashMap<(ChecksumKind, String), ObjectMeta>,
    reservations: HashMap<ReservationId, ReservationMeta>,
    used_bytes: u64,
}

impl CacheState {
    fn reserved_bytes(&self) -> u64 {
        self.reservations.values().map(|r| r.bytes).sum()
    }

    fn expire_stale(&mut self, now: Instant) {
        self.reservations.retain(|id, meta| {
            let live = meta.expires > now;
            if !live {
                debug!("reservation {id} expired, releasing {} bytes", meta.bytes);
            }
            live
        });
    }
}

/// A held space reservation; dropping it releases the claim
///
/// Ingestion requires a live reservation, so the cache can never be
/// overcommitted by a session that dies mid-transfer.
#[derive(Debug)]
pub struct Reservation {
    id: ReservationId,
    state: Arc<Mutex<CacheState>>,
}

impl Reservation {
    /// Identifier of this reservation
    pub fn id(&self) -> ReservationId {
        self.id
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut state = self.state.lock().expect("cache state poisoned");
        if let Some(meta) = state.reservations.remove(&self.id) {
            debug!(
                "released reservation {} ({} bytes unclaimed)",
                self.id, meta.bytes
            );
        }
    }
}

/// Content-addressed object store keyed by (checksum kind, digest, tag)
#[derive(Debug, Clone)]
pub struct ReuseCache {
    root: PathBuf,
    capacity_bytes: u64,
    state: Arc<Mutex<CacheState>>,
}

impl ReuseCache {
    /// Open a cache rooted at `root` with the given byte capacity
    pub async fn open<P: AsRef<Path>>(root: P, capacity_bytes: u64) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::cache(format!("failed to create cache root: {e}")))?;
        info!(
            "reuse cache open at {} (capacity {} bytes)",
            root.display(),
            capacity_bytes
        );
        Ok(Self {
            root,
            capacity_bytes,
            state: Arc::new(Mutex::new(CacheState::default())),
        })
    }

    /// Place a cached object at `dest` if one matches and the tag is
    /// authorised
    ///
    /// Returns `Ok(false)` on a miss or a tag mismatch; both fall back to a
    /// normal transfer. Placement prefers a hard link and falls back to a
    /// copy across filesystems.
    pub async fn retrieve_file(
        &self,
        dest: &Path,
        digest: &str,
        kind: ChecksumKind,
        tag: &str,
    ) -> Result<bool> {
        let digest = digest.to_ascii_lowercase();
        {
            let state = self.state.lock().expect("cache state poisoned");
            match state.objects.get(&(kind, digest.clone())) {
                Some(meta) if meta.tag == tag => {}
                Some(_) => {
                    warn!("reuse denied: tag {tag} not authorised for {kind}:{digest}");
                    return Ok(false);
                }
                None => return Ok(false),
            }
        }

        let object = self.object_path(kind, &digest);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::cache(format!("failed to create {}: {e}", parent.display())))?;
        }
        let _ = tokio::fs::remove_file(dest).await;
        if tokio::fs::hard_link(&object, dest).await.is_err() {
            tokio::fs::copy(&object, dest).await.map_err(|e| {
                Error::cache(format!(
                    "failed to place cached object at {}: {e}",
                    dest.display()
                ))
            })?;
        }
        debug!("reuse hit: {kind}:{digest} placed at {}", dest.display());
        Ok(true)
    }

    /// Reserve `bytes` of cache space under `tag` for `ttl`
    ///
    /// Fails when the capacity cannot cover live objects plus outstanding
    /// reservations plus this request.
    pub fn reserve_space(&self, bytes: u64, ttl: Duration, tag: &str) -> Result<Reservation> {
        let now = Instant::now();
        let mut state = self.state.lock().expect("cache state poisoned");
        state.expire_stale(now);

        let committed = state.used_bytes + state.reserved_bytes();
        if committed + bytes > self.capacity_bytes {
            return Err(Error::cache(format!(
                "cannot reserve {bytes} bytes: {committed} of {} committed",
                self.capacity_bytes
            )));
        }

        let id = Uuid::new_v4();
        state.reservations.insert(
            id,
            ReservationMeta {
                bytes,
                tag: tag.to_string(),
                expires: now + ttl,
            },
        );
        debug!("reserved {bytes} bytes under tag {tag} as {id}");
        Ok(Reservation {
            id,
            state: Arc::clone(&self.state),
        })
    }

    /// Ingest `src` as a new object under a live reservation
    ///
    /// The file's actual digest is computed and must match `digest`; a
    /// mismatch refuses ingestion (the source is not the content it claims
    /// to be). The object is charged against the reservation's bytes.
    pub async fn cache_file(
        &self,
        src: &Path,
        digest: &str,
        kind: ChecksumKind,
        reservation: &Reservation,
    ) -> Result<()> {
        let digest = digest.to_ascii_lowercase();
        let actual = file_digest(kind, src).await?;
        if actual != digest {
            return Err(Error::cache(format!(
                "digest mismatch for {}: declared {digest}, computed {actual}",
                src.display()
            )));
        }

        let size = tokio::fs::metadata(src)
            .await
            .map_err(|e| Error::cache(format!("failed to stat {}: {e}", src.display())))?
            .len();

        let tag = {
            let state = self.state.lock().expect("cache state poisoned");
            let meta = state
                .reservations
                .get(&reservation.id())
                .ok_or_else(|| Error::cache("no live reservation for ingestion"))?;
            if meta.bytes < size {
                return Err(Error::cache(format!(
                    "reservation covers {} bytes, object needs {size}",
                    meta.bytes
                )));
            }
            meta.tag.clone()
        };

        let object = self.object_path(kind, &digest);
        if let Some(parent) = object.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::cache(format!("failed to create {}: {e}", parent.display())))?;
        }
        tokio::fs::copy(src, &object)
            .await
            .map_err(|e| Error::cache(format!("failed to ingest {}: {e}", src.display())))?;

        let mut state = self.state.lock().expect("cache state poisoned");
        if let Some(meta) = state.reservations.get_mut(&reservation.id()) {
            meta.bytes -= size;
        }
        state.used_bytes += size;
        state.objects.insert((kind, digest.clone()), ObjectMeta { size, tag });
        debug!("ingested {kind}:{digest} ({size} bytes)");
        Ok(())
    }

    /// Whether an object with this digest exists under the given tag
    pub fn contains(&self, digest: &str, kind: ChecksumKind, tag: &str) -> bool {
        let state = self.state.lock().expect("cache state poisoned");
        state
            .objects
            .get(&(kind, digest.to_ascii_lowercase()))
            .map(|meta| meta.tag == tag)
            .unwrap_or(false)
    }

    /// Bytes currently held by live objects
    pub fn used_bytes(&self) -> u64 {
        self.state.lock().expect("cache state poisoned").used_bytes
    }

    fn object_path(&self, kind: ChecksumKind, digest: &str) -> PathBuf {
        let prefix = digest.get(..2).unwrap_or("xx");
        self.root.join(kind.to_string()).join(prefix).join(digest)
    }
}

/// Compute the digest of a file under the given checksum kind, as lowercase
/// hex
pub async fn file_digest(kind: ChecksumKind, path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::cache(format!("failed to open {}: {e}", path.display())))?;
    let mut buf = vec![0u8; 64 * 1024];

    match kind {
        ChecksumKind::Sha256 => {
            let mut hasher = sha2::Sha256::new();
            loop {
                let got = file
                    .read(&mut buf)
                    .await
                    .map_err(|e| Error::cache(format!("failed to read {}: {e}", path.display())))?;
                if got == 0 {
                    break;
                }
                hasher.update(&buf[..got]);
            }
            Ok(to_hex(&hasher.finalize()))
        }
        ChecksumKind::Blake3 => {
            let mut hasher = blake3::Hasher::new();
            loop {
                let got = file
                    .read(&mut buf)
                    .await
                    .map_err(|e| Error::cache(format!("failed to read {}: {e}", path.display())))?;
                if got == 0 {
                    break;
                }
                hasher.update(&buf[..got]);
            }
            Ok(hasher.finalize().to_hex().to_string())
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn cache_with_object(
        dir: &Path,
        content: &[u8],
        tag: &str,
    ) -> (ReuseCache, String) {
        let cache = ReuseCache::open(dir.join("cache"), 1 << 20).await.unwrap();
        let src = dir.join("src.bin");
        tokio::fs::write(&src, content).await.unwrap();
        let digest = file_digest(ChecksumKind::Sha256, &src).await.unwrap();

        let reservation = cache
            .reserve_space(content.len() as u64, Duration::from_secs(60), tag)
            .unwrap();
        cache
            .cache_file(&src, &digest, ChecksumKind::Sha256, &reservation)
            .await
            .unwrap();
        (cache, digest)
    }

    #[tokio::test]
    async fn test_retrieve_hit_places_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, digest) = cache_with_object(dir.path(), b"executable bytes", "Owner_alice").await;

        let dest = dir.path().join("sandbox/condor_exec.exe");
        let hit = cache
            .retrieve_file(&dest, &digest, ChecksumKind::Sha256, "Owner_alice")
            .await
            .unwrap();
        assert!(hit);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"executable bytes");
    }

    #[tokio::test]
    async fn test_retrieve_miss_and_tag_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, digest) = cache_with_object(dir.path(), b"data", "Owner_alice").await;

        let dest = dir.path().join("dest");
        assert!(!cache
            .retrieve_file(&dest, "0000", ChecksumKind::Sha256, "Owner_alice")
            .await
            .unwrap());
        // Same digest, wrong principal: denied, not shared.
        assert!(!cache
            .retrieve_file(&dest, &digest, ChecksumKind::Sha256, "Owner_bob")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_ingestion_requires_reservation() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ReuseCache::open(dir.path().join("cache"), 1 << 20)
            .await
            .unwrap();
        let src = dir.path().join("src");
        tokio::fs::write(&src, b"content").await.unwrap();
        let digest = file_digest(ChecksumKind::Sha256, &src).await.unwrap();

        let reservation = cache
            .reserve_space(7, Duration::from_secs(60), "Owner_alice")
            .unwrap();
        let stale_id_holder = cache
            .reserve_space(7, Duration::from_secs(60), "Owner_alice")
            .unwrap();
        drop(stale_id_holder);

        cache
            .cache_file(&src, &digest, ChecksumKind::Sha256, &reservation)
            .await
            .unwrap();
        assert!(cache.contains(&digest, ChecksumKind::Sha256, "Owner_alice"));
        assert_eq!(cache.used_bytes(), 7);
    }

    #[tokio::test]
    async fn test_reservation_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ReuseCache::open(dir.path().join("cache"), 100).await.unwrap();

        let first = cache
            .reserve_space(80, Duration::from_secs(60), "t")
            .unwrap();
        assert!(cache.reserve_space(40, Duration::from_secs(60), "t").is_err());
        drop(first);
        assert!(cache.reserve_space(40, Duration::from_secs(60), "t").is_ok());
    }

    #[tokio::test]
    async fn test_digest_mismatch_refused() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ReuseCache::open(dir.path().join("cache"), 1 << 20)
            .await
            .unwrap();
        let src = dir.path().join("src");
        tokio::fs::write(&src, b"content").await.unwrap();

        let reservation = cache
            .reserve_space(100, Duration::from_secs(60), "t")
            .unwrap();
        let err = cache
            .cache_file(&src, "deadbeef", ChecksumKind::Sha256, &reservation)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cache { .. }));
    }

    #[tokio::test]
    async fn test_blake3_digest() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        tokio::fs::write(&src, b"abc").await.unwrap();
        let digest = file_digest(ChecksumKind::Blake3, &src).await.unwrap();
        assert_eq!(digest, blake3::hash(b"abc").to_hex().to_string());
    }
}
