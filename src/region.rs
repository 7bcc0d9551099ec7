//! Memory regions: the mapping, reader pinning, cooperative resize and
//! crash-consistent snapshots.
//!
//! A [`Region`] is a contiguous, resizable byte range addressed purely by
//! offset. It is backed either by a file mapping or by an anonymous mapping.
//! Readers pin the region through a shared epoch before dereferencing any
//! offset; while any reader is pinned the mapping may grow in place but may
//! never move. An operation that needs more room than an in-place grow can
//! provide fails with [`Error::RegionResize`], which [`Region::pinned`]
//! recovers from by draining all readers, resizing under the exclusive
//! epoch, and re-running the operation.
//!
//! Cross-process exclusion uses advisory locks: the backing file itself is
//! locked for the lifetime of a writable region, and sidecar lock files
//! serialize initialization and snapshots between processes.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use fs4::fs_std::FileExt;
use log::{debug, warn};
use memmap2::{MmapMut, MmapOptions, MmapRaw};

use crate::bitmap::HierarchicalBitmap;
use crate::error::{Error, Result};
use crate::gc::GcLock;
use crate::page::PAGE_SIZE;

bitflags::bitflags! {
    /// Access permissions for a region's backing resource.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Permissions: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
    }
}

impl Permissions {
    pub const READ_WRITE: Permissions = Permissions::READ.union(Permissions::WRITE);
}

/// How to obtain the backing resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResMode {
    /// Create and initialize a new resource; fails if it already exists
    /// with content.
    Create,
    /// Open an existing resource; fails if absent.
    Open,
    /// Open the resource, creating and initializing it if absent.
    CreateOpen,
}

/// Ids of the per-trie gc locks. Id 0 is reserved for region-internal
/// ordering (the pin lock); trie ids start at 1.
pub const MAX_GC_ID: u32 = 63;

struct RegionInner {
    map: MmapRaw,
    file: Option<File>,
    path: Option<PathBuf>,
    snapshot_lock: Option<File>,
}

pub struct Region {
    start: AtomicPtr<u8>,
    len: AtomicU64,
    perm: Permissions,
    /// True when this open created (and must initialize) the resource.
    created: bool,
    inner: Mutex<RegionInner>,
    /// The region pin lock (gc id 0).
    pub(crate) gc: GcLock,
    /// Per-trie gc locks, created on demand.
    trie_gcs: Mutex<HashMap<u32, Arc<GcLock>>>,
    /// Which gc ids have been allocated this session.
    gc_ids: HierarchicalBitmap,
    /// Serializes in-process resize attempts.
    resize_serial: Mutex<()>,
    /// Serializes in-process snapshots; also bars relocating resizes for
    /// their duration (a snapshot holds it while flushing).
    snapshot_serial: Mutex<()>,
}

// The raw pointer is to the mapping, whose lifetime the struct controls and
// whose relocation discipline the epoch lock enforces.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

fn round_up_page(n: u64) -> u64 {
    (n + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

impl Region {
    /// Minimum size a fresh region is created with: room for the metadata
    /// pages, the first page tables and the trie allocator page.
    pub const MIN_SIZE: u64 = 64 * PAGE_SIZE;

    fn from_map(
        map: MmapRaw,
        file: Option<File>,
        path: Option<PathBuf>,
        snapshot_lock: Option<File>,
        perm: Permissions,
        created: bool,
    ) -> Region {
        let start = map.as_mut_ptr();
        let len = map.len() as u64;
        let mut gc_ids: HierarchicalBitmap = unsafe { std::mem::zeroed() };
        gc_ids.init();
        Region {
            start: AtomicPtr::new(start),
            len: AtomicU64::new(len),
            perm,
            created,
            inner: Mutex::new(RegionInner {
                map,
                file,
                path,
                snapshot_lock,
            }),
            gc: GcLock::new(),
            trie_gcs: Mutex::new(HashMap::new()),
            gc_ids,
            resize_serial: Mutex::new(()),
            snapshot_serial: Mutex::new(()),
        }
    }

    /// Create an anonymous (heap-backed) region of at least `size` bytes.
    pub fn anonymous(size: u64) -> Result<Region> {
        let size = round_up_page(size.max(Self::MIN_SIZE));
        let map = MmapRaw::from(MmapMut::map_anon(size as usize).map_err(|e| {
            Error::MapFailed {
                requested: size,
                source: e,
            }
        })?);
        debug!("opened anonymous region of 0x{size:x} bytes");
        Ok(Region::from_map(
            map,
            None,
            None,
            None,
            Permissions::READ_WRITE,
            true,
        ))
    }

    /// Open a file-backed region.
    ///
    /// The system page size must be 4 KiB: the file layout hard-codes
    /// order-1 pages of 4096 bytes.
    pub fn open<P: AsRef<Path>>(
        path: P,
        mode: ResMode,
        perm: Permissions,
        size_to_create: u64,
    ) -> Result<Region> {
        let path = path.as_ref();

        if page_size::get() as u64 != PAGE_SIZE {
            return Err(Error::Format("system page size is not 4 KiB"));
        }

        // Serialize creation races between processes.
        let init_lock = lock_file(&sidecar(path, "init"))?;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(perm.contains(Permissions::WRITE))
            .create(mode != ResMode::Open)
            .truncate(false)
            .open(path)
            .map_err(Error::Open)?;

        // One writable owner per file.
        if perm.contains(Permissions::WRITE) {
            file.try_lock_exclusive()
                .map_err(|e| Error::Lock(e.into()))?;
        } else {
            file.try_lock_shared().map_err(|e| Error::Lock(e.into()))?;
        }

        let file_size = file.metadata().map_err(Error::Open)?.len();
        let is_new = file_size == 0;
        match (mode, is_new) {
            (ResMode::Create, false) => {
                return Err(Error::Format("file already exists and is not empty"))
            }
            (ResMode::Open, true) => return Err(Error::Format("file is empty")),
            _ => {}
        }
        if !is_new && file_size % PAGE_SIZE != 0 {
            return Err(Error::Format("file size is not a multiple of the page size"));
        }

        let map_size = if is_new {
            let want = round_up_page(size_to_create.max(Self::MIN_SIZE));
            file.set_len(want).map_err(|e| Error::ResizeFailed {
                size: 0,
                requested: want,
                source: e,
            })?;
            want
        } else {
            file_size
        };

        // Writable opens share the mapping with the file; read-only opens
        // take a private copy-on-write view so the fd can stay O_RDONLY.
        let map = if perm.contains(Permissions::WRITE) {
            MmapOptions::new()
                .len(map_size as usize)
                .map_raw(&file)
                .map_err(|e| Error::MapFailed {
                    requested: map_size,
                    source: e,
                })?
        } else {
            // Safety: the exclusive/shared lock protocol above keeps other
            // processes from truncating the file underneath the mapping.
            let copy = unsafe { MmapOptions::new().len(map_size as usize).map_copy(&file) }
                .map_err(|e| Error::MapFailed {
                    requested: map_size,
                    source: e,
                })?;
            MmapRaw::from(copy)
        };

        let snapshot_lock = File::options()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(sidecar(path, "snapshot"))
            .map_err(Error::Open)?;

        drop(init_lock);
        debug!(
            "opened region {} (new: {is_new}, 0x{map_size:x} bytes)",
            path.display()
        );
        Ok(Region::from_map(
            map,
            Some(file),
            Some(path.to_path_buf()),
            Some(snapshot_lock),
            perm,
            is_new,
        ))
    }

    pub fn is_file_backed(&self) -> bool {
        self.inner.lock().unwrap().file.is_some()
    }

    /// True when this open created the backing resource and the caller
    /// must initialize the layout.
    pub fn was_created(&self) -> bool {
        self.created
    }

    /// Start of the mapping. Stable while the caller is pinned.
    #[inline]
    pub fn start(&self) -> *mut u8 {
        self.start.load(Ordering::Acquire)
    }

    /// Current length of the region. Grows monotonically except across an
    /// explicit [`Region::resize`].
    #[inline]
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times the calling thread holds the region pinned.
    pub fn is_pinned(&self) -> u32 {
        self.gc.is_locked_shared()
    }

    /// Make sure `offset + bytes` is backed, growing in place if needed.
    /// Fails with the resize signal when an in-place grow is impossible;
    /// the enclosing pin loop escalates.
    #[inline]
    pub fn ensure(&self, offset: u64, bytes: u64) -> Result<()> {
        let needed = offset + bytes;
        if needed <= self.len() {
            return Ok(());
        }
        self.grow(needed)
    }

    /// Typed pointer into the region. The caller must be pinned and must not
    /// hold the pointer across an unpin.
    #[inline]
    pub fn at<T>(&self, offset: u64) -> Result<*mut T> {
        self.ensure(offset, std::mem::size_of::<T>() as u64)?;
        debug_assert!(self.is_pinned() > 0, "region access without a pin");
        Ok(unsafe { self.start().add(offset as usize) as *mut T })
    }

    /// Raw byte pointer covering `[offset, offset + bytes)`.
    #[inline]
    pub fn bytes(&self, offset: u64, bytes: u64) -> Result<*mut u8> {
        self.ensure(offset, bytes)?;
        Ok(unsafe { self.start().add(offset as usize) })
    }

    /// Atomic view of the 64-bit word at `offset` (must be 8-byte aligned).
    #[inline]
    pub fn atomic_u64(&self, offset: u64) -> Result<&AtomicU64> {
        debug_assert_eq!(offset & 7, 0);
        let p = self.at::<u64>(offset)?;
        Ok(unsafe { AtomicU64::from_ptr(p) })
    }

    /// Run `f` with the region pinned, re-running it after growing whenever
    /// it signals `RegionResize`. Nested calls on one thread cooperate: the
    /// innermost pin propagates the signal outward and only the outermost
    /// one escalates (taking the exclusive epoch requires no pins at all).
    pub fn pinned<R>(&self, mut f: impl FnMut() -> Result<R>) -> Result<R> {
        loop {
            let r = {
                let _guard = self.gc.shared();
                f()
            };
            match r {
                Err(Error::RegionResize { size, can_shrink }) => {
                    if self.gc.is_locked_shared() > 0 {
                        // Nested pin: let the outermost handler escalate.
                        return Err(Error::RegionResize { size, can_shrink });
                    }
                    self.escalate(size, can_shrink)?;
                }
                r => return r,
            }
        }
    }

    /// Outermost resize handler: drain all readers, then resize. Growth is
    /// doubled to amortize repeated escalation.
    fn escalate(&self, size: u64, can_shrink: bool) -> Result<()> {
        let _ex = self.gc.exclusive();
        if can_shrink {
            self.resize_locked(size)
        } else {
            self.resize_locked(round_up_page(size.saturating_mul(2)))
        }
    }

    /// Grow the region in place to at least `min_size`. Never unmaps or
    /// moves live pages; when the mapping cannot be extended in place this
    /// fails with the resize signal.
    pub fn grow(&self, min_size: u64) -> Result<()> {
        let _serial = self.resize_serial.lock().unwrap();
        let cur = self.len();
        if min_size <= cur {
            return Ok(());
        }
        if !self.perm.contains(Permissions::WRITE) {
            return Err(Error::Logical("grow on a read-only region"));
        }
        let new_len = round_up_page(min_size);

        let mut inner = self.inner.lock().unwrap();
        if let Some(file) = inner.file.as_ref() {
            file.set_len(new_len).map_err(|e| Error::ResizeFailed {
                size: cur,
                requested: new_len,
                source: e,
            })?;
        }

        #[cfg(target_os = "linux")]
        {
            if unsafe {
                inner.map.remap(
                    new_len as usize,
                    memmap2::RemapOptions::new().may_move(false),
                )
            }
            .is_ok()
            {
                debug_assert_eq!(inner.map.as_mut_ptr(), self.start());
                self.len.store(new_len, Ordering::Release);
                debug!("grew region in place to 0x{new_len:x} bytes");
                return Ok(());
            }
        }

        drop(inner);
        // Can't extend without moving; the pin loop must drain readers and
        // come back through resize_locked.
        Err(Error::RegionResize {
            size: min_size,
            can_shrink: false,
        })
    }

    /// Resize (grow or shrink) with no readers pinned. Caller must hold the
    /// exclusive epoch (or otherwise guarantee exclusivity, e.g. at open).
    fn resize_locked(&self, new_size: u64) -> Result<()> {
        let _serial = self.resize_serial.lock().unwrap();
        // A snapshot must never observe the mapping moving underneath it.
        let _snap = self.snapshot_serial.lock().unwrap();
        let cur = self.len();
        let new_len = round_up_page(new_size.max(Self::MIN_SIZE));
        if new_len == cur {
            return Ok(());
        }
        if !self.perm.contains(Permissions::WRITE) {
            return Err(Error::Logical("resize on a read-only region"));
        }

        let mut inner = self.inner.lock().unwrap();

        if let Some(file) = inner.file.as_ref() {
            if new_len > cur {
                file.set_len(new_len).map_err(|e| Error::ResizeFailed {
                    size: cur,
                    requested: new_len,
                    source: e,
                })?;
            }
        }

        #[cfg(target_os = "linux")]
        let remapped = unsafe {
            inner
                .map
                .remap(new_len as usize, memmap2::RemapOptions::new().may_move(true))
        }
        .is_ok();
        #[cfg(not(target_os = "linux"))]
        let remapped = false;

        if !remapped {
            // Rebuild the mapping from scratch.
            let new_map = match inner.file.as_ref() {
                Some(file) => MmapOptions::new()
                    .len(new_len as usize)
                    .map_raw(file)
                    .map_err(|e| Error::MapFailed {
                        requested: new_len,
                        source: e,
                    })?,
                None => {
                    let map = MmapRaw::from(MmapMut::map_anon(new_len as usize).map_err(
                        |e| Error::MapFailed {
                            requested: new_len,
                            source: e,
                        },
                    )?);
                    let copy = cur.min(new_len) as usize;
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            inner.map.as_ptr(),
                            map.as_mut_ptr(),
                            copy,
                        );
                    }
                    map
                }
            };
            inner.map = new_map;
        }

        if let Some(file) = inner.file.as_ref() {
            if new_len < cur {
                file.set_len(new_len).map_err(|e| Error::ResizeFailed {
                    size: cur,
                    requested: new_len,
                    source: e,
                })?;
            }
        }

        self.start.store(inner.map.as_mut_ptr(), Ordering::Release);
        self.len.store(new_len, Ordering::Release);
        debug!("resized region 0x{cur:x} -> 0x{new_len:x} bytes");
        Ok(())
    }

    /// Resize the region, draining readers first. `resize` may shrink;
    /// prefer [`Region::grow`] from inside pinned code.
    pub fn resize(&self, new_size: u64) -> Result<()> {
        assert_eq!(self.is_pinned(), 0, "resize while pinned would deadlock");
        let _ex = self.gc.exclusive();
        self.resize_locked(new_size)
    }

    /// Flush the region to its backing file so that a subsequent open reads
    /// a consistent state at or after this call. Returns the number of
    /// bytes written. File-backed regions only.
    ///
    /// Writers continue concurrently; the flush itself is atomic per page
    /// and the snapshot lock only bars relocating resizes and other
    /// snapshots.
    pub fn snapshot(&self) -> Result<u64> {
        let _serial = self.snapshot_serial.lock().unwrap();
        let inner = self.inner.lock().unwrap();
        if inner.file.is_none() {
            return Err(Error::Logical("snapshot on an anonymous region"));
        }
        // Cross-process: one snapshot at a time per file.
        if let Some(lock) = inner.snapshot_lock.as_ref() {
            lock.lock_exclusive().map_err(Error::Lock)?;
        }
        let res = inner.map.flush().map_err(Error::Sync);
        if let Some(lock) = inner.snapshot_lock.as_ref() {
            let _ = FileExt::unlock(lock);
        }
        res?;
        let written = self.len();
        debug!("snapshot flushed 0x{written:x} bytes");
        Ok(written)
    }

    /// Permanently remove the backing resources. The region itself remains
    /// usable in memory until dropped.
    pub fn unlink(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let Some(path) = inner.path.as_ref() else {
            return Ok(());
        };
        std::fs::remove_file(path).map_err(Error::Open)?;
        for name in ["init", "snapshot"] {
            let _ = std::fs::remove_file(sidecar(path, name));
        }
        warn!("unlinked region {}", path.display());
        Ok(())
    }

    /*************************************************************************/
    /* PER-TRIE GC LOCKS                                                     */
    /*************************************************************************/

    /// Get (creating on first use this session) the gc lock for `id`.
    pub fn gc_lock(&self, id: u32) -> Result<Arc<GcLock>> {
        if id == 0 || id > MAX_GC_ID {
            return Err(Error::Logical("gc lock id out of range"));
        }
        let mut locks = self.trie_gcs.lock().unwrap();
        Ok(locks
            .entry(id)
            .or_insert_with(|| Arc::new(GcLock::new()))
            .clone())
    }

    /// Create a fresh gc lock for `id`. Not thread-safe per id.
    pub fn allocate_gc_lock(&self, id: u32) -> Result<Arc<GcLock>> {
        if id == 0 || id > MAX_GC_ID {
            return Err(Error::Logical("gc lock id out of range"));
        }
        if id <= 32 && self.gc_ids.is_allocated(id - 1) {
            return Err(Error::Logical("gc lock already allocated"));
        }
        if id <= 32 && self.gc_ids.mark_full(id - 1) {
            self.gc_ids.unlock();
        }
        let lock = Arc::new(GcLock::new());
        self.trie_gcs.lock().unwrap().insert(id, lock.clone());
        Ok(lock)
    }

    /// Permanently drop the gc lock for `id`. Not thread-safe per id.
    pub fn unlink_gc_lock(&self, id: u32) -> Result<()> {
        if id == 0 || id > MAX_GC_ID {
            return Err(Error::Logical("gc lock id out of range"));
        }
        if id <= 32 && self.gc_ids.is_allocated(id - 1) && self.gc_ids.mark_not_full(id - 1) {
            self.gc_ids.unlock();
        }
        self.trie_gcs.lock().unwrap().remove(&id);
        Ok(())
    }

    /// A name that identifies this region (for diagnostics).
    pub fn name(&self) -> String {
        match self.inner.lock().unwrap().path.as_ref() {
            Some(p) => p.display().to_string(),
            None => "ANONYMOUS".to_string(),
        }
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{suffix}.lock"));
    path.with_file_name(name)
}

/// Open-and-lock a sidecar file; the lock is released when the returned
/// handle drops.
fn lock_file(path: &Path) -> Result<File> {
    let f = File::options()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(Error::Open)?;
    f.lock_exclusive().map_err(Error::Lock)?;
    Ok(f)
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.lock() {
            if let Some(file) = inner.file.as_ref() {
                let _ = FileExt::unlock(file);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_grow_in_place() {
        let region = Region::anonymous(Region::MIN_SIZE).unwrap();
        let len = region.len();
        region
            .pinned(|| {
                region.ensure(len + 10 * PAGE_SIZE, 8)?;
                Ok(())
            })
            .unwrap();
        assert!(region.len() > len);
    }

    #[test]
    fn pinned_recovers_from_resize_signal() {
        let region = Region::anonymous(Region::MIN_SIZE).unwrap();
        let mut attempts = 0;
        let r: u32 = region
            .pinned(|| {
                attempts += 1;
                if attempts == 1 {
                    Err(Error::RegionResize {
                        size: region.len() + PAGE_SIZE,
                        can_shrink: false,
                    })
                } else {
                    Ok(7)
                }
            })
            .unwrap();
        assert_eq!(r, 7);
        assert_eq!(attempts, 2);
    }

    #[test]
    fn gc_lock_lifecycle() {
        let region = Region::anonymous(Region::MIN_SIZE).unwrap();
        assert!(region.allocate_gc_lock(0).is_err());
        let l = region.allocate_gc_lock(3).unwrap();
        l.lock_shared();
        l.unlock_shared();
        assert!(region.allocate_gc_lock(3).is_err());
        region.unlink_gc_lock(3).unwrap();
        region.allocate_gc_lock(3).unwrap();
    }
}
