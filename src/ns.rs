use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::sync::Arc;

/// The capability set a BTT instance needs from its backing store.
///
/// Every operation carries the caller's lane so implementations may shard
/// file descriptors or I/O queues per concurrent thread; the built-in
/// namespaces ignore it.
///
/// `write` must be durable on return: once the call completes the bytes are
/// visible to any subsequent `read` and survive power loss. `map` hands out a
/// direct window into the store and may return fewer bytes than asked;
/// callers loop. A window stays valid for the life of the namespace and is
/// flushed with `sync`.
pub trait Namespace: Sync {
    fn read(&self, lane: u32, buf: &mut [u8], off: u64) -> io::Result<()>;
    fn write(&self, lane: u32, buf: &[u8], off: u64) -> io::Result<()>;
    fn map(&self, lane: u32, len: usize, off: u64) -> io::Result<(*mut u8, usize)>;
    fn sync(&self, lane: u32, ptr: *mut u8, len: usize) -> io::Result<()>;
}

fn check_range(size: usize, off: u64, len: usize) -> io::Result<usize> {
    let off = off as usize;
    if off.checked_add(len).map_or(true, |end| end > size) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("range {}+{} outside namespace of {} bytes", off, len, size),
        ));
    }
    Ok(off)
}

/// Volatile in-memory namespace.
///
/// Clones share the same buffer, so a "reopened" instance over a clone sees
/// every durable write the previous instance made. This is what the crash
/// tests build on.
#[derive(Clone)]
pub struct MemNamespace {
    inner: Arc<MemInner>,
}

struct MemInner {
    buf: UnsafeCell<Box<[u8]>>,
}

// Concurrent lanes address disjoint blocks; racing byte ranges are the
// caller's bug, same as racing pwrites on a shared fd.
unsafe impl Sync for MemInner {}
unsafe impl Send for MemInner {}

impl MemNamespace {
    pub fn new(size: usize) -> Self {
        Self {
            inner: Arc::new(MemInner {
                buf: UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
            }),
        }
    }

    pub fn size(&self) -> usize {
        unsafe { (&*self.inner.buf.get()).len() }
    }

    fn base(&self) -> *mut u8 {
        unsafe { (*self.inner.buf.get()).as_mut_ptr() }
    }
}

impl Namespace for MemNamespace {
    fn read(&self, _lane: u32, buf: &mut [u8], off: u64) -> io::Result<()> {
        let off = check_range(self.size(), off, buf.len())?;
        unsafe {
            // Aligned 4-byte accesses are atomic, matching the torn-write
            // granularity of real block media. Map entries are read
            // lock-free while a writer updates them.
            if buf.len() == 4 && off % 4 == 0 {
                let word = (*(self.base().add(off) as *const std::sync::atomic::AtomicU32))
                    .load(std::sync::atomic::Ordering::SeqCst);
                buf.copy_from_slice(&word.to_ne_bytes());
            } else {
                std::ptr::copy_nonoverlapping(self.base().add(off), buf.as_mut_ptr(), buf.len());
            }
        }
        Ok(())
    }

    fn write(&self, _lane: u32, buf: &[u8], off: u64) -> io::Result<()> {
        let off = check_range(self.size(), off, buf.len())?;
        unsafe {
            if buf.len() == 4 && off % 4 == 0 {
                let word = u32::from_ne_bytes(buf.try_into().unwrap());
                (*(self.base().add(off) as *const std::sync::atomic::AtomicU32))
                    .store(word, std::sync::atomic::Ordering::SeqCst);
            } else {
                std::ptr::copy_nonoverlapping(buf.as_ptr(), self.base().add(off), buf.len());
            }
        }
        Ok(())
    }

    fn map(&self, _lane: u32, len: usize, off: u64) -> io::Result<(*mut u8, usize)> {
        let size = self.size();
        let off = check_range(size, off, 1)?;
        Ok((unsafe { self.base().add(off) }, len.min(size - off)))
    }

    fn sync(&self, _lane: u32, _ptr: *mut u8, _len: usize) -> io::Result<()> {
        Ok(())
    }
}

fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, fail: T) -> io::Result<T> {
    let ret = f();
    if ret == fail {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// File-backed namespace.
///
/// The fd is opened with `O_SYNC` so `write` is durable on return; the whole
/// file is mapped once and `map` hands out windows into that mapping.
pub struct FileNamespace {
    file: File,
    base: *mut u8,
    size: usize,
}

unsafe impl Sync for FileNamespace {}
unsafe impl Send for FileNamespace {}

impl FileNamespace {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)?;
        let size = file.metadata()?.len() as usize;
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot use an empty file as a namespace",
            ));
        }
        let base = wrap_libc_call(
            &|| unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    file.as_raw_fd(),
                    0,
                )
            },
            libc::MAP_FAILED,
        )?;
        Ok(Self {
            file,
            base: base as *mut u8,
            size,
        })
    }

    /// Create (or truncate) a file of `size` bytes and open it.
    pub fn create(path: impl AsRef<Path>, size: u64) -> io::Result<Self> {
        let file = File::create(&path)?;
        file.set_len(size)?;
        drop(file);
        Self::open(path)
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Namespace for FileNamespace {
    fn read(&self, _lane: u32, buf: &mut [u8], off: u64) -> io::Result<()> {
        check_range(self.size, off, buf.len())?;
        self.file.read_exact_at(buf, off)
    }

    fn write(&self, _lane: u32, buf: &[u8], off: u64) -> io::Result<()> {
        check_range(self.size, off, buf.len())?;
        self.file.write_all_at(buf, off)
    }

    fn map(&self, _lane: u32, len: usize, off: u64) -> io::Result<(*mut u8, usize)> {
        let off = check_range(self.size, off, 1)?;
        Ok((unsafe { self.base.add(off) }, len.min(self.size - off)))
    }

    fn sync(&self, _lane: u32, ptr: *mut u8, len: usize) -> io::Result<()> {
        // msync wants a page-aligned address.
        let addr = ptr as usize;
        let page = 4096;
        let aligned = addr & !(page - 1);
        wrap_libc_call(
            &|| unsafe {
                libc::msync(
                    aligned as *mut libc::c_void,
                    len + (addr - aligned),
                    libc::MS_SYNC,
                )
            },
            -1,
        )?;
        Ok(())
    }
}

impl Drop for FileNamespace {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_namespace_rw() {
        let ns = MemNamespace::new(8192);
        ns.write(0, &[1, 2, 3, 4], 100).unwrap();
        let mut buf = [0u8; 4];
        ns.read(0, &mut buf, 100).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        // A clone shares storage.
        let other = ns.clone();
        other.read(1, &mut buf, 100).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        // Out of range fails.
        assert!(ns.read(0, &mut buf, 8190).is_err());
        assert!(ns.write(0, &[0u8; 5], 8190).is_err());
    }

    #[test]
    fn test_mem_namespace_map_window() {
        let ns = MemNamespace::new(4096);
        let (ptr, len) = ns.map(0, 8192, 1024).unwrap();
        // The window is clipped to the end of the namespace.
        assert_eq!(len, 3072);
        unsafe { *ptr = 0x5A };
        let mut buf = [0u8; 1];
        ns.read(0, &mut buf, 1024).unwrap();
        assert_eq!(buf[0], 0x5A);
    }
}
