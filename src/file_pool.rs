use fs_err as fs;
use std::collections::VecDeque;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// A file handle borrowed from a [`FilePool`], returned to it on drop.
pub struct PooledFileHandle {
    file: Option<fs::File>,
    pool: Arc<FilePoolInner>,
}

impl Drop for PooledFileHandle {
    fn drop(&mut self) {
        // return file handle to pool
        if let Some(file) = self.file.take() {
            self.pool.lock().available_files.push_back(file);
            self.pool.condvar.notify_one();
        }
    }
}

impl PooledFileHandle {
    fn file(&mut self) -> io::Result<&mut fs::File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("pooled file handle already released"))
    }
}

impl Read for PooledFileHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file()?.read(buf)
    }
}

impl Seek for PooledFileHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file()?.seek(pos)
    }
}

struct PoolState {
    available_files: VecDeque<fs::File>,
    active_count: usize,
}

struct FilePoolInner {
    path: PathBuf,
    state: Mutex<PoolState>,
    max_handles: usize,
    condvar: Condvar,
}

impl FilePoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded set of read handles to one file, shared by concurrent readers.
pub struct FilePool {
    inner: Arc<FilePoolInner>,
}

impl FilePool {
    pub fn new<P: Into<PathBuf>>(path: P, max_handles: usize) -> io::Result<Self> {
        let path = path.into();
        // open file once to verify we can
        let file = fs::File::open(&path)?;

        Ok(FilePool {
            inner: Arc::new(FilePoolInner {
                path,
                state: Mutex::new(PoolState {
                    available_files: VecDeque::from([file]),
                    active_count: 1,
                }),
                max_handles: max_handles.max(1),
                condvar: Condvar::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Takes an idle handle, opening a new one while under the limit and
    /// blocking otherwise.
    pub fn acquire(&self) -> io::Result<PooledFileHandle> {
        let mut state = self.inner.lock();

        loop {
            // grab an available handle if exists
            if let Some(mut file) = state.available_files.pop_front() {
                file.seek(SeekFrom::Start(0))?;
                return Ok(PooledFileHandle {
                    file: Some(file),
                    pool: self.inner.clone(),
                });
            }

            // open a new handle if max is not reached
            if state.active_count < self.inner.max_handles {
                let file = fs::File::open(&self.inner.path)?;
                state.active_count += 1;
                return Ok(PooledFileHandle {
                    file: Some(file),
                    pool: self.inner.clone(),
                });
            }

            // must wait for an available handle
            state = self
                .inner
                .condvar
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn open_handles(&self) -> usize {
        self.inner.lock().active_count
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_bounded_handles() -> io::Result<()> {
        let mut temp = tempfile::NamedTempFile::new()?;
        temp.write_all(b"0123456789")?;
        let pool = FilePool::new(temp.path(), 2)?;

        let mut a = pool.acquire()?;
        let mut b = pool.acquire()?;
        assert_eq!(pool.open_handles(), 2);

        a.seek(SeekFrom::Start(4))?;
        let mut buf = [0; 2];
        a.read_exact(&mut buf)?;
        assert_eq!(&buf, b"45");
        b.read_exact(&mut buf)?;
        assert_eq!(&buf, b"01");

        let pool = Arc::new(pool);
        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || -> io::Result<u8> {
                let mut c = pool.acquire()?;
                let mut byte = [0; 1];
                c.read_exact(&mut byte)?;
                Ok(byte[0])
            })
        };
        drop(a);
        // reused handles are rewound
        assert_eq!(waiter.join().unwrap()?, b'0');
        assert_eq!(pool.open_handles(), 2);
        drop(b);
        Ok(())
    }
}
