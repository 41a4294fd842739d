use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{config::StoreConfig, store::Store};

static NEXT_DIR: AtomicUsize = AtomicUsize::new(0);

/// Scratch directory removed together with everything in it on drop.
pub struct TestDir {
    path: PathBuf,
}

impl TestDir {
    pub fn new<P>(path: P) -> Self
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    /// A fresh directory under the system temp dir, unique per process and
    /// per call.
    pub fn temp(prefix: &str) -> Self {
        let n = NEXT_DIR.fetch_add(1, Ordering::Relaxed);
        Self::new(std::env::temp_dir().join(format!(
            "straitdb-{prefix}-{}-{n}",
            std::process::id()
        )))
    }

    /// Creates a store in this directory.
    pub fn store(&self, config: StoreConfig) -> Store {
        Store::create(self.path.join("db"), config).unwrap()
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

impl AsRef<Path> for TestDir {
    fn as_ref(&self) -> &Path {
        self.path.as_ref()
    }
}
