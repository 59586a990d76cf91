#[cfg(test)]
pub mod env {
    use once_cell::sync::Lazy;
    use std::collections::BTreeMap;
    use std::sync::{Mutex, MutexGuard};

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    /// Exclusive access to the process environment for one test.
    ///
    /// Every `PROJSYNC_*` variable is snapshotted and unset on entry, so a test
    /// starts from defaults; the snapshot is restored on drop.
    pub struct EnvScope {
        _lock: MutexGuard<'static, ()>,
        snapshot: BTreeMap<String, String>,
    }

    pub fn scope() -> EnvScope {
        let lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let snapshot: BTreeMap<String, String> = std::env::vars()
            .filter(|(key, _)| key.starts_with("PROJSYNC_"))
            .collect();
        for key in snapshot.keys() {
            std::env::remove_var(key);
        }
        EnvScope {
            _lock: lock,
            snapshot,
        }
    }

    impl EnvScope {
        pub fn set(&mut self, key: &str, value: &str) -> &mut Self {
            std::env::set_var(key, value);
            self
        }
    }

    impl Drop for EnvScope {
        fn drop(&mut self) {
            let touched: Vec<String> = std::env::vars()
                .map(|(key, _)| key)
                .filter(|key| key.starts_with("PROJSYNC_"))
                .collect();
            for key in touched {
                std::env::remove_var(key);
            }
            for (key, value) in &self.snapshot {
                std::env::set_var(key, value);
            }
        }
    }
}
