use std::collections::HashMap;

/// Sets `STATEWARDEN_*` variables for one test and puts the previous values
/// back when dropped.  Hold the test's env mutex for the guard's lifetime.
pub struct EnvGuard {
    saved: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        let mut guard = Self {
            saved: HashMap::new(),
        };
        // start from a known baseline
        let inherited: Vec<String> = std::env::vars()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with("STATEWARDEN_") || key.starts_with("METRICS_LOG_"))
            .collect();
        for key in inherited {
            guard.remove(&key);
        }
        guard
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.save(key);
        std::env::set_var(key, value);
    }

    pub fn remove(&mut self, key: &str) {
        self.save(key);
        std::env::remove_var(key);
    }

    fn save(&mut self, key: &str) {
        self.saved
            .entry(key.to_string())
            .or_insert_with(|| std::env::var(key).ok());
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in self.saved.drain() {
            match value {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}
