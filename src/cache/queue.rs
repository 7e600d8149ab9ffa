//! Bounded FIFO store: last N payloads per key

use crate::cache::PduCache;
use crate::error::{Error, Result};
use crate::types::PduResolvedKey;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Cache keeping the last `depth` payloads per key. Reads pop the oldest
/// entry; when the queue overflows the oldest entry is dropped before the
/// write returns.
pub struct QueueCache {
    running: AtomicBool,
    depth: AtomicUsize,
    queues: Mutex<HashMap<PduResolvedKey, VecDeque<Vec<u8>>>>,
}

impl Default for QueueCache {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(false),
            depth: AtomicUsize::new(1),
            queues: Mutex::new(HashMap::new()),
        }
    }
}

impl QueueCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PduCache for QueueCache {
    fn open(&self, config_path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(config_path)
            .map_err(|_| Error::FileNotFound(config_path.display().to_string()))?;
        let config: serde_json::Value = serde_json::from_str(&text)?;

        let mut depth = 1usize;
        if let Some(value) = config.pointer("/store/depth") {
            depth = value.as_u64().ok_or_else(|| {
                Error::InvalidConfig("store.depth must be an integer".to_string())
            })? as usize;
        }
        // depth must be >= 1
        if depth == 0 {
            depth = 1;
        }
        self.depth.store(depth, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.queues.lock().clear();
        self.running.store(false, Ordering::SeqCst);
    }

    fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn write(&self, key: &PduResolvedKey, data: &[u8]) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        let depth = self.depth.load(Ordering::SeqCst);
        let mut queues = self.queues.lock();
        let queue = queues.entry(key.clone()).or_default();
        queue.push_back(data.to_vec());
        while queue.len() > depth {
            queue.pop_front();
        }
        Ok(())
    }

    fn read(&self, key: &PduResolvedKey, buf: &mut [u8]) -> Result<usize> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        let mut queues = self.queues.lock();
        let queue = queues.get_mut(key).ok_or(Error::NoEntry)?;
        let src = queue.front().ok_or(Error::NoEntry)?;
        if buf.len() < src.len() {
            // leave the head in place so a retry with a larger buffer works
            return Err(Error::NoSpace {
                required: src.len(),
            });
        }
        buf[..src.len()].copy_from_slice(src);
        let len = src.len();
        queue.pop_front();
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn key() -> PduResolvedKey {
        PduResolvedKey::new("robot2", 2)
    }

    fn cache_with_depth(depth: usize) -> QueueCache {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"type":"buffer","store":{{"mode":"queue","depth":{}}}}}"#,
            depth
        )
        .unwrap();
        let cache = QueueCache::new();
        cache.open(file.path()).unwrap();
        cache.start();
        cache
    }

    #[test]
    fn test_fifo_order() {
        let cache = cache_with_depth(4);
        for byte in [0x11u8, 0x22, 0x33] {
            cache.write(&key(), &[byte]).unwrap();
        }
        let mut buf = [0u8; 4];
        assert_eq!(cache.read(&key(), &mut buf).unwrap(), 1);
        assert_eq!(buf[0], 0x11);
        cache.read(&key(), &mut buf).unwrap();
        assert_eq!(buf[0], 0x22);
        cache.read(&key(), &mut buf).unwrap();
        assert_eq!(buf[0], 0x33);
        assert!(matches!(cache.read(&key(), &mut buf), Err(Error::NoEntry)));
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let cache = cache_with_depth(3);
        for byte in [0x11u8, 0x22, 0x33, 0x44] {
            cache.write(&key(), &[byte]).unwrap();
        }
        let mut buf = [0u8; 4];
        cache.read(&key(), &mut buf).unwrap();
        assert_eq!(buf[0], 0x22);
        cache.read(&key(), &mut buf).unwrap();
        assert_eq!(buf[0], 0x33);
        cache.read(&key(), &mut buf).unwrap();
        assert_eq!(buf[0], 0x44);
        assert!(matches!(cache.read(&key(), &mut buf), Err(Error::NoEntry)));
    }

    #[test]
    fn test_small_buffer_keeps_head() {
        let cache = cache_with_depth(2);
        cache.write(&key(), &[1, 2, 3]).unwrap();

        let mut small = [0u8; 1];
        assert!(matches!(
            cache.read(&key(), &mut small),
            Err(Error::NoSpace { required: 3 })
        ));

        // head still present after the failed read
        let mut buf = [0u8; 8];
        assert_eq!(cache.read(&key(), &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_depth_zero_normalized() {
        let cache = cache_with_depth(0);
        cache.write(&key(), &[1]).unwrap();
        cache.write(&key(), &[2]).unwrap();
        let mut buf = [0u8; 4];
        cache.read(&key(), &mut buf).unwrap();
        assert_eq!(buf[0], 2);
    }

    #[test]
    fn test_missing_config_file() {
        let cache = QueueCache::new();
        assert!(matches!(
            cache.open(Path::new("/nonexistent/cache.json")),
            Err(Error::FileNotFound(_))
        ));
    }

    #[test]
    fn test_depth_defaults_to_one() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"type":"buffer","store":{{"mode":"queue"}}}}"#).unwrap();
        let cache = QueueCache::new();
        cache.open(file.path()).unwrap();
        cache.start();
        cache.write(&key(), &[1]).unwrap();
        cache.write(&key(), &[2]).unwrap();
        let mut buf = [0u8; 4];
        cache.read(&key(), &mut buf).unwrap();
        assert_eq!(buf[0], 2);
    }
}
